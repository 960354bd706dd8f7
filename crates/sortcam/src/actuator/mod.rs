//! Half-duplex line link to the actuator controller
//!
//! Commands go out as newline-terminated ASCII lines; the controller answers
//! with reply lines. The [`ActuatorLink`] trait is what the dispatcher
//! drives: the serial implementation talks to real hardware, the memory
//! implementation is a loopback for tests and bench runs.

mod line;
pub mod memory;
pub mod protocol;
#[cfg(feature = "serial")]
pub mod serial;

pub use line::{LineBuffer, MAX_LINE_LEN};
pub use memory::{MemoryLink, MemoryPeer};
pub use protocol::{ActuatorProtocol, ActuatorReply};
#[cfg(feature = "serial")]
pub use serial::{SerialActuator, SerialConfig};

use thiserror::Error;

/// Failures reported by an actuator link. Never retried by the link itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    /// The device is gone (unplugged, closed, I/O failure). Fatal for the
    /// control loop.
    #[error("actuator device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The command could not be flushed within the configured bound.
    #[error("actuator write timed out")]
    WriteTimeout,
}

impl ActuatorError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ActuatorError::DeviceUnavailable(_))
    }
}

/// A line-oriented link to the actuator.
///
/// None of these calls may block indefinitely: `try_send` is bounded by
/// the link's write timeout, the other two never wait for data.
pub trait ActuatorLink {
    /// Write `command` followed by a newline and flush it.
    fn try_send(&mut self, command: &str) -> Result<(), ActuatorError>;

    /// Return one complete reply line if available. Partial lines stay
    /// buffered until their terminator arrives.
    fn poll_incoming(&mut self) -> Result<Option<String>, ActuatorError>;

    /// Bytes waiting to be read from the device.
    fn bytes_available(&mut self) -> Result<usize, ActuatorError>;
}

impl<L: ActuatorLink + ?Sized> ActuatorLink for Box<L> {
    fn try_send(&mut self, command: &str) -> Result<(), ActuatorError> {
        (**self).try_send(command)
    }

    fn poll_incoming(&mut self) -> Result<Option<String>, ActuatorError> {
        (**self).poll_incoming()
    }

    fn bytes_available(&mut self) -> Result<usize, ActuatorError> {
        (**self).bytes_available()
    }
}
