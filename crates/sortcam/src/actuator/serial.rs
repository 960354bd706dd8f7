//! serialport-backed actuator link
//!
//! Arduino-class controllers reset when the port is opened, so the link
//! waits out a settle delay and throws away whatever boot chatter arrived
//! before the first command.
//!
//! A write that times out part way leaves a fragment on the line. The next
//! command is then preceded by a bare newline so the controller discards
//! the fragment instead of reading it as a prefix.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info};

use super::{ActuatorError, ActuatorLink, LineBuffer};

/// Largest single read from the device
const READ_CHUNK: usize = 1024;

/// Serial link configuration
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyACM0`
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound on a single write + flush
    pub timeout: Duration,
    /// Wait after opening before the first command
    pub settle_delay: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            timeout: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// Byte access the link needs from a port
pub(crate) trait PortIo: Read + Write + Send {
    fn bytes_to_read(&self) -> io::Result<u32>;
}

impl PortIo for Box<dyn SerialPort> {
    fn bytes_to_read(&self) -> io::Result<u32> {
        SerialPort::bytes_to_read(&**self).map_err(io::Error::other)
    }
}

pub struct SerialActuator {
    port: Box<dyn PortIo>,
    path: String,
    lines: LineBuffer,
    /// Part of a command went out without its terminator
    line_dirty: bool,
}

impl SerialActuator {
    /// Open the device, wait for it to settle and clear stale input.
    pub fn open(config: &SerialConfig) -> Result<Self, ActuatorError> {
        let port = serialport::new(&config.path, config.baud_rate)
            .timeout(config.timeout)
            .open()
            .map_err(|e| unavailable(&config.path, e))?;

        info!(
            path = %config.path,
            baud = config.baud_rate,
            settle_ms = config.settle_delay.as_millis() as u64,
            "Serial port opened"
        );
        std::thread::sleep(config.settle_delay);
        port.clear(ClearBuffer::Input)
            .map_err(|e| unavailable(&config.path, e))?;

        Ok(Self::from_port(Box::new(port), &config.path))
    }

    /// Wrap an already opened port.
    pub(crate) fn from_port(port: Box<dyn PortIo>, path: &str) -> Self {
        Self {
            port,
            path: path.to_string(),
            lines: LineBuffer::new(),
            line_dirty: false,
        }
    }

    /// Write `line` in full, tracking whether a fragment was left behind.
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == line.len() {
                break Ok(());
            }
            match self.port.write(&line[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        if written == line.len() {
            self.line_dirty = false;
        } else if written > 0 {
            self.line_dirty = true;
        }
        result?;
        self.port.flush()
    }

    fn classify_write(&self, err: io::Error) -> ActuatorError {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ActuatorError::WriteTimeout,
            _ => unavailable(&self.path, err),
        }
    }
}

fn unavailable(path: &str, err: impl std::fmt::Display) -> ActuatorError {
    ActuatorError::DeviceUnavailable(format!("{path}: {err}"))
}

impl ActuatorLink for SerialActuator {
    fn try_send(&mut self, command: &str) -> Result<(), ActuatorError> {
        let line = if self.line_dirty {
            debug!(path = %self.path, "Terminating partial command");
            format!("\n{command}\n")
        } else {
            format!("{command}\n")
        };
        self.write_line(line.as_bytes())
            .map_err(|e| self.classify_write(e))?;
        debug!(path = %self.path, command, "Serial command written");
        Ok(())
    }

    fn poll_incoming(&mut self) -> Result<Option<String>, ActuatorError> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }
        let available = self.bytes_available()?;
        if available == 0 {
            return Ok(None);
        }

        let mut buf = vec![0u8; available.min(READ_CHUNK)];
        match self.port.read(&mut buf) {
            Ok(0) => Err(unavailable(&self.path, "end of stream")),
            Ok(n) => {
                self.lines.push(&buf[..n]);
                Ok(self.lines.next_line())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(unavailable(&self.path, e)),
        }
    }

    fn bytes_available(&mut self) -> Result<usize, ActuatorError> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| unavailable(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::control::{ClassificationEvent, ControlState};
    use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherState};

    /// Port that accepts a limited number of bytes, then times out
    #[derive(Clone, Default)]
    struct FlakyPort {
        inner: Arc<Mutex<FlakyWire>>,
    }

    #[derive(Default)]
    struct FlakyWire {
        wire: Vec<u8>,
        /// Bytes accepted before writes time out; `None` is unlimited
        budget: Option<usize>,
    }

    impl FlakyPort {
        fn set_budget(&self, budget: Option<usize>) {
            self.inner.lock().unwrap().budget = budget;
        }

        fn wire(&self) -> Vec<u8> {
            self.inner.lock().unwrap().wire.clone()
        }
    }

    impl Read for FlakyPort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for FlakyPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut guard = self.inner.lock().unwrap();
            let wire = &mut *guard;
            let accepted = match wire.budget {
                Some(0) => return Err(io::Error::from(io::ErrorKind::TimedOut)),
                // One byte per call, the way a congested UART drains
                Some(ref mut budget) => {
                    *budget -= 1;
                    1
                }
                None => buf.len(),
            };
            wire.wire.extend_from_slice(&buf[..accepted]);
            Ok(accepted)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl PortIo for FlakyPort {
        fn bytes_to_read(&self) -> io::Result<u32> {
            Ok(0)
        }
    }

    fn flaky_link() -> (SerialActuator, FlakyPort) {
        let port = FlakyPort::default();
        let link = SerialActuator::from_port(Box::new(port.clone()), "flaky");
        (link, port)
    }

    #[test]
    fn partial_write_is_terminated_before_the_retry() {
        let (mut link, port) = flaky_link();
        port.set_budget(Some(1));
        assert_eq!(link.try_send("9"), Err(ActuatorError::WriteTimeout));
        assert_eq!(port.wire(), b"9");

        port.set_budget(None);
        link.try_send("9").unwrap();
        assert_eq!(port.wire(), b"9\n9\n");

        // Clean again afterwards
        link.try_send("4").unwrap();
        assert_eq!(port.wire(), b"9\n9\n4\n");
    }

    #[test]
    fn line_stays_dirty_until_a_retry_gets_through() {
        let (mut link, port) = flaky_link();
        port.set_budget(Some(1));
        assert!(link.try_send("9").is_err());
        port.set_budget(Some(0));
        assert!(link.try_send("9").is_err());

        port.set_budget(None);
        link.try_send("9").unwrap();
        assert_eq!(port.wire(), b"9\n9\n");
    }

    #[test]
    fn failure_before_any_byte_needs_no_terminator() {
        let (mut link, port) = flaky_link();
        port.set_budget(Some(0));
        assert_eq!(link.try_send("3"), Err(ActuatorError::WriteTimeout));

        port.set_budget(None);
        link.try_send("3").unwrap();
        assert_eq!(port.wire(), b"3\n");
    }

    #[test]
    fn retried_emergency_never_doubles_up_on_the_wire() {
        let (link, port) = flaky_link();
        let control = ControlState::new();
        let mut dispatcher = Dispatcher::new(link, control.clone(), DispatcherConfig::default());
        control.fold(ClassificationEvent::new(0, true));

        port.set_budget(Some(1));
        dispatcher.cycle().unwrap();
        assert!(control.emergency_pending());

        port.set_budget(None);
        assert_eq!(dispatcher.cycle().unwrap(), DispatcherState::Emergency);
        let wire = port.wire();
        assert_eq!(wire, b"9\n9\n");
        assert!(!wire.windows(3).any(|w| w == b"99\n"));
    }

    #[test]
    fn default_config_matches_controller_firmware() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.path, "/dev/ttyACM0");
    }

    #[test]
    fn missing_device_is_unavailable() {
        let config = SerialConfig {
            path: "/dev/sortcam-does-not-exist".into(),
            settle_delay: Duration::ZERO,
            ..Default::default()
        };
        match SerialActuator::open(&config) {
            Err(err) => assert!(err.is_fatal()),
            Ok(_) => panic!("opened a device that does not exist"),
        }
    }
}
