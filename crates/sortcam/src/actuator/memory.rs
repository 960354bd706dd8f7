//! In-memory actuator link
//!
//! [`MemoryLink::pair`] returns the dispatcher side and a [`MemoryPeer`]
//! that plays the controller: it sees every command written and can inject
//! replies, write stalls, or a disconnect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ActuatorError, ActuatorLink, LineBuffer};

#[derive(Debug, Default)]
struct Wire {
    /// Bytes written by the dispatcher side
    outbound: Vec<u8>,
    /// Bytes written by the peer, not yet read
    inbound: Vec<u8>,
    stalled: bool,
    disconnected: bool,
}

fn lock(wire: &Mutex<Wire>) -> MutexGuard<'_, Wire> {
    wire.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dispatcher side of an in-memory link
#[derive(Debug)]
pub struct MemoryLink {
    wire: Arc<Mutex<Wire>>,
    lines: LineBuffer,
}

/// Controller side of an in-memory link
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    wire: Arc<Mutex<Wire>>,
}

impl MemoryLink {
    pub fn pair() -> (MemoryLink, MemoryPeer) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        (
            MemoryLink {
                wire: Arc::clone(&wire),
                lines: LineBuffer::new(),
            },
            MemoryPeer { wire },
        )
    }

    fn check_connected(wire: &Wire) -> Result<(), ActuatorError> {
        if wire.disconnected {
            Err(ActuatorError::DeviceUnavailable("memory link closed".into()))
        } else {
            Ok(())
        }
    }
}

impl ActuatorLink for MemoryLink {
    fn try_send(&mut self, command: &str) -> Result<(), ActuatorError> {
        let mut wire = lock(&self.wire);
        Self::check_connected(&wire)?;
        if wire.stalled {
            return Err(ActuatorError::WriteTimeout);
        }
        wire.outbound.extend_from_slice(command.as_bytes());
        wire.outbound.push(b'\n');
        Ok(())
    }

    fn poll_incoming(&mut self) -> Result<Option<String>, ActuatorError> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }
        let pending = {
            let mut wire = lock(&self.wire);
            Self::check_connected(&wire)?;
            std::mem::take(&mut wire.inbound)
        };
        self.lines.push(&pending);
        Ok(self.lines.next_line())
    }

    fn bytes_available(&mut self) -> Result<usize, ActuatorError> {
        let wire = lock(&self.wire);
        Self::check_connected(&wire)?;
        Ok(wire.inbound.len())
    }
}

impl MemoryPeer {
    /// Everything the dispatcher has written so far
    pub fn sent_raw(&self) -> Vec<u8> {
        lock(&self.wire).outbound.clone()
    }

    /// Drain written commands as lines (terminators removed)
    pub fn take_sent(&self) -> Vec<String> {
        let raw = std::mem::take(&mut lock(&self.wire).outbound);
        String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Send a full reply line
    pub fn reply(&self, line: &str) {
        let mut wire = lock(&self.wire);
        wire.inbound.extend_from_slice(line.as_bytes());
        wire.inbound.push(b'\n');
    }

    /// Send raw bytes, e.g. half a line
    pub fn write_raw(&self, bytes: &[u8]) {
        lock(&self.wire).inbound.extend_from_slice(bytes);
    }

    /// Make every write time out until cleared
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.wire).stalled = stalled;
    }

    /// Unplug the device: all further calls fail
    pub fn disconnect(&self) {
        lock(&self.wire).disconnected = true;
    }
}
