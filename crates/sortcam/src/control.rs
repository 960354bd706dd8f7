//! Classification events and the shared control state they fold into
//!
//! The ingestion endpoint writes, the dispatcher reads and clears. Every
//! accessor takes the lock for a single short update so neither side can
//! stall the other.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

/// Class id meaning "nothing detected"
pub const NO_DETECTION: u8 = 0;

/// One classification submitted by the detection client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationEvent {
    /// Detected class (0 = no detection)
    pub class_id: u8,
    /// Request an immediate actuator stop
    pub fast_stop: bool,
}

/// Reasons a raw classification cannot become an event
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidEvent {
    #[error("class_id must be a finite number, got {0}")]
    NotFinite(f64),
    #[error("class_id must not be negative, got {0}")]
    Negative(f64),
    #[error("class_id {0} is out of range (max 255)")]
    OutOfRange(f64),
}

impl ClassificationEvent {
    pub fn new(class_id: u8, fast_stop: bool) -> Self {
        Self {
            class_id,
            fast_stop,
        }
    }

    /// Build an event from the numeric wire fields.
    ///
    /// Detection clients send class ids as floats (`3.0`); the fractional
    /// part is truncated. Any non-zero `fast_stop` means stop.
    pub fn from_wire(class_id: f64, fast_stop: f64) -> Result<Self, InvalidEvent> {
        if !class_id.is_finite() {
            return Err(InvalidEvent::NotFinite(class_id));
        }
        if class_id < 0.0 {
            return Err(InvalidEvent::Negative(class_id));
        }
        let truncated = class_id.trunc();
        if truncated > f64::from(u8::MAX) {
            return Err(InvalidEvent::OutOfRange(class_id));
        }
        Ok(Self {
            class_id: truncated as u8,
            fast_stop: fast_stop != 0.0 && !fast_stop.is_nan(),
        })
    }
}

/// Point-in-time copy of the control state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlSnapshot {
    /// Last non-zero class received since the previous command was issued
    pub predicted_class: u8,
    /// False while a command is on the wire without an acknowledgement
    pub accepting: bool,
    /// A fast-stop is pending for the next dispatch cycle
    pub emergency: bool,
}

impl Default for ControlSnapshot {
    fn default() -> Self {
        Self {
            predicted_class: NO_DETECTION,
            accepting: true,
            emergency: false,
        }
    }
}

/// Shared handle to the control state. Clones refer to the same state.
#[derive(Debug, Clone, Default)]
pub struct ControlState {
    inner: Arc<Mutex<ControlSnapshot>>,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a classification in. Returns the current `accepting` flag so the
    /// client can throttle itself.
    pub fn fold(&self, event: ClassificationEvent) -> bool {
        let mut state = self.lock();
        if event.class_id != NO_DETECTION {
            state.predicted_class = event.class_id;
        }
        state.emergency = event.fast_stop;
        state.accepting
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        *self.lock()
    }

    pub fn accepting(&self) -> bool {
        self.lock().accepting
    }

    pub fn emergency_pending(&self) -> bool {
        self.lock().emergency
    }

    /// Class waiting to be issued, if any
    pub fn pending_class(&self) -> Option<u8> {
        let class_id = self.lock().predicted_class;
        (class_id != NO_DETECTION).then_some(class_id)
    }

    /// The emergency command reached the actuator.
    pub fn clear_emergency(&self) {
        self.lock().emergency = false;
    }

    /// `class_id` was written to the actuator: stop accepting until it acks.
    ///
    /// The pending class is only cleared if it is still the one that was
    /// issued; a different class that arrived during the write is held.
    pub fn mark_issued(&self, class_id: u8) {
        let mut state = self.lock();
        state.accepting = false;
        if state.predicted_class == class_id {
            state.predicted_class = NO_DETECTION;
        }
    }

    /// The actuator signalled it is ready for the next command.
    pub fn mark_ready(&self) {
        self.lock().accepting = true;
    }

    /// The actuator is gone; nothing will acknowledge further commands.
    pub fn mark_unavailable(&self) {
        self.lock().accepting = false;
    }
}
