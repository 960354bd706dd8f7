//! Command and reply encoding for the actuator controller
//!
//! A command is the decimal class id, or the reserved emergency code, on its
//! own line. The controller answers with a ready sentinel once it has
//! finished a motion. Controller firmware revisions have also used a reply
//! to announce the end of a fast-stop; that one is optional and must differ
//! from the ready sentinel so the two are never confused.

/// Default emergency stop command
pub const DEFAULT_EMERGENCY_CODE: u8 = 9;

/// Default "ready for the next command" reply
pub const DEFAULT_READY_REPLY: &str = "42";

/// Reply lines understood by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorReply {
    /// Motion finished, the next command may be sent
    Ready,
    /// The controller left its fast-stop condition
    EmergencyCleared,
    /// Anything else: garbled or unknown
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorProtocol {
    /// Command that stops the actuator immediately
    pub emergency_code: u8,
    /// Reply meaning the previous command completed
    pub ready_reply: String,
    /// Reply meaning the fast-stop condition ended
    pub emergency_cleared_reply: Option<String>,
}

impl Default for ActuatorProtocol {
    fn default() -> Self {
        Self {
            emergency_code: DEFAULT_EMERGENCY_CODE,
            ready_reply: DEFAULT_READY_REPLY.to_string(),
            emergency_cleared_reply: None,
        }
    }
}

impl ActuatorProtocol {
    /// Command line (without terminator) for a class id
    pub fn class_command(&self, class_id: u8) -> String {
        class_id.to_string()
    }

    pub fn emergency_command(&self) -> String {
        self.emergency_code.to_string()
    }

    /// True if sending `class_id` would be read as the emergency command
    pub fn is_reserved(&self, class_id: u8) -> bool {
        class_id == self.emergency_code
    }

    pub fn parse_reply(&self, line: &str) -> ActuatorReply {
        let line = line.trim();
        if line == self.ready_reply {
            ActuatorReply::Ready
        } else if self.emergency_cleared_reply.as_deref() == Some(line) {
            ActuatorReply::EmergencyCleared
        } else {
            ActuatorReply::Other(line.to_string())
        }
    }

    /// Reject sentinel setups the dispatcher could not tell apart.
    pub fn validate(&self) -> Result<(), String> {
        if self.emergency_code == crate::control::NO_DETECTION {
            return Err("emergency code 0 is the no-detection class".into());
        }
        if self.ready_reply.trim().is_empty() {
            return Err("ready reply must not be empty".into());
        }
        if let Some(cleared) = &self.emergency_cleared_reply {
            if cleared.trim() == self.ready_reply.trim() {
                return Err(format!(
                    "emergency-cleared reply {cleared:?} must differ from the ready reply"
                ));
            }
        }
        Ok(())
    }
}
