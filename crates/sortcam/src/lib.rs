//! sortcam - camera-driven sorting station
//!
//! Streams the live camera feed to any number of browsers as MJPEG, accepts
//! classification results from a detection client over HTTP, and relays
//! them to a serial actuator controller one command at a time. Feature flags
//! control which modules are compiled:
//!
//! - **Core** (always available): frame buffer, control state, actuator link
//!   trait and protocol, dispatcher
//! - **`serial`**: serialport-backed actuator link
//! - **`capture`**: external MJPEG camera command adapter
//! - **`test-source`**: synthetic frames without hardware (implies `capture`)
//! - **`web`**: axum endpoints for streaming, ingestion and status

// Core modules (always compiled)
pub mod actuator;
pub mod control;
pub mod dispatcher;
pub mod frame;

pub use actuator::{ActuatorError, ActuatorLink, ActuatorProtocol};
pub use control::{ClassificationEvent, ControlSnapshot, ControlState};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherState};
pub use frame::{Frame, FrameBuffer};

// Capture: camera command, JPEG splitting, test source
#[cfg(feature = "capture")]
pub mod capture;

// Web: axum HTTP server, MJPEG stream, ingestion
#[cfg(feature = "web")]
pub mod web;
