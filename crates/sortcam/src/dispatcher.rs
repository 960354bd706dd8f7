//! Control loop that turns classifications into actuator commands
//!
//! One cycle, never concurrent with itself:
//! 1. a pending fast-stop is written immediately, whatever else is in flight;
//! 2. otherwise, when idle, the pending class is written and the loop waits
//!    for the controller's ready reply before sending another;
//! 3. reply lines are drained and matched against the protocol sentinels.
//!
//! The emergency path never touches the idle/awaiting-ack bookkeeping.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actuator::{ActuatorError, ActuatorLink, ActuatorProtocol, ActuatorReply};
use crate::control::ControlState;

/// Default pause between cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sleep between cycles. Lower values cut command latency and burn
    /// more CPU on polling.
    pub poll_interval: Duration,
    /// Command encoding and reply sentinels
    pub protocol: ActuatorProtocol,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            protocol: ActuatorProtocol::default(),
        }
    }
}

/// Where the dispatcher stands after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    /// No command outstanding
    Idle,
    /// A command was sent and the ready reply has not arrived
    AwaitingAck,
    /// A fast-stop was written during the last cycle
    Emergency,
    /// The device went away and the loop has exited
    Unavailable,
}

impl DispatcherState {
    fn as_u8(self) -> u8 {
        match self {
            DispatcherState::Idle => 0,
            DispatcherState::AwaitingAck => 1,
            DispatcherState::Emergency => 2,
            DispatcherState::Unavailable => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatcherState::AwaitingAck,
            2 => DispatcherState::Emergency,
            3 => DispatcherState::Unavailable,
            _ => DispatcherState::Idle,
        }
    }
}

/// Counters snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub commands_sent: u64,
    pub emergencies_sent: u64,
    pub emergency_failures: u64,
    pub acks: u64,
    pub garbled: u64,
}

struct AtomicDispatcherStats {
    cycles: AtomicU64,
    commands_sent: AtomicU64,
    emergencies_sent: AtomicU64,
    emergency_failures: AtomicU64,
    acks: AtomicU64,
    garbled: AtomicU64,
}

impl AtomicDispatcherStats {
    fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            emergencies_sent: AtomicU64::new(0),
            emergency_failures: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            garbled: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            emergencies_sent: self.emergencies_sent.load(Ordering::Relaxed),
            emergency_failures: self.emergency_failures.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            garbled: self.garbled.load(Ordering::Relaxed),
        }
    }
}

struct DispatcherShared {
    stats: AtomicDispatcherStats,
    state: AtomicU8,
}

/// Read-only view of a running dispatcher, cheap to clone
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<DispatcherShared>,
}

impl DispatcherHandle {
    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> DispatcherStats {
        self.shared.stats.snapshot()
    }
}

pub struct Dispatcher<L> {
    link: L,
    control: ControlState,
    config: DispatcherConfig,
    shared: Arc<DispatcherShared>,
}

impl<L: ActuatorLink> Dispatcher<L> {
    pub fn new(link: L, control: ControlState, config: DispatcherConfig) -> Self {
        Self {
            link,
            control,
            config,
            shared: Arc::new(DispatcherShared {
                stats: AtomicDispatcherStats::new(),
                state: AtomicU8::new(DispatcherState::Idle.as_u8()),
            }),
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.handle().state()
    }

    /// Run one cycle. Only [`ActuatorError::DeviceUnavailable`] is returned;
    /// write timeouts are logged and retried on the next cycle.
    pub fn cycle(&mut self) -> Result<DispatcherState, ActuatorError> {
        let stats = &self.shared.stats;
        stats.cycles.fetch_add(1, Ordering::Relaxed);

        let mut emergency_issued = false;
        if self.control.emergency_pending() {
            let command = self.config.protocol.emergency_command();
            match self.link.try_send(&command) {
                Ok(()) => {
                    self.control.clear_emergency();
                    stats.emergencies_sent.fetch_add(1, Ordering::Relaxed);
                    emergency_issued = true;
                    warn!(command = %command, "Emergency stop issued");
                }
                Err(e) => {
                    stats.emergency_failures.fetch_add(1, Ordering::Relaxed);
                    error!(command = %command, error = %e, "Emergency stop could not be sent");
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        } else if self.control.accepting() {
            if let Some(class_id) = self.control.pending_class() {
                let command = self.config.protocol.class_command(class_id);
                match self.link.try_send(&command) {
                    Ok(()) => {
                        self.control.mark_issued(class_id);
                        stats.commands_sent.fetch_add(1, Ordering::Relaxed);
                        info!(class_id, "Command sent, awaiting actuator");
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(class_id, error = %e, "Command not sent, retrying next cycle");
                    }
                }
            }
        }

        self.drain_replies()?;

        let state = if emergency_issued {
            DispatcherState::Emergency
        } else if self.control.accepting() {
            DispatcherState::Idle
        } else {
            DispatcherState::AwaitingAck
        };
        self.shared.state.store(state.as_u8(), Ordering::Relaxed);
        Ok(state)
    }

    fn drain_replies(&mut self) -> Result<(), ActuatorError> {
        while let Some(line) = self.link.poll_incoming()? {
            self.handle_reply(&line);
        }
        Ok(())
    }

    fn handle_reply(&self, line: &str) {
        let stats = &self.shared.stats;
        match self.config.protocol.parse_reply(line) {
            ActuatorReply::Ready => {
                if self.control.accepting() {
                    debug!("Ready reply while idle, ignoring");
                } else {
                    self.control.mark_ready();
                    stats.acks.fetch_add(1, Ordering::Relaxed);
                    info!("Actuator ready, accepting classifications");
                }
            }
            ActuatorReply::EmergencyCleared => {
                info!("Actuator reports emergency cleared");
            }
            ActuatorReply::Other(reply) => {
                stats.garbled.fetch_add(1, Ordering::Relaxed);
                warn!(reply = %reply, "Unexpected actuator reply");
            }
        }
    }

    /// Cycle until `cancel` fires or the device becomes unavailable.
    ///
    /// On device loss the handle reports [`DispatcherState::Unavailable`]
    /// and the control state stops accepting classifications. Blocks the
    /// calling thread; run it on a dedicated thread.
    pub fn run(mut self, cancel: CancellationToken) -> Result<(), ActuatorError> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            emergency_code = self.config.protocol.emergency_code,
            ready_reply = %self.config.protocol.ready_reply,
            "Dispatcher started"
        );
        while !cancel.is_cancelled() {
            if let Err(e) = self.cycle() {
                error!(error = %e, "Dispatcher stopped: actuator unavailable");
                self.control.mark_unavailable();
                self.shared
                    .state
                    .store(DispatcherState::Unavailable.as_u8(), Ordering::Relaxed);
                return Err(e);
            }
            std::thread::sleep(self.config.poll_interval);
        }
        info!(stats = ?self.shared.stats.snapshot(), "Dispatcher stopped");
        Ok(())
    }
}
