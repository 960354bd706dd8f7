//! sortcam server: headless sorting station
//!
//! Streams the camera as MJPEG, accepts classifications from the detection
//! client and drives the actuator controller over serial.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: port 8000, /dev/ttyACM0, rpicam-vid 704x512 @ 5fps
//! sortcam-server
//!
//! # Streaming only, no actuator attached
//! SORTCAM_SERIAL_OPTIONAL=1 sortcam-server
//!
//! # Synthetic frames (build with --features test-source)
//! SORTCAM_TEST_SOURCE=1 sortcam-server
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use sortcam::actuator::{ActuatorError, SerialActuator, SerialConfig};
use sortcam::capture::{CameraCapture, CameraConfig};
use sortcam::web::{self, WebState};
use sortcam::{
    ActuatorProtocol, ControlState, Dispatcher, DispatcherConfig, DispatcherHandle, FrameBuffer,
};

/// Server configuration from environment
struct Config {
    web_port: u16,
    static_path: Option<PathBuf>,
    max_body_bytes: usize,
    serial: SerialConfig,
    serial_optional: bool,
    poll_interval: Duration,
    protocol: ActuatorProtocol,
    camera: CameraConfig,
    test_source: bool,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

impl Config {
    fn from_env() -> Self {
        let serial_defaults = SerialConfig::default();
        let camera_defaults = CameraConfig::default();

        let serial = SerialConfig {
            path: std::env::var("SORTCAM_SERIAL_PATH").unwrap_or(serial_defaults.path),
            baud_rate: env_or("SORTCAM_SERIAL_BAUD", serial_defaults.baud_rate),
            timeout: Duration::from_millis(env_or(
                "SORTCAM_SERIAL_TIMEOUT_MS",
                serial_defaults.timeout.as_millis() as u64,
            )),
            settle_delay: Duration::from_millis(env_or(
                "SORTCAM_SERIAL_SETTLE_MS",
                serial_defaults.settle_delay.as_millis() as u64,
            )),
        };

        let protocol_defaults = ActuatorProtocol::default();
        let protocol = ActuatorProtocol {
            emergency_code: env_or("SORTCAM_EMERGENCY_CODE", protocol_defaults.emergency_code),
            ready_reply: std::env::var("SORTCAM_READY_REPLY")
                .unwrap_or(protocol_defaults.ready_reply),
            emergency_cleared_reply: std::env::var("SORTCAM_EMERGENCY_CLEARED_REPLY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        };

        let camera = CameraConfig {
            command: std::env::var("SORTCAM_CAMERA_CMD").unwrap_or(camera_defaults.command),
            width: env_or("SORTCAM_WIDTH", camera_defaults.width),
            height: env_or("SORTCAM_HEIGHT", camera_defaults.height),
            fps: env_or("SORTCAM_FPS", camera_defaults.fps),
            ..camera_defaults
        };

        Self {
            web_port: env_or("SORTCAM_WEB_PORT", 8000),
            static_path: std::env::var("SORTCAM_STATIC_PATH").map(PathBuf::from).ok(),
            max_body_bytes: env_or("SORTCAM_MAX_BODY_BYTES", web::DEFAULT_MAX_BODY_BYTES),
            serial,
            serial_optional: env_flag("SORTCAM_SERIAL_OPTIONAL"),
            poll_interval: Duration::from_millis(env_or("SORTCAM_POLL_INTERVAL_MS", 20)),
            protocol,
            camera,
            test_source: env_flag("SORTCAM_TEST_SOURCE"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("sortcam server starting");
    info!("  Web port: {}", config.web_port);
    info!("  Serial: {} @ {} baud", config.serial.path, config.serial.baud_rate);
    info!(
        "  Camera: {} {}x{} @ {}fps",
        config.camera.command, config.camera.width, config.camera.height, config.camera.fps
    );
    if let Some(ref path) = config.static_path {
        info!("  Static path: {:?}", path);
    }

    config
        .protocol
        .validate()
        .map_err(|e| anyhow!(e))
        .context("Invalid actuator protocol settings")?;

    let frames = Arc::new(FrameBuffer::new());
    let control = ControlState::new();

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Actuator link: opening resets the controller and sleeps through its boot
    let serial_config = config.serial.clone();
    let link = match tokio::task::spawn_blocking(move || SerialActuator::open(&serial_config))
        .await
        .context("Serial open task failed")?
    {
        Ok(link) => Some(link),
        Err(e) if config.serial_optional => {
            warn!(error = %e, "Actuator unavailable, running without dispatch");
            None
        }
        Err(e) => {
            return Err(e).context("Failed to open actuator (set SORTCAM_SERIAL_OPTIONAL=1 to run without it)");
        }
    };

    // Frame source
    let camera = start_frame_source(&config, &frames, &cancel, &tracker)?;

    let bind = SocketAddr::from(([0, 0, 0, 0], config.web_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("Failed to bind to {}", bind))?;
    info!("Web server listening on http://{}", bind);

    // Dispatcher runs on its own thread; nothing fallible follows
    let mut dispatcher_handle = None;
    let mut dispatcher_task = None;
    if let Some(link) = link {
        let dispatcher = Dispatcher::new(
            link,
            control.clone(),
            DispatcherConfig {
                poll_interval: config.poll_interval,
                protocol: config.protocol.clone(),
            },
        );
        dispatcher_handle = Some(dispatcher.handle());
        let dispatcher_cancel = cancel.clone();
        dispatcher_task = Some(tracker.spawn_blocking(move || dispatcher.run(dispatcher_cancel)));
    }

    // Web server
    let mut state = WebState::new(Arc::clone(&frames), control.clone(), config.protocol.clone())
        .with_max_body_bytes(config.max_body_bytes)
        .with_shutdown(cancel.clone());
    if let Some(ref handle) = dispatcher_handle {
        state = state.with_dispatcher(handle.clone());
    }
    let state = Arc::new(state);

    let app = web::router(Arc::clone(&state), config.static_path.as_deref());
    let web_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = web::serve(listener, app, web_cancel.clone()).await {
            error!("Web server error: {:#}", e);
            web_cancel.cancel();
        }
        info!("Web server: shut down");
    });

    tracker.close();

    let result = run_headless(state, dispatcher_handle, dispatcher_task, cancel, tracker).await;
    drop(camera);
    result
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sortcam=info".parse().unwrap()),
        )
        .init();
}

/// Start the camera, or the synthetic source when requested and built in.
fn start_frame_source(
    config: &Config,
    frames: &Arc<FrameBuffer>,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<Option<CameraCapture>> {
    if config.test_source && spawn_test_source(config, frames, cancel, tracker) {
        return Ok(None);
    }

    let camera = CameraCapture::start(config.camera.clone(), Arc::clone(frames))
        .context("Failed to start camera")?;
    Ok(Some(camera))
}

#[cfg(feature = "test-source")]
fn spawn_test_source(
    config: &Config,
    frames: &Arc<FrameBuffer>,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> bool {
    use sortcam::capture::{run_test_source, TestSourceConfig};

    let source = TestSourceConfig {
        fps: config.camera.fps,
        ..Default::default()
    };
    tracker.spawn(run_test_source(source, Arc::clone(frames), cancel.clone()));
    true
}

#[cfg(not(feature = "test-source"))]
fn spawn_test_source(
    _config: &Config,
    _frames: &Arc<FrameBuffer>,
    _cancel: &CancellationToken,
    _tracker: &TaskTracker,
) -> bool {
    warn!("SORTCAM_TEST_SOURCE set but built without the test-source feature, using the camera");
    false
}

/// Log stats periodically until SIGINT.
///
/// Losing the actuator only ends dispatch; streaming and ingestion keep
/// running, with ingestion reporting `accepting: false`.
async fn run_headless(
    state: Arc<WebState>,
    dispatcher: Option<DispatcherHandle>,
    mut dispatcher_task: Option<JoinHandle<Result<(), ActuatorError>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    let mut stats_interval = interval(Duration::from_secs(30));

    loop {
        let mut dispatcher_done = false;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = cancel.cancelled() => {
                break;
            }
            result = async {
                match dispatcher_task.as_mut() {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            } => {
                dispatcher_done = true;
                match result {
                    Ok(Ok(())) => info!("Dispatcher finished"),
                    Ok(Err(e)) => {
                        error!(error = %e, "Actuator lost, dispatch stopped; streaming continues");
                    }
                    Err(e) => {
                        error!(error = %e, "Dispatcher task failed; streaming continues");
                    }
                }
            }
            _ = stats_interval.tick() => {
                let frames = state.frames.version();
                match dispatcher {
                    Some(ref handle) => {
                        let stats = handle.stats();
                        info!(
                            viewers = state.viewers(),
                            frames,
                            state = ?handle.state(),
                            commands = stats.commands_sent,
                            acks = stats.acks,
                            emergencies = stats.emergencies_sent,
                            emergency_failures = stats.emergency_failures,
                            garbled = stats.garbled,
                            "Stats"
                        );
                    }
                    None => info!(viewers = state.viewers(), frames, "Stats"),
                }
            }
        }
        if dispatcher_done {
            dispatcher_task = None;
        }
    }

    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(test_source: bool) -> Config {
        Config {
            web_port: 0,
            static_path: None,
            max_body_bytes: web::DEFAULT_MAX_BODY_BYTES,
            serial: SerialConfig::default(),
            serial_optional: true,
            poll_interval: Duration::from_millis(20),
            protocol: ActuatorProtocol::default(),
            camera: CameraConfig {
                command: "sortcam-no-such-camera".into(),
                fps: 50,
                ..Default::default()
            },
            test_source,
        }
    }

    #[tokio::test]
    async fn camera_is_started_by_default() {
        let frames = Arc::new(FrameBuffer::new());
        let result = start_frame_source(
            &config(false),
            &frames,
            &CancellationToken::new(),
            &TaskTracker::new(),
        );
        assert!(result.is_err());
    }

    #[cfg(feature = "test-source")]
    #[tokio::test]
    async fn test_source_replaces_the_camera() {
        let frames = Arc::new(FrameBuffer::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let camera = start_frame_source(&config(true), &frames, &cancel, &tracker).unwrap();
        assert!(camera.is_none());
        tokio::time::timeout(Duration::from_secs(2), frames.wait_next_async(0))
            .await
            .expect("test source published nothing");

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[cfg(not(feature = "test-source"))]
    #[tokio::test]
    async fn test_source_flag_falls_back_to_the_camera() {
        let frames = Arc::new(FrameBuffer::new());
        let result = start_frame_source(
            &config(true),
            &frames,
            &CancellationToken::new(),
            &TaskTracker::new(),
        );
        assert!(result.is_err());
    }
}
