//! Web server module: axum HTTP for viewers and the detection client.
//!
//! - `GET /stream.mjpg`: live multipart MJPEG stream
//! - `POST /stream.mjpg`, `POST /api/classification`: classification ingestion
//! - `GET /api/status`: viewer, frame and dispatcher counters
//! - anything else: static files when a directory is configured, else 404

pub mod ingest;
pub mod mjpeg;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::actuator::ActuatorProtocol;
use crate::control::ControlState;
use crate::dispatcher::DispatcherHandle;
use crate::frame::FrameBuffer;

pub use ingest::IngestError;

/// Default cap on an ingestion request body
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024;

/// Shared state for the web server
pub struct WebState {
    pub frames: Arc<FrameBuffer>,
    pub control: ControlState,
    /// Used to refuse class ids that collide with the emergency code
    pub protocol: ActuatorProtocol,
    pub dispatcher: Option<DispatcherHandle>,
    pub max_body_bytes: usize,
    viewers: AtomicUsize,
    start_time: Instant,
    shutdown: CancellationToken,
}

impl WebState {
    pub fn new(frames: Arc<FrameBuffer>, control: ControlState, protocol: ActuatorProtocol) -> Self {
        Self {
            frames,
            control,
            protocol,
            dispatcher: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            viewers: AtomicUsize::new(0),
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_dispatcher(mut self, handle: DispatcherHandle) -> Self {
        self.dispatcher = Some(handle);
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Ends open MJPEG streams when cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Viewers currently attached to the stream
    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::Relaxed)
    }
}

/// Build the application router.
pub fn router(state: Arc<WebState>, static_path: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/stream.mjpg", get(mjpeg::stream).post(ingest::classify))
        .route("/api/classification", post(ingest::classify))
        .route("/api/status", get(api_status))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match static_path {
        Some(path) if path.exists() => {
            info!("Serving static files from {:?}", path);
            app.fallback_service(ServeDir::new(path).append_index_html_on_directories(true))
        }
        Some(path) => {
            warn!("Static path {:?} does not exist, skipping static file serving", path);
            app.fallback(not_found)
        }
        None => app.fallback(not_found),
    }
}

/// Serve `app` on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
    .context("Web server error")
}

/// GET /api/status
async fn api_status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let dispatcher = state.dispatcher.as_ref().map(|handle| {
        let stats = handle.stats();
        serde_json::json!({
            "state": handle.state(),
            "cycles": stats.cycles,
            "commands_sent": stats.commands_sent,
            "emergencies_sent": stats.emergencies_sent,
            "emergency_failures": stats.emergency_failures,
            "acks": stats.acks,
            "garbled": stats.garbled,
        })
    });
    let latest_version = state.frames.version();

    Json(serde_json::json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "viewers": state.viewers(),
        "frames_published": latest_version,
        "frame_version": latest_version,
        "dispatcher": dispatcher,
        "control": state.control.snapshot(),
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
