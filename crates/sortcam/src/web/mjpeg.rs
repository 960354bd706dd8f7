//! Multipart MJPEG stream, one task per viewer.
//!
//! The body stream only produces the next part when hyper polls it, so a
//! slow viewer never has more than one frame queued and simply skips the
//! frames it was too slow for.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use tracing::info;

use super::WebState;
use crate::frame::Frame;

/// Multipart boundary between images
pub const BOUNDARY: &str = "FRAME";

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=FRAME";

/// Encode one multipart part: boundary line, part headers, image, CRLF.
pub fn encode_part(frame: &Frame) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(&frame.data);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Per-viewer bookkeeping; dropping it detaches the viewer.
struct ViewerSession {
    state: Arc<WebState>,
    addr: SocketAddr,
    last_seen: u64,
    frames_sent: u64,
    connected_at: Instant,
}

impl ViewerSession {
    fn attach(state: Arc<WebState>, addr: SocketAddr) -> Self {
        let viewers = state.viewers.fetch_add(1, Ordering::Relaxed) + 1;
        info!(viewer = %addr, viewers, "Viewer connected");
        Self {
            state,
            addr,
            last_seen: 0,
            frames_sent: 0,
            connected_at: Instant::now(),
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        let viewers = self.state.viewers.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(
            viewer = %self.addr,
            viewers,
            frames_sent = self.frames_sent,
            secs = self.connected_at.elapsed().as_secs(),
            "Viewer disconnected"
        );
    }
}

/// GET /stream.mjpg
pub async fn stream(
    State(state): State<Arc<WebState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let session = ViewerSession::attach(state, addr);

    let parts = futures_util::stream::unfold(session, |mut session| async move {
        let shutdown = session.state.shutdown.clone();
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return None,
            frame = session.state.frames.wait_next_async(session.last_seen) => frame,
        };
        session.last_seen = frame.version;
        session.frames_sent += 1;
        Some((Ok::<_, Infallible>(encode_part(&frame)), session))
    });

    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::AGE, "0"),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}
