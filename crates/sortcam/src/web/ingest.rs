//! Classification ingestion.
//!
//! The detection client posts one classification per request, form-encoded
//! by default or as JSON:
//!
//! ```text
//! class_id=3&fast_stop=0&xmin=12&ymin=40&xmax=88&ymax=120
//! {"class": 3.0, "fast": 1}
//! ```
//!
//! Extra fields are ignored. Nothing touches the control state unless the
//! whole request is valid.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::WebState;
use crate::control::{ClassificationEvent, InvalidEvent};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("request body could not be read: {0}")]
    BodyRead(String),
    #[error("malformed body: {0}")]
    Malformed(String),
    #[error("class_id is required")]
    MissingClass,
    #[error(transparent)]
    InvalidClass(#[from] InvalidEvent),
    #[error("class_id {0} is reserved for the emergency stop")]
    ReservedClass(u8),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "status": "error",
            "error": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

/// Wire form of a classification, before validation
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default, alias = "class")]
    class_id: Option<f64>,
    #[serde(default, alias = "fast")]
    fast_stop: f64,
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().starts_with("application/json"))
        .unwrap_or(false)
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes, IngestError> {
    if declared_length(headers).is_some_and(|len| len > limit) {
        return Err(IngestError::TooLarge { limit });
    }
    // Chunked bodies are cut off at the limit while streaming
    let mut chunks = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| IngestError::BodyRead(e.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(IngestError::TooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Decode and validate a request body into an event.
pub fn parse_event(
    body: &[u8],
    json: bool,
    state: &WebState,
) -> Result<ClassificationEvent, IngestError> {
    let raw: RawEvent = if json {
        serde_json::from_slice(body).map_err(|e| IngestError::Malformed(e.to_string()))?
    } else {
        serde_urlencoded::from_bytes(body).map_err(|e| IngestError::Malformed(e.to_string()))?
    };

    let class_id = raw.class_id.ok_or(IngestError::MissingClass)?;
    let event = ClassificationEvent::from_wire(class_id, raw.fast_stop)?;
    if state.protocol.is_reserved(event.class_id) {
        return Err(IngestError::ReservedClass(event.class_id));
    }
    Ok(event)
}

/// POST /stream.mjpg, POST /api/classification
pub async fn classify(
    State(state): State<Arc<WebState>>,
    request: Request,
) -> Result<Json<serde_json::Value>, IngestError> {
    let (parts, body) = request.into_parts();

    let result = match read_body(&parts.headers, body, state.max_body_bytes).await {
        Ok(bytes) => parse_event(&bytes, is_json(&parts.headers), &state),
        Err(e) => Err(e),
    };
    let event = result.inspect_err(|e| warn!(error = %e, "Classification rejected"))?;

    let accepting = state.control.fold(event);
    debug!(
        class_id = event.class_id,
        fast_stop = event.fast_stop,
        accepting,
        "Classification received"
    );

    Ok(Json(serde_json::json!({
        "status": "success",
        "accepting": accepting,
    })))
}
