//! REST and SSE endpoint handlers.
//!
//! Bodies are read as raw bytes and parsed here rather than through the
//! `Json` extractor, so clients that omit `Content-Type` still work and a
//! malformed payload gets the same `{ error }` shape as every other failure.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use ferry::api::{Chunk, ChunkSink, ClassifiedError, ErrorKind, FnSink, RelayReport, SinkClosed};
use ferry::prelude::CancellationToken;
use ferry::service::Assistant;
use ferry::{Attachment, GenerateRequest, Turn};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub assistant: Arc<Assistant>,
}

// ── Errors ─────────────────────────────────────────────────────────

/// HTTP status for a classified failure.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::MissingConfig => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NetworkFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::ContentPolicy => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// An error answered as `{ error, kind? }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<ErrorKind>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            kind: None,
        }
    }
}

impl From<ClassifiedError> for ApiError {
    fn from(error: ClassifiedError) -> Self {
        warn!(kind = %error.kind, "Generation failed: {}", error.diagnostic);
        Self {
            status: status_for(error.kind),
            message: error.message,
            kind: Some(error.kind),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.kind {
            Some(kind) => json!({ "error": self.message, "kind": kind }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

// ── Request body ───────────────────────────────────────────────────

/// Body of `POST /api/generate` and `POST /api/stream`.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    /// `"chat"` or `"generate"`. Ignored by `/api/stream`.
    pub action: Option<String>,
    /// Prompt for `generate`.
    pub prompt: Option<String>,
    /// Prior turns for `chat`.
    pub history: Option<Vec<Turn>>,
    /// New user message for `chat`.
    pub message: Option<String>,
    /// Optional image for `chat`, as a data URL.
    pub image: Option<String>,
    pub system_instruction: Option<String>,
    pub json_mode: Option<bool>,
    pub web_search: Option<bool>,
    pub thinking: Option<bool>,
}

impl GenerateBody {
    fn parse(bytes: &[u8]) -> Result<Self, ApiError> {
        // Some clients send the JSON document as a JSON string.
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|_| ApiError::bad_request("invalid JSON payload"))?;
        let value = match value {
            serde_json::Value::String(inner) => serde_json::from_str(&inner)
                .map_err(|_| ApiError::bad_request("invalid JSON payload"))?,
            other => other,
        };
        serde_json::from_value(value).map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))
    }

    /// Build the request for the `chat` action.
    pub fn chat_request(self) -> Result<GenerateRequest, ApiError> {
        if self.message.is_none() && self.image.is_none() {
            return Err(ApiError::bad_request("missing message"));
        }
        let mut request = GenerateRequest::new(self.message.unwrap_or_default())
            .with_history(self.history.unwrap_or_default())
            .with_web_search(self.web_search.unwrap_or(false))
            .with_extended_thinking(self.thinking.unwrap_or(false));
        if let Some(instructions) = self.system_instruction {
            request = request.with_instructions(instructions);
        }
        if let Some(image) = self.image {
            let attachment = Attachment::from_data_url(&image)
                .ok_or_else(|| ApiError::bad_request("invalid image data URL"))?;
            request = request.with_attachment(attachment);
        }
        Ok(request)
    }

    /// Build the request for the `generate` action.
    pub fn generate_request(self) -> Result<GenerateRequest, ApiError> {
        let prompt = self
            .prompt
            .ok_or_else(|| ApiError::bad_request("missing prompt"))?;
        let mut request =
            GenerateRequest::new(prompt).with_json_output(self.json_mode.unwrap_or(false));
        if let Some(instructions) = self.system_instruction {
            request = request.with_instructions(instructions);
        }
        Ok(request)
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// POST /api/generate — One complete reply.
///
/// `chat` sends `message` (plus optional `image`) after `history`;
/// `generate` sends a single `prompt`, optionally in JSON mode. The reply
/// text is returned verbatim as `{ text }`.
pub async fn post_generate(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = GenerateBody::parse(&body)?;
    let request = match body.action.as_deref() {
        Some("chat") => body.chat_request()?,
        Some("generate") => body.generate_request()?,
        _ => {
            return Err(ApiError::bad_request(
                "invalid or missing action (expected \"chat\" or \"generate\")",
            ));
        }
    };
    let text = app.assistant.complete_text(request).await?;
    Ok(Json(json!({ "text": text })))
}

/// POST /api/stream — Chat reply as Server-Sent Events.
///
/// Emits `chunk` events as output arrives, then exactly one `done` event
/// (or a single `error` event when the call failed before any output).
/// Closing the connection cancels the upstream call.
pub async fn post_stream(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = GenerateBody::parse(&body)?.chat_request()?;

    let (tx, rx) = mpsc::channel::<Event>(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let assistant = app.assistant.clone();

    tokio::spawn(async move {
        let mut sink = event_sink(tx.clone());
        let last = match assistant.chat_stream(request, &mut sink, &cancel).await {
            Ok(report) => {
                debug!(state = report.state.as_str(), chunks = report.chunks_delivered, "Stream finished");
                done_event(&report)
            }
            Err(error) => {
                warn!(kind = %error.kind, "Stream failed before output: {}", error.diagnostic);
                error_event(&error)
            }
        };
        // The client may already be gone.
        let _ = tx.send(last).await;
    });

    // The guard travels with the response stream: dropping it on disconnect
    // cancels the relay.
    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(event), (rx, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/health — Liveness check.
pub async fn get_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Fallback for unsupported methods on POST routes.
pub async fn method_not_allowed() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "method not allowed" })),
    )
}

// ── SSE events ─────────────────────────────────────────────────────

/// Events buffered per `/api/stream` response before the client counts as
/// stalled.
const EVENT_BUFFER: usize = 256;

/// Sink that forwards chunks as SSE events into a bounded channel.
///
/// A full buffer means the client stopped reading; the sink then reports
/// itself closed, which ends the relay like a disconnect would.
fn event_sink(tx: mpsc::Sender<Event>) -> impl ChunkSink {
    FnSink::new(move |chunk: Chunk| match tx.try_send(chunk_event(&chunk)) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            warn!("SSE client is not reading; dropping stream after {EVENT_BUFFER} buffered events");
            Err(SinkClosed)
        }
        Err(TrySendError::Closed(_)) => Err(SinkClosed),
    })
}

fn chunk_event(chunk: &Chunk) -> Event {
    let data = match chunk {
        Chunk::Text(text) => json!({ "type": "text", "text": text }),
        Chunk::Binary { mime_type, .. } => json!({
            "type": "image",
            "mime_type": mime_type,
            "data_url": chunk.to_data_url(),
        }),
        Chunk::Notice(text) => json!({ "type": "notice", "text": text }),
    };
    Event::default().event("chunk").data(data.to_string())
}

fn done_event(report: &RelayReport) -> Event {
    let mut data = json!({
        "state": report.state.as_str(),
        "chunks": report.chunks_delivered,
    });
    if let Some(error) = &report.error {
        data["error"] = json!({ "error": error.message, "kind": error.kind });
    }
    Event::default().event("done").data(data.to_string())
}

fn error_event(error: &ClassifiedError) -> Event {
    let data = json!({ "error": error.message, "kind": error.kind });
    Event::default().event("error").data(data.to_string())
}
