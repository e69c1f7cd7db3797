//! Streaming relay: forwards an upstream chunk stream to a caller sink.
//!
//! The relay opens the upstream through the [`execute`](super::retry::execute)
//! executor and waits for the first chunk inside the same retried operation,
//! so a failure before any output restarts cleanly. Once a chunk has reached
//! the sink the stream is never retried (that would duplicate visible
//! output); a later failure is appended to the sink as exactly one
//! [`Chunk::Notice`] instead.
//!
//! ```text
//! NotStarted ──▶ Streaming ──▶ Completed
//!                    │    ├──▶ Cancelled
//!                    │    └──▶ FailedAfterOutput   (sink got a trailing notice)
//!                    └──────▶ FailedBeforeOutput   (error returned, sink untouched)
//! ```
//!
//! Cancellation is cooperative: the token is checked at every chunk
//! boundary and during retry sleeps. On cancellation the upstream stream is
//! dropped, which stops consuming it rather than merely not forwarding it.

use std::future::Future;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::classify::{ClassifiedError, RawFailure, classify};
use super::retry::{RetryPolicy, execute};
use super::status::{NoopStatus, StatusHandler};

// ── Chunks ─────────────────────────────────────────────────────────

/// One incremental unit of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// A text fragment.
    Text(String),
    /// A tagged binary payload, e.g. a generated image.
    Binary { mime_type: String, data: Vec<u8> },
    /// In-band notice that the response was interrupted after partial output.
    Notice(String),
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Chunk::Text(text.into())
    }

    /// The text of a [`Chunk::Text`], `None` otherwise.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Render a binary chunk as a `data:` URL. `None` for other chunks.
    pub fn to_data_url(&self) -> Option<String> {
        match self {
            Chunk::Binary { mime_type, data } => {
                Some(format!("data:{mime_type};base64,{}", BASE64.encode(data)))
            }
            _ => None,
        }
    }

    /// Text form suitable for appending to a visible transcript.
    pub fn render(&self) -> String {
        match self {
            Chunk::Text(text) => text.clone(),
            Chunk::Binary { mime_type, data } => format!("[{mime_type}, {} bytes]", data.len()),
            Chunk::Notice(message) => format!("\n\n⚠️ {message}"),
        }
    }
}

/// An ordered upstream of chunks. Natural exhaustion means completion.
pub type ChunkStream = BoxStream<'static, Result<Chunk, RawFailure>>;

/// Concatenate the text chunks of a transcript.
pub fn collect_text(chunks: &[Chunk]) -> String {
    chunks.iter().filter_map(Chunk::as_text).collect()
}

// ── Sinks ──────────────────────────────────────────────────────────

/// The sink stopped accepting chunks (receiver dropped, client gone).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream sink closed")]
pub struct SinkClosed;

/// Caller-supplied destination for streamed chunks.
///
/// Chunks arrive in generation order, each exactly once. Returning
/// [`SinkClosed`] is treated like cancellation.
pub trait ChunkSink: Send {
    fn send(&mut self, chunk: Chunk) -> Result<(), SinkClosed>;
}

impl ChunkSink for Vec<Chunk> {
    fn send(&mut self, chunk: Chunk) -> Result<(), SinkClosed> {
        self.push(chunk);
        Ok(())
    }
}

impl ChunkSink for tokio::sync::mpsc::UnboundedSender<Chunk> {
    fn send(&mut self, chunk: Chunk) -> Result<(), SinkClosed> {
        tokio::sync::mpsc::UnboundedSender::send(self, chunk).map_err(|_| SinkClosed)
    }
}

/// A sink backed by a closure.
pub struct FnSink<F>(F)
where
    F: FnMut(Chunk) -> Result<(), SinkClosed> + Send;

impl<F> FnSink<F>
where
    F: FnMut(Chunk) -> Result<(), SinkClosed> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ChunkSink for FnSink<F>
where
    F: FnMut(Chunk) -> Result<(), SinkClosed> + Send,
{
    fn send(&mut self, chunk: Chunk) -> Result<(), SinkClosed> {
        (self.0)(chunk)
    }
}

// ── Relay ──────────────────────────────────────────────────────────

/// Where a relay run ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    NotStarted,
    Streaming,
    Completed,
    Cancelled,
    FailedBeforeOutput,
    FailedAfterOutput,
}

impl RelayState {
    /// Stable snake_case identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::NotStarted => "not_started",
            RelayState::Streaming => "streaming",
            RelayState::Completed => "completed",
            RelayState::Cancelled => "cancelled",
            RelayState::FailedBeforeOutput => "failed_before_output",
            RelayState::FailedAfterOutput => "failed_after_output",
        }
    }
}

/// Outcome of a relay run that did not fail before output.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayReport {
    pub state: RelayState,
    /// Chunks delivered from the upstream (the trailing notice excluded).
    pub chunks_delivered: usize,
    /// The terminal error for [`RelayState::FailedAfterOutput`].
    pub error: Option<ClassifiedError>,
}

impl RelayReport {
    fn new(state: RelayState, chunks_delivered: usize) -> Self {
        Self {
            state,
            chunks_delivered,
            error: None,
        }
    }
}

/// Forwards an upstream chunk stream to a sink with retry and cancellation.
///
/// Each run owns its retry counter; nothing is shared between runs.
pub struct StreamingRelay<'a> {
    policy: RetryPolicy,
    status: &'a dyn StatusHandler,
}

impl<'a> StreamingRelay<'a> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            status: &NoopStatus,
        }
    }

    pub fn with_status_handler(mut self, status: &'a dyn StatusHandler) -> Self {
        self.status = status;
        self
    }

    /// Relay one response.
    ///
    /// `open` starts the upstream and may be called again for a clean retry
    /// while nothing has been delivered. Returns `Err` only when the call
    /// failed before any chunk reached the sink; in every other case the
    /// report tells how the run ended.
    pub async fn run<F, Fut>(
        &self,
        mut open: F,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<RelayReport, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ChunkStream, RawFailure>>,
    {
        let mut state = RelayState::NotStarted;
        debug!(?state, "Opening upstream");

        // Open and pull the first chunk inside one retried operation.
        let first = execute(&self.policy, self.status, || {
            let opening = open();
            async move {
                let mut upstream = match opening.await {
                    Ok(upstream) => upstream,
                    Err(raw) => return Err(raw),
                };
                match upstream.next().await {
                    Some(Ok(chunk)) => Ok(Some((chunk, upstream))),
                    Some(Err(raw)) => Err(raw),
                    None => Ok(None),
                }
            }
        });

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Relay cancelled before output");
                return Ok(RelayReport::new(RelayState::Cancelled, 0));
            }
            opened = first => opened,
        };

        let (first_chunk, mut upstream) = match opened {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!("Upstream completed without output");
                return Ok(RelayReport::new(RelayState::Completed, 0));
            }
            Err(error) => {
                warn!(
                    kind = %error.kind,
                    state = ?RelayState::FailedBeforeOutput,
                    "Stream failed before output: {}",
                    error.diagnostic
                );
                return Err(error);
            }
        };

        state = RelayState::Streaming;
        debug!(?state, "First chunk received");

        if cancel.is_cancelled() || sink.send(first_chunk).is_err() {
            return Ok(RelayReport::new(RelayState::Cancelled, 0));
        }
        let mut delivered = 1;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = upstream.next() => Some(next),
            };

            let item = match next {
                None => {
                    debug!(delivered, "Relay cancelled mid-stream");
                    return Ok(RelayReport::new(RelayState::Cancelled, delivered));
                }
                Some(item) => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    if cancel.is_cancelled() || sink.send(chunk).is_err() {
                        debug!(delivered, "Relay cancelled mid-stream");
                        return Ok(RelayReport::new(RelayState::Cancelled, delivered));
                    }
                    delivered += 1;
                }
                Some(Err(raw)) => {
                    let error = classify(&raw);
                    warn!(
                        kind = %error.kind,
                        delivered,
                        "Stream failed after partial output: {}",
                        error.diagnostic
                    );
                    // Best effort: a closed sink cannot show the notice anyway.
                    let _ = sink.send(Chunk::Notice(interruption_notice(&error)));
                    return Ok(RelayReport {
                        state: RelayState::FailedAfterOutput,
                        chunks_delivered: delivered,
                        error: Some(error),
                    });
                }
                None => {
                    debug!(delivered, "Stream completed");
                    return Ok(RelayReport::new(RelayState::Completed, delivered));
                }
            }
        }
    }
}

/// Text of the trailing notice appended after a mid-stream failure.
pub fn interruption_notice(error: &ClassifiedError) -> String {
    format!("Response interrupted: {}", error.message)
}
