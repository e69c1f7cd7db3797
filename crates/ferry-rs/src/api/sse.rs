//! Server-Sent Events decoding for OpenAI-compatible chat completion streams.
//!
//! [`SseDecoder`] turns raw body bytes into [`Chunk`]s. It buffers partial
//! lines (and partial UTF-8 sequences) across network reads, ignores comment
//! and `event:` lines, and stops at `data: [DONE]`. An `error` object inside
//! the stream becomes a [`RawFailure`], so a provider that fails mid-response
//! looks the same to the relay as a dropped connection.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::classify::RawFailure;
use super::streaming::{Chunk, ChunkStream};
use crate::Attachment;

/// Result of decoding one SSE event.
pub type Decoded = Result<Chunk, RawFailure>;

/// Raw SSE data payload.
#[derive(Deserialize, Debug)]
struct StreamPayload {
    choices: Option<Vec<StreamChoice>>,
    error: Option<WireError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    images: Option<Vec<WireImage>>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct WireImage {
    pub(crate) image_url: WireImageUrl,
}

#[derive(Deserialize, Debug)]
pub(crate) struct WireImageUrl {
    pub(crate) url: String,
}

/// Provider error object, either top level or inside a stream.
#[derive(Deserialize, Debug)]
pub(crate) struct WireError {
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) code: Option<serde_json::Value>,
}

impl WireError {
    /// Convert to a raw failure, lifting a numeric HTTP-like code into the
    /// status slot.
    pub(crate) fn into_failure(self) -> RawFailure {
        let status = self.code.as_ref().and_then(|code| match code {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        let message = match &self.code {
            Some(serde_json::Value::String(code)) if code.parse::<u64>().is_err() => {
                format!("{code}: {}", self.message)
            }
            _ => self.message,
        };
        match status {
            Some(status @ 100..=599) => RawFailure::with_status(status as u16, message),
            _ => RawFailure::new(message),
        }
    }
}

/// Finish reasons that mean the provider withheld the output.
const BLOCKED_FINISH_REASONS: &[&str] = &["content_filter", "safety", "prohibited_content"];

/// A failure for a blocked `finish_reason`, `None` for ordinary reasons.
pub(crate) fn blocked_finish(reason: &str) -> Option<RawFailure> {
    let lower = reason.to_ascii_lowercase();
    BLOCKED_FINISH_REASONS
        .contains(&lower.as_str())
        .then(|| RawFailure::new(format!("response blocked (finish_reason: {lower})")))
}

/// Turn a `data:` image URL into a binary chunk.
pub(crate) fn image_chunk(url: &str) -> Option<Chunk> {
    let attachment = Attachment::from_data_url(url)?;
    Some(Chunk::Binary {
        mime_type: attachment.mime_type,
        data: attachment.data,
    })
}

/// Longest SSE line accepted. Inline base64 images make single lines large.
pub const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Incremental SSE decoder.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
    max_line: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            done: false,
            max_line: MAX_LINE_BYTES,
        }
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the line-length limit.
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Whether `[DONE]` has been seen. Later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed bytes from the body and return every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.decode_line(&String::from_utf8_lossy(&line), &mut out);
            if self.done {
                self.buffer.clear();
                break;
            }
        }

        // Whatever is left is an unterminated line.
        if !self.done && self.buffer.len() > self.max_line {
            warn!(
                buffered = self.buffer.len(),
                "SSE line exceeds {} bytes; abandoning stream", self.max_line
            );
            out.push(Err(RawFailure::new(format!(
                "failed to read stream: SSE line longer than {} bytes",
                self.max_line
            ))));
            self.buffer = Vec::new();
            self.done = true;
        }
        out
    }

    /// Flush an unterminated final line at end of body.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&String::from_utf8_lossy(&line), &mut out);
        }
        out
    }

    fn decode_line(&mut self, line: &str, out: &mut Vec<Decoded>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            trace!("Ignoring SSE field: {line}");
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            debug!("SSE stream signalled [DONE]");
            self.done = true;
            return;
        }
        parse_sse_data(data, out);
    }
}

/// Parse a single SSE `data:` payload.
fn parse_sse_data(data: &str, out: &mut Vec<Decoded>) {
    let payload = match serde_json::from_str::<StreamPayload>(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e}; data: {data}");
            return;
        }
    };

    if let Some(error) = payload.error {
        out.push(Err(error.into_failure()));
        return;
    }

    for choice in payload.choices.into_iter().flatten() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                out.push(Ok(Chunk::Text(content)));
            }
            for image in delta.images.into_iter().flatten() {
                match image_chunk(&image.image_url.url) {
                    Some(chunk) => out.push(Ok(chunk)),
                    None => warn!("Skipping image that is not a base64 data URL"),
                }
            }
        }
        if let Some(reason) = choice.finish_reason {
            trace!("Stream finish_reason: {reason}");
            if let Some(blocked) = blocked_finish(&reason) {
                out.push(Err(blocked));
            }
        }
    }
}

/// Decode a byte stream (a response body) into a chunk stream.
///
/// The stream ends after `[DONE]`, at end of body, or right after the first
/// failure; nothing is yielded past a failure.
pub fn decode_body<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<RawFailure> + Send + 'static,
{
    struct Decoding<S> {
        body: Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<Decoded>,
        finished: bool,
    }

    let state = Decoding {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.finished = true;
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let decoded = st.decoder.push(bytes.as_ref());
                    st.pending.extend(decoded);
                    if st.decoder.is_done() {
                        st.finished = true;
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(e.into()));
                }
                None => {
                    st.finished = true;
                    let decoded = st.decoder.finish();
                    st.pending.extend(decoded);
                }
            }
        }
    })
    .boxed()
}
