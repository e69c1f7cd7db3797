//! The [`Assistant`] facade.
//!
//! Binds a [`BackendFactory`], a [`RetryPolicy`] and a [`StatusHandler`] and
//! offers the operations applications actually call: streamed chat, plain
//! and JSON completions, and image generation. Every call resolves a fresh
//! backend (so a missing key surfaces per call) and runs through the
//! executor; streamed chat additionally goes through the relay.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::classify::{ClassifiedError, RawFailure};
use crate::api::retry::{RetryPolicy, execute};
use crate::api::status::{NoopStatus, StatusHandler};
use crate::api::streaming::{ChunkSink, RelayReport, StreamingRelay};
use crate::client::BackendFactory;
use crate::{Attachment, Completion, DEFAULT_ASPECT_RATIO, GenerateRequest};

/// High-level entry point for generation calls.
#[derive(Clone)]
pub struct Assistant {
    factory: Arc<dyn BackendFactory>,
    policy: RetryPolicy,
    status: Arc<dyn StatusHandler>,
}

impl Assistant {
    pub fn new(factory: impl BackendFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            policy: RetryPolicy::default(),
            status: Arc::new(NoopStatus),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_status_handler(mut self, status: impl StatusHandler + 'static) -> Self {
        self.status = Arc::new(status);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Stream a chat reply into `sink`.
    ///
    /// Returns `Err` only when nothing was delivered. A failure after partial
    /// output leaves a trailing notice in the sink and reports
    /// [`RelayState::FailedAfterOutput`](crate::api::RelayState::FailedAfterOutput).
    pub async fn chat_stream(
        &self,
        request: GenerateRequest,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<RelayReport, ClassifiedError> {
        let backend = self.factory.create()?;
        debug!(backend = backend.name(), "Starting chat stream");

        let backend = backend.as_ref();
        let request = &request;
        StreamingRelay::new(self.policy.clone())
            .with_status_handler(self.status.as_ref())
            .run(move || backend.stream(request), sink, cancel)
            .await
    }

    /// Run a request to completion.
    pub async fn complete(&self, request: GenerateRequest) -> Result<Completion, ClassifiedError> {
        let backend = self.factory.create()?;
        let backend = backend.as_ref();
        let request = &request;
        execute(&self.policy, self.status.as_ref(), move || {
            backend.complete(request)
        })
        .await
    }

    /// Run a request and return its text.
    pub async fn complete_text(&self, request: GenerateRequest) -> Result<String, ClassifiedError> {
        Ok(self.complete(request).await?.text())
    }

    /// Run a request in JSON mode and parse the reply.
    ///
    /// Markdown code fences around the reply are stripped and an empty reply
    /// parses as `{}`. A reply that is not valid JSON counts as a failed
    /// attempt and is retried.
    pub async fn complete_json(
        &self,
        request: GenerateRequest,
    ) -> Result<serde_json::Value, ClassifiedError> {
        let backend = self.factory.create()?;
        let backend = backend.as_ref();
        let request = request.with_json_output(true);
        let request = &request;
        execute(&self.policy, self.status.as_ref(), move || async move {
            let completion = backend.complete(request).await?;
            parse_json_reply(&completion.text())
        })
        .await
    }

    /// Generate an image from a prompt.
    ///
    /// A reply without an image is treated as a transient failure.
    pub async fn generate_image(
        &self,
        prompt: impl Into<String>,
        aspect_ratio: Option<&str>,
    ) -> Result<Attachment, ClassifiedError> {
        let backend = self.factory.create()?;
        let backend = backend.as_ref();
        let request = GenerateRequest::new(prompt)
            .with_image_output(aspect_ratio.unwrap_or(DEFAULT_ASPECT_RATIO));
        let request = &request;
        execute(&self.policy, self.status.as_ref(), move || async move {
            let completion = backend.complete(request).await?;
            completion
                .first_binary()
                .ok_or_else(|| RawFailure::new("no image was generated"))
        })
        .await
    }
}

/// Strip a surrounding Markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_json_reply(text: &str) -> Result<serde_json::Value, RawFailure> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(body)
        .map_err(|e| RawFailure::new(format!("model returned malformed JSON: {e}")))
}
