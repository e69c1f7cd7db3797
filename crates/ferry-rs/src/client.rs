//! Model backends.
//!
//! A [`ModelBackend`] turns a [`GenerateRequest`] into either a complete
//! response or a [`ChunkStream`]. Failures are reported as unclassified
//! [`RawFailure`]s; classification and retry happen above this layer, so a
//! backend only has to describe what went wrong.
//!
//! [`HttpBackend`] speaks the OpenAI-compatible chat-completions protocol
//! (OpenRouter and most gateways). Backends are obtained through a
//! [`BackendFactory`] so credentials are resolved per call: a missing key is
//! reported as a [`ErrorKind::MissingConfig`](crate::api::ErrorKind) error
//! at call time, never at startup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::api::classify::{ClassifiedError, RawFailure, wait_from_secs};
use crate::api::sse::{WireError, WireImage, blocked_finish, decode_body, image_chunk};
use crate::api::streaming::{Chunk, ChunkStream};
use crate::{
    Completion, DEFAULT_API_KEY_ENV, DEFAULT_ASPECT_RATIO, DEFAULT_ENDPOINT, DEFAULT_IMAGE_MODEL,
    DEFAULT_MODEL, GenerateRequest, Role, UsageInfo,
};

/// Future returned by backend calls.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RawFailure>> + Send + 'a>>;

/// A generation service.
pub trait ModelBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run the request to completion.
    fn complete<'a>(&'a self, request: &'a GenerateRequest) -> BackendFuture<'a, Completion>;

    /// Open a streamed response. Failures while opening are returned here;
    /// failures after opening arrive as `Err` items on the stream.
    fn stream<'a>(&'a self, request: &'a GenerateRequest) -> BackendFuture<'a, ChunkStream>;
}

/// Produces a ready backend for one call.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn ModelBackend>, ClassifiedError>;
}

/// A factory that always hands out the same backend.
pub struct FixedBackend(pub Arc<dyn ModelBackend>);

impl FixedBackend {
    pub fn new(backend: impl ModelBackend + 'static) -> Self {
        Self(Arc::new(backend))
    }
}

impl BackendFactory for FixedBackend {
    fn create(&self) -> Result<Arc<dyn ModelBackend>, ClassifiedError> {
        Ok(self.0.clone())
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Connection settings for [`HttpBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Chat-completions URL.
    pub endpoint: String,
    /// Model for text requests.
    pub model: String,
    /// Model for requests carrying or producing images.
    pub image_model: String,
    /// Explicit API key. When `None` the key is read from `api_key_env`.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Reasoning token budget sent when extended thinking is requested.
    pub thinking_budget: u32,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between reads of a response body.
    pub read_timeout: Duration,
    /// Total time allowed for a non-streamed call.
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            thinking_budget: 16384,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl BackendConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// The model a request should be sent to.
    pub fn model_for<'a>(&'a self, request: &'a GenerateRequest) -> &'a str {
        if let Some(model) = request.model.as_deref() {
            return model;
        }
        if request.wants_image_model() {
            &self.image_model
        } else {
            &self.model
        }
    }

    /// Check that the endpoint is an absolute `http` or `https` URL.
    pub fn validate_endpoint(&self) -> Result<(), ClassifiedError> {
        match reqwest::Url::parse(&self.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => Err(ClassifiedError::missing_config(format!(
                "invalid endpoint {:?}: unsupported scheme {:?}",
                self.endpoint,
                url.scheme()
            ))),
            Err(e) => Err(ClassifiedError::missing_config(format!(
                "invalid endpoint {:?}: {e}",
                self.endpoint
            ))),
        }
    }

    /// Resolve the API key: explicit value first, then the environment.
    pub fn resolve_api_key(&self) -> Result<String, ClassifiedError> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.to_string());
        }
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ClassifiedError::missing_config(format!(
                "API key missing: {} is not set",
                self.api_key_env
            ))),
        }
    }
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    plugins: Vec<WirePlugin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<WireReasoning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modalities: Option<[&'static str; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_config: Option<WireImageConfig<'a>>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[derive(Serialize, Debug)]
struct WireMessage<'a> {
    role: &'static str,
    content: WireContent<'a>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<WirePart<'a>>),
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: WireUrl },
}

#[derive(Serialize, Debug)]
struct WireUrl {
    url: String,
}

#[derive(Serialize, Debug)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    fmt_type: &'static str,
}

#[derive(Serialize, Debug)]
struct WirePlugin {
    id: &'static str,
}

#[derive(Serialize, Debug)]
struct WireReasoning {
    max_tokens: u32,
}

#[derive(Serialize, Debug)]
struct WireImageConfig<'a> {
    aspect_ratio: &'a str,
}

#[derive(Deserialize, Debug)]
struct WireResponse {
    choices: Option<Vec<WireChoice>>,
    error: Option<WireError>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireResponseMessage {
    content: Option<String>,
    images: Option<Vec<WireImage>>,
}

fn build_body<'a>(config: &'a BackendConfig, request: &'a GenerateRequest, stream: bool) -> WireRequest<'a> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    if let Some(instructions) = request.instructions.as_deref() {
        messages.push(WireMessage {
            role: "system",
            content: WireContent::Text(instructions),
        });
    }
    for turn in &request.history {
        messages.push(WireMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Model => "assistant",
            },
            content: WireContent::Text(&turn.text),
        });
    }
    let content = match &request.attachment {
        Some(attachment) => WireContent::Parts(vec![
            WirePart::Text {
                text: &request.input,
            },
            WirePart::ImageUrl {
                image_url: WireUrl {
                    url: attachment.to_data_url(),
                },
            },
        ]),
        None => WireContent::Text(&request.input),
    };
    messages.push(WireMessage {
        role: "user",
        content,
    });

    let caps = request.capabilities;
    WireRequest {
        model: config.model_for(request),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream,
        response_format: caps.json_output.then_some(WireResponseFormat {
            fmt_type: "json_object",
        }),
        plugins: if caps.web_search {
            vec![WirePlugin { id: "web" }]
        } else {
            Vec::new()
        },
        reasoning: caps.extended_thinking.then_some(WireReasoning {
            max_tokens: config.thinking_budget,
        }),
        modalities: caps.image_output.then_some(["image", "text"]),
        image_config: caps.image_output.then(|| WireImageConfig {
            aspect_ratio: request.aspect_ratio.as_deref().unwrap_or(DEFAULT_ASPECT_RATIO),
        }),
    }
}

/// Parse a non-streamed response body.
fn parse_completion(text: &str) -> Result<Completion, RawFailure> {
    let parsed: WireResponse = serde_json::from_str(text)
        .map_err(|e| RawFailure::new(format!("failed to parse response: {e}")))?;

    if let Some(error) = parsed.error {
        return Err(error.into_failure());
    }

    let mut chunks = Vec::new();
    if let Some(choice) = parsed.choices.and_then(|c| c.into_iter().next()) {
        if let Some(blocked) = choice.finish_reason.as_deref().and_then(blocked_finish) {
            return Err(blocked);
        }
        if let Some(content) = choice.message.content
            && !content.is_empty()
        {
            chunks.push(Chunk::Text(content));
        }
        chunks.extend(
            choice
                .message
                .images
                .into_iter()
                .flatten()
                .filter_map(|image| image_chunk(&image.image_url.url)),
        );
    } else {
        debug!("LLM output: empty (no choices)");
    }

    Ok(Completion {
        chunks,
        usage: parsed.usage,
    })
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(wait_from_secs)
}

/// Turn a non-2xx response into a raw failure.
async fn failure_from_response(resp: reqwest::Response) -> RawFailure {
    let status = resp.status();
    let wait = retry_after(resp.headers());
    let text = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<WireResponse>(&text) {
        Ok(WireResponse {
            error: Some(error), ..
        }) => error.message,
        _ if text.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        _ => text,
    };
    let failure = RawFailure::with_status(status.as_u16(), message);
    match wait {
        Some(wait) => failure.with_retry_after(wait),
        None => failure,
    }
}

// ── HTTP backend ───────────────────────────────────────────────────

/// Async HTTP client for an OpenAI-compatible chat-completions endpoint.
pub struct HttpBackend {
    client: reqwest::Client,
    config: BackendConfig,
    api_key: String,
}

impl HttpBackend {
    pub fn new(config: BackendConfig, api_key: impl Into<String>) -> Result<Self, ClassifiedError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| ClassifiedError::missing_config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            api_key: api_key.into(),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn send(
        &self,
        request: &GenerateRequest,
        stream: bool,
    ) -> Result<reqwest::Response, RawFailure> {
        let body = build_body(&self.config, request, stream);
        debug!(
            "LLM request: model={}, history={}, attachment={}, stream={}",
            body.model,
            request.history.len(),
            request.attachment.is_some(),
            stream,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        if stream {
            builder = builder.header(reqwest::header::ACCEPT, "text/event-stream");
        } else {
            builder = builder.timeout(self.config.request_timeout);
        }

        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(failure_from_response(resp).await);
        }
        Ok(resp)
    }
}

impl ModelBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn complete<'a>(&'a self, request: &'a GenerateRequest) -> BackendFuture<'a, Completion> {
        Box::pin(async move {
            let start = Instant::now();
            let resp = self.send(request, false).await?;
            let status = resp.status();
            let text = resp.text().await?;
            debug!(
                "LLM response: HTTP {} in {:.1}s ({} bytes)",
                status,
                start.elapsed().as_secs_f64(),
                text.len()
            );
            parse_completion(&text)
        })
    }

    fn stream<'a>(&'a self, request: &'a GenerateRequest) -> BackendFuture<'a, ChunkStream> {
        Box::pin(async move {
            let resp = self.send(request, true).await?;
            debug!("Stream opened: HTTP {}", resp.status());
            Ok::<_, RawFailure>(decode_body(resp.bytes_stream()))
        })
    }
}

/// Builds an [`HttpBackend`] per call, resolving the API key each time.
pub struct HttpBackendFactory {
    config: BackendConfig,
}

impl HttpBackendFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn create(&self) -> Result<Arc<dyn ModelBackend>, ClassifiedError> {
        self.config.validate_endpoint()?;
        let api_key = self.config.resolve_api_key()?;
        Ok(Arc::new(HttpBackend::new(self.config.clone(), api_key)?))
    }
}
