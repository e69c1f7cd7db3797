//! Resilient streaming requests for generative-model APIs.
//!
//! `ferry` sits between an application and a hosted text/image generation
//! service whose calls are slow, rate limited and prone to failing part way
//! through a streamed answer. It provides three pieces that the rest of the
//! crate is built from:
//!
//! - the **error classifier** ([`api::classify`]) mapping raw failures onto
//!   a small taxonomy with user-facing messages,
//! - the **resilient call executor** ([`api::retry`]) retrying transient
//!   failures with exponential backoff, honouring server-suggested waits and
//!   extending the attempt budget once on rate limits,
//! - the **streaming relay** ([`api::streaming`]) forwarding chunks to a
//!   caller sink with cooperative cancellation and an in-band notice when
//!   a stream breaks after partial output.
//!
//! # Getting started
//!
//! ```ignore
//! use ferry::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ClassifiedError> {
//!     let config = FerryConfig::from_env();
//!     let assistant = Assistant::new(HttpBackendFactory::new(config.backend_config()))
//!         .with_policy(config.retry_policy())
//!         .with_status_handler(LoggingStatus);
//!
//!     let request = GenerateRequest::new("Summarize the attached report.")
//!         .with_instructions("Answer in three sentences.");
//!
//!     let mut sink = FnSink::new(|chunk| {
//!         print!("{}", chunk.render());
//!         Ok(())
//!     });
//!     let report = assistant
//!         .chat_stream(request, &mut sink, &CancellationToken::new())
//!         .await?;
//!     eprintln!("\n{:?}", report.state);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Classification, retry executor, status events, SSE decoding, streaming relay |
//! | [`client`] | [`ModelBackend`](client::ModelBackend) trait, HTTP backend, backend factories |
//! | [`config`] | TOML + environment configuration |
//! | [`service`] | [`Assistant`](service::Assistant) facade used by the CLI and the web proxy |

pub mod api;
pub mod client;
pub mod config;
pub mod prelude;
pub mod service;

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use api::streaming::Chunk;

// ── Constants ──────────────────────────────────────────────────────

/// Default chat-completions endpoint (OpenAI-compatible).
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for text generation.
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";

/// Default model for requests carrying or producing images.
pub const DEFAULT_IMAGE_MODEL: &str = "google/gemini-2.5-flash-image";

/// Environment variable holding the API key unless configured otherwise.
pub const DEFAULT_API_KEY_ENV: &str = "FERRY_API_KEY";

/// Aspect ratio used for image generation when none is given.
pub const DEFAULT_ASPECT_RATIO: &str = "1:1";

// ── Conversation ───────────────────────────────────────────────────

/// Author of a conversation turn.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant")]
    Model,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
        }
    }
}

/// One prior turn of a conversation.
///
/// Deserializes from `{ "role", "text" }` or from the `{ "role", "parts":
/// [{ "text" }] }` shape used by browser clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "WireTurn")]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

#[derive(Deserialize)]
struct WireTurn {
    role: Role,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
}

impl From<WireTurn> for Turn {
    fn from(wire: WireTurn) -> Self {
        let text = match wire.text {
            Some(text) => text,
            None => wire.parts.into_iter().filter_map(|p| p.text).collect(),
        };
        Self {
            role: wire.role,
            text,
        }
    }
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

// ── Attachments ────────────────────────────────────────────────────

/// A binary input sent alongside the user's message, e.g. an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Parse a `data:<mime>;base64,<payload>` URL.
    ///
    /// A bare base64 payload without the `data:` header is accepted too and
    /// assumed to be JPEG, as browser clients sometimes strip the header.
    pub fn from_data_url(url: &str) -> Option<Self> {
        let url = url.trim();
        let (mime_type, payload) = match url.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',')?;
                let mime = header.strip_suffix(";base64")?;
                let mime = if mime.is_empty() { "image/jpeg" } else { mime };
                (mime.to_string(), payload)
            }
            None => ("image/jpeg".to_string(), url),
        };
        let data = BASE64.decode(payload).ok()?;
        Some(Self { mime_type, data })
    }

    /// Render as a `data:` URL.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.data))
    }

    /// Read a file, guessing its MIME type from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self { mime_type, data })
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

// ── Requests ───────────────────────────────────────────────────────

/// Optional model capabilities requested for one call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Ground the answer with web search.
    #[serde(default)]
    pub web_search: bool,
    /// Allow the model to spend tokens on extended reasoning.
    #[serde(default)]
    pub extended_thinking: bool,
    /// Ask for a JSON object instead of prose.
    #[serde(default)]
    pub json_output: bool,
    /// Ask for an image in the response.
    #[serde(default)]
    pub image_output: bool,
}

/// One generation request, carrying the full conversation context.
///
/// Requests are plain values. Re-sending the same value reproduces the same
/// upstream call, which is what lets the executor retry before any output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerateRequest {
    /// Overrides the backend's model choice.
    pub model: Option<String>,
    pub history: Vec<Turn>,
    /// The new user message.
    pub input: String,
    pub attachment: Option<Attachment>,
    /// System instructions.
    pub instructions: Option<String>,
    pub capabilities: Capabilities,
    /// Zero means "provider default".
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Aspect ratio for image output, e.g. `"16:9"`.
    pub aspect_ratio: Option<String>,
}

impl GenerateRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.capabilities.web_search = enabled;
        self
    }

    pub fn with_extended_thinking(mut self, enabled: bool) -> Self {
        self.capabilities.extended_thinking = enabled;
        self
    }

    pub fn with_json_output(mut self, enabled: bool) -> Self {
        self.capabilities.json_output = enabled;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Request an image in the given aspect ratio.
    pub fn with_image_output(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.capabilities.image_output = true;
        self.aspect_ratio = Some(aspect_ratio.into());
        self
    }

    /// Whether the request should go to the image-capable model.
    ///
    /// Web search takes precedence over an attached image; image output
    /// always needs the image model.
    pub fn wants_image_model(&self) -> bool {
        self.capabilities.image_output
            || (self.attachment.is_some() && !self.capabilities.web_search)
    }
}

// ── Responses ──────────────────────────────────────────────────────

/// Token usage statistics.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// A complete, non-streamed response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub chunks: Vec<Chunk>,
    pub usage: Option<UsageInfo>,
}

impl Completion {
    /// Concatenated text of the response.
    pub fn text(&self) -> String {
        api::streaming::collect_text(&self.chunks)
    }

    /// The first binary payload, if any.
    pub fn first_binary(&self) -> Option<Attachment> {
        self.chunks.iter().find_map(|chunk| match chunk {
            Chunk::Binary { mime_type, data } => Some(Attachment::new(mime_type.clone(), data.clone())),
            _ => None,
        })
    }
}
