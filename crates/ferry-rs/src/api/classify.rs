//! Failure classification.
//!
//! Maps a raw upstream failure (HTTP status, transport error, or message
//! string) onto a small taxonomy of [`ErrorKind`]s. The kind decides whether
//! the executor retries, how long it waits, and which message the end user
//! sees. The upstream SDK error surface is string based, so most rules are
//! substring matches; they all live here so they can be tested against
//! literal fixture strings.
//!
//! Rules are applied in priority order and the first match wins:
//!
//! 1. missing / invalid credentials → [`ErrorKind::MissingConfig`]
//! 2. HTTP 429, quota or rate-limit markers → [`ErrorKind::RateLimited`]
//! 3. HTTP 500/502/503/504, "overloaded" → [`ErrorKind::Overloaded`]
//! 4. connection / DNS / fetch failures → [`ErrorKind::NetworkFailure`]
//! 5. safety-filter blocks → [`ErrorKind::ContentPolicy`]
//! 6. HTTP 400/404/422, invalid argument → [`ErrorKind::InvalidRequest`]
//! 7. everything else → [`ErrorKind::Unknown`]

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

// ── Raw failures ───────────────────────────────────────────────────

/// An unclassified failure as produced by a backend or transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFailure {
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    /// Diagnostic text (error message, response body, ...).
    pub message: String,
    /// Wait requested by a `Retry-After` header, if any.
    pub retry_after: Option<Duration>,
}

impl RawFailure {
    /// A failure described only by its message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A failure carrying the HTTP status of the response that produced it.
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attach a server-requested wait (from a `Retry-After` header).
    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) if !self.message.contains(&status.to_string()) => {
                write!(f, "HTTP {status}: {}", self.message)
            }
            _ => f.write_str(&self.message),
        }
    }
}

impl From<reqwest::Error> for RawFailure {
    fn from(e: reqwest::Error) -> Self {
        let message = if e.is_builder() {
            format!("invalid endpoint or request setup: {e}")
        } else if e.is_connect() || e.is_timeout() || e.is_request() {
            format!("request failed: {e}")
        } else if e.is_body() || e.is_decode() {
            format!("failed to read response: {e}")
        } else {
            e.to_string()
        };
        Self {
            status: e.status().map(|s| s.as_u16()),
            message,
            retry_after: None,
        }
    }
}

// ── Taxonomy ───────────────────────────────────────────────────────

/// The class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials or configuration are missing or invalid.
    MissingConfig,
    /// Quota or rate limit reached.
    RateLimited,
    /// The model service is overloaded or temporarily unavailable.
    Overloaded,
    /// The service could not be reached.
    NetworkFailure,
    /// The content was blocked by a safety filter.
    ContentPolicy,
    /// The request itself was rejected.
    InvalidRequest,
    /// Anything that matched no other rule.
    Unknown,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth retrying verbatim.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Overloaded
                | ErrorKind::NetworkFailure
                | ErrorKind::Unknown
        )
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::MissingConfig => {
                "The model API key is missing or invalid. Check the service configuration."
            }
            ErrorKind::RateLimited => "Traffic limit reached. Wait a minute and try again.",
            ErrorKind::Overloaded => "The model is overloaded right now. Try again shortly.",
            ErrorKind::NetworkFailure => {
                "Could not reach the model service. Check the network connection."
            }
            ErrorKind::ContentPolicy => "The content was blocked by the safety filters.",
            ErrorKind::InvalidRequest => "The model rejected the request as invalid.",
            ErrorKind::Unknown => "An error occurred while communicating with the model.",
        }
    }

    /// Stable snake_case identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingConfig => "missing_config",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::ContentPolicy => "content_policy",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure after classification.
///
/// `Display` renders the user-facing [`message`](Self::message); the raw
/// upstream text is kept in [`diagnostic`](Self::diagnostic) for logs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// Human-readable message for end users.
    pub message: String,
    /// The original diagnostic, preserved for logging.
    pub diagnostic: String,
    pub retryable: bool,
    /// Wait the server asked for, without any safety margin.
    pub suggested_wait: Option<Duration>,
}

impl ClassifiedError {
    /// Build an error of a known kind, using the kind's default user message.
    pub fn new(kind: ErrorKind, diagnostic: impl Into<String>) -> Self {
        Self {
            kind,
            message: kind.user_message().to_string(),
            diagnostic: diagnostic.into(),
            retryable: kind.is_retryable(),
            suggested_wait: None,
        }
    }

    /// Shorthand for a [`ErrorKind::MissingConfig`] error.
    pub fn missing_config(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingConfig, diagnostic)
    }
}

// ── Classification ─────────────────────────────────────────────────

const MISSING_CONFIG_MARKERS: &[&str] = &[
    "api_key_missing",
    "api_key_invalid",
    "api key not valid",
    "api key expired",
    "invalid endpoint",
    "api key not configured",
    "missing api key",
    "invalid api key",
    "no api key",
    "unauthenticated",
    "unauthorized",
    "permission_denied",
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "rate_limit",
    "ratelimit",
    "resource_exhausted",
    "too many requests",
];

const OVERLOADED_MARKERS: &[&str] = &["overloaded", "unavailable"];

const NETWORK_MARKERS: &[&str] = &[
    "request failed",
    "error sending request",
    "connection refused",
    "connection reset",
    "connection closed",
    "dns error",
    "failed to lookup address",
    "failed to fetch",
    "fetch failed",
    "timed out",
    "timeout",
    "broken pipe",
    "failed to read",
    "network",
];

const CONTENT_POLICY_MARKERS: &[&str] = &[
    "safety",
    "content policy",
    "content_policy",
    "content_filter",
    "prohibited_content",
];

const INVALID_REQUEST_MARKERS: &[&str] = &["invalid_argument", "invalid argument", "bad request"];

static STATUS_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:http|status|code)\W{0,3}([1-5]\d{2})\b"#).expect("literal pattern")
});

static BARE_429: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b429\b").expect("literal pattern"));

static RETRY_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry(?:ing)?\s+in\s+(\d+(?:\.\d+)?)\s*s(?:ec(?:ond)?s?)?\b")
        .expect("literal pattern")
});

static RETRY_DELAY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"?retry_?delay"?\s*:\s*"(\d+(?:\.\d+)?)s""#).expect("literal pattern")
});

/// Classify a raw failure. Pure: the same input always yields the same kind.
pub fn classify(raw: &RawFailure) -> ClassifiedError {
    let lower = raw.message.to_lowercase();
    let status = raw.status.or_else(|| status_from_text(&raw.message));
    let has_status = |set: &[u16]| status.is_some_and(|s| set.contains(&s));

    let kind = if has_status(&[401, 403]) || contains_any(&lower, MISSING_CONFIG_MARKERS) {
        ErrorKind::MissingConfig
    } else if has_status(&[429])
        || BARE_429.is_match(&raw.message)
        || contains_any(&lower, RATE_LIMIT_MARKERS)
    {
        ErrorKind::RateLimited
    } else if has_status(&[500, 502, 503, 504]) || contains_any(&lower, OVERLOADED_MARKERS) {
        ErrorKind::Overloaded
    } else if contains_any(&lower, NETWORK_MARKERS) {
        ErrorKind::NetworkFailure
    } else if contains_any(&lower, CONTENT_POLICY_MARKERS) {
        ErrorKind::ContentPolicy
    } else if has_status(&[400, 404, 422]) || contains_any(&lower, INVALID_REQUEST_MARKERS) {
        ErrorKind::InvalidRequest
    } else {
        ErrorKind::Unknown
    };

    let mut classified = ClassifiedError::new(kind, raw.to_string());
    if kind == ErrorKind::RateLimited {
        classified.suggested_wait = raw
            .retry_after
            .or_else(|| parse_suggested_wait(&raw.message));
    }
    classified
}

/// Extract a server-suggested wait from failure text.
///
/// Understands `"Please retry in 37.5s"` style prose and the
/// `"retryDelay": "12s"` field of structured error details. Best effort:
/// callers fall back to exponential backoff when this returns `None`.
pub fn parse_suggested_wait(message: &str) -> Option<Duration> {
    let captures = RETRY_IN
        .captures(message)
        .or_else(|| RETRY_DELAY_FIELD.captures(message))?;
    let seconds: f64 = captures.get(1)?.as_str().parse().ok()?;
    wait_from_secs(seconds)
}

/// Convert a server-supplied number of seconds into a wait.
///
/// Negative and NaN values are rejected. Values too large for a
/// [`Duration`] saturate to [`Duration::MAX`], which the executor treats as
/// longer than any wait it is willing to honour.
pub(crate) fn wait_from_secs(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

fn status_from_text(message: &str) -> Option<u16> {
    STATUS_IN_TEXT
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
