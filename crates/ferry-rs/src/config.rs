//! Configuration: an optional TOML file, then environment overrides.
//!
//! ```toml
//! endpoint = "https://openrouter.ai/api/v1/chat/completions"
//! model = "google/gemini-2.5-flash"
//! image_model = "google/gemini-2.5-flash-image"
//! api_key_env = "FERRY_API_KEY"
//!
//! [retry]
//! max_attempts = 3
//! rate_limit_attempts = 6
//! base_delay_ms = 2000
//! max_delay_ms = 10000
//! ```
//!
//! Environment variables `FERRY_ENDPOINT`, `FERRY_MODEL` and
//! `FERRY_IMAGE_MODEL` override the file. The API key itself is never read
//! here; it is resolved per call from the variable named by `api_key_env`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::retry::RetryPolicy;
use crate::client::BackendConfig;
use crate::{DEFAULT_API_KEY_ENV, DEFAULT_ENDPOINT, DEFAULT_IMAGE_MODEL, DEFAULT_MODEL};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub endpoint: String,
    pub model: String,
    pub image_model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub thinking_budget: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for FerryConfig {
    fn default() -> Self {
        let backend = BackendConfig::default();
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            thinking_budget: backend.thinking_budget,
            connect_timeout_secs: backend.connect_timeout.as_secs(),
            read_timeout_secs: backend.read_timeout.as_secs(),
            request_timeout_secs: backend.request_timeout.as_secs(),
            retry: RetrySettings::default(),
        }
    }
}

/// The `[retry]` table. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub rate_limit_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub suggested_wait_margin_ms: u64,
    pub max_suggested_wait_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            rate_limit_attempts: policy.rate_limit_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            suggested_wait_margin_ms: policy.suggested_wait_margin.as_millis() as u64,
            max_suggested_wait_ms: policy.max_suggested_wait.as_millis() as u64,
        }
    }
}

impl FerryConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env();
        Ok(config)
    }

    /// Load a TOML file without looking at the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FERRY_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup. Empty values are
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(endpoint) = get("FERRY_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(model) = get("FERRY_MODEL") {
            self.model = model;
        }
        if let Some(model) = get("FERRY_IMAGE_MODEL") {
            self.image_model = model;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.retry;
        RetryPolicy {
            base_delay: Duration::from_millis(r.base_delay_ms),
            multiplier: r.multiplier,
            max_delay: Duration::from_millis(r.max_delay_ms),
            max_attempts: r.max_attempts.max(1),
            rate_limit_attempts: r.rate_limit_attempts,
            suggested_wait_margin: Duration::from_millis(r.suggested_wait_margin_ms),
            max_suggested_wait: Duration::from_millis(r.max_suggested_wait_ms),
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            image_model: self.image_model.clone(),
            api_key: None,
            api_key_env: self.api_key_env.clone(),
            thinking_budget: self.thinking_budget,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}
