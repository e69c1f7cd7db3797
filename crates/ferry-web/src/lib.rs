//! HTTP proxy for browser clients.
//!
//! `ferry-web` serves an axum router that keeps the model API key on the
//! server and forwards browser requests through an [`Assistant`], so every
//! call gets classification, retry and (for `/api/stream`) the streaming
//! relay.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ferry::prelude::*;
//! use ferry_web::{WebConfig, spawn_web};
//!
//! let config = FerryConfig::from_env();
//! let assistant = Assistant::new(HttpBackendFactory::new(config.backend_config()))
//!     .with_policy(config.retry_policy());
//! let addr = spawn_web(Arc::new(assistant), WebConfig::default()).await?;
//! println!("Listening on http://{addr}");
//! ```
//!
//! # Endpoints
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /api/generate` | `{ action: "chat" \| "generate", ... }` → `{ text }` |
//! | `POST /api/stream` | Chat reply as Server-Sent Events (`chunk`, `error`, `done`) |
//! | `GET /api/health` | `{ status: "ok" }` |
//!
//! Failures are answered with `{ error, kind }` and a status derived from
//! the [`ErrorKind`](ferry::api::ErrorKind).

mod api;
mod server;

pub use api::{ApiError, GenerateBody, status_for};
pub use server::{build_router, start_server};

use std::net::SocketAddr;
use std::sync::Arc;

use ferry::service::Assistant;

/// Largest accepted request body (images arrive inline as data URLs).
pub const DEFAULT_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:3001`.
    pub bind_addr: SocketAddr,
    /// Request body limit in bytes. Default: 4 MiB.
    pub body_limit: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_web(
    assistant: Arc<Assistant>,
    config: WebConfig,
) -> std::io::Result<SocketAddr> {
    let router = build_router(assistant, config.body_limit);
    start_server(router, config.bind_addr).await
}
