//! Convenience re-exports for common `ferry` types.
//!
//! ```ignore
//! use ferry::prelude::*;
//! ```
//!
//! Pulls in the request model, the [`Assistant`] facade, backend factories,
//! configuration, status handlers and the relay's chunk/sink types. The SSE
//! decoder and classification internals are left out; import those from
//! [`crate::api`] directly when needed.

// ── Request model ───────────────────────────────────────────────────
pub use crate::{Attachment, Capabilities, Completion, GenerateRequest, Role, Turn, UsageInfo};

// ── Failure handling ────────────────────────────────────────────────
pub use crate::api::{
    ClassifiedError, ErrorKind, FnStatus, LoggingStatus, NoopStatus, RetryPolicy, StatusEvent,
    StatusHandler,
};

// ── Streaming ───────────────────────────────────────────────────────
pub use crate::api::{Chunk, ChunkSink, FnSink, RelayReport, RelayState, SinkClosed};
pub use tokio_util::sync::CancellationToken;

// ── Backends and configuration ──────────────────────────────────────
pub use crate::client::{BackendConfig, BackendFactory, FixedBackend, HttpBackendFactory, ModelBackend};
pub use crate::config::FerryConfig;
pub use crate::service::Assistant;
