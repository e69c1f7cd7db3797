//! Failure handling and streaming between callers and a model backend.
//!
//! - [`classify`] — maps raw failures (status, transport error, message
//!   text) to an [`ErrorKind`] with a user-facing message, a retryable flag
//!   and an optional server-suggested wait.
//! - [`retry`] — [`RetryPolicy`] and the [`execute`] loop: exponential
//!   backoff, suggested waits, a one-time budget extension on rate limits.
//! - [`status`] — [`StatusEvent`]s the executor emits while retrying, and
//!   the [`StatusHandler`] trait that receives them.
//! - [`streaming`] — [`Chunk`], [`ChunkSink`] and the [`StreamingRelay`].
//! - [`sse`] — incremental Server-Sent Events decoding of provider bodies.

pub mod classify;
pub mod retry;
pub mod sse;
pub mod status;
pub mod streaming;

pub use classify::{ClassifiedError, ErrorKind, RawFailure, classify, parse_suggested_wait};
pub use retry::{RetryPolicy, execute};
pub use status::{FnStatus, LoggingStatus, NoopStatus, StatusEvent, StatusHandler};
pub use streaming::{
    Chunk, ChunkSink, ChunkStream, FnSink, RelayReport, RelayState, SinkClosed, StreamingRelay,
};
