//! Progress events emitted while a call is being retried.
//!
//! The executor reports what it decided through [`StatusEvent`]s so a caller
//! that is mid-stream can surface "retrying in 4s" to the end user. Callers
//! implement [`StatusHandler`] or pick one of the provided handlers:
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopStatus`] | Tests or fire-and-forget calls |
//! | [`LoggingStatus`] | Structured logging via `tracing` |
//! | [`FnStatus`] | Quick closures, e.g. forwarding the note to a UI |

use std::time::Duration;

use tracing::{info, warn};

use super::classify::ErrorKind;

/// Events emitted by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A retryable failure occurred; the executor sleeps for `wait` and then
    /// makes attempt `next_attempt` (1-based) of `max_attempts`.
    Retrying {
        kind: ErrorKind,
        next_attempt: u32,
        max_attempts: u32,
        wait: Duration,
        /// Whether `wait` came from the server rather than from backoff.
        server_suggested: bool,
    },
    /// A rate limit raised the attempt budget. Happens at most once per call.
    BudgetExtended { from: u32, to: u32 },
    /// The attempt budget is spent; the last error is propagated.
    GaveUp { kind: ErrorKind, attempts: u32 },
}

impl StatusEvent {
    /// Human-readable progress note for end users.
    pub fn describe(&self) -> String {
        match self {
            StatusEvent::Retrying {
                kind,
                next_attempt,
                max_attempts,
                wait,
                ..
            } => {
                let reason = match kind {
                    ErrorKind::RateLimited => "Traffic limit reached",
                    ErrorKind::Overloaded => "The model is busy",
                    ErrorKind::NetworkFailure => "Connection problem",
                    _ => "Temporary error",
                };
                format!(
                    "{reason}; retrying in {}s (attempt {next_attempt}/{max_attempts})...",
                    wait.as_secs_f64().ceil() as u64
                )
            }
            StatusEvent::BudgetExtended { to, .. } => {
                format!("Rate limited; allowing up to {to} attempts.")
            }
            StatusEvent::GaveUp { attempts, .. } => {
                format!("Giving up after {attempts} attempts.")
            }
        }
    }
}

/// Observer for executor progress.
///
/// The default implementation ignores every event.
pub trait StatusHandler: Send + Sync {
    fn on_status(&self, event: &StatusEvent) {
        let _ = event;
    }
}

/// Ignores all events.
pub struct NoopStatus;
impl StatusHandler for NoopStatus {}

/// Logs every event through `tracing`.
pub struct LoggingStatus;

impl StatusHandler for LoggingStatus {
    fn on_status(&self, event: &StatusEvent) {
        match event {
            StatusEvent::Retrying { kind, wait, .. } => {
                warn!(%kind, wait_ms = wait.as_millis() as u64, "{}", event.describe());
            }
            StatusEvent::BudgetExtended { from, to } => {
                info!(from, to, "Attempt budget extended after rate limit");
            }
            StatusEvent::GaveUp { kind, attempts } => {
                warn!(%kind, attempts, "Retry budget exhausted");
            }
        }
    }
}

/// A status handler backed by a closure.
///
/// ```ignore
/// let handler = FnStatus::new(|event| eprintln!("{}", event.describe()));
/// ```
pub struct FnStatus<F>(F)
where
    F: Fn(&StatusEvent) + Send + Sync;

impl<F> FnStatus<F>
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> StatusHandler for FnStatus<F>
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    fn on_status(&self, event: &StatusEvent) {
        (self.0)(event)
    }
}
