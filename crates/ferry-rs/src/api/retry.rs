//! Resilient call execution with classification-aware retry and backoff.
//!
//! [`execute`] runs an operation, classifies each failure with
//! [`classify`](super::classify::classify), and decides from the kind whether
//! to give up at once, wait out a server-suggested delay, or back off
//! exponentially. Backoff is jitter-free doubling from
//! [`RetryPolicy::base_delay`] capped at [`RetryPolicy::max_delay`].
//!
//! A rate limit raises the attempt budget once per call (3 → 6 by default) so
//! a full quota-reset window can pass. Never cumulatively.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::classify::{ClassifiedError, ErrorKind, RawFailure, classify};
use super::status::{StatusEvent, StatusHandler};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
    /// Cap on any single backoff wait.
    pub max_delay: Duration,
    /// Total attempts allowed (including the first).
    pub max_attempts: u32,
    /// Attempt budget used once a rate limit has been seen.
    pub rate_limit_attempts: u32,
    /// Added to every server-suggested wait.
    pub suggested_wait_margin: Duration,
    /// Suggested waits longer than this are not honoured; the call fails
    /// with the rate-limit error instead.
    pub max_suggested_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
            rate_limit_attempts: 6,
            suggested_wait_margin: Duration::from_millis(1000),
            max_suggested_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy allowing `attempts` attempts, with the rate-limit budget
    /// doubled as usual.
    pub fn with_attempts(attempts: u32) -> Self {
        let attempts = attempts.max(1);
        Self {
            max_attempts: attempts,
            rate_limit_attempts: attempts.saturating_mul(2),
            ..Default::default()
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            rate_limit_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_rate_limit_attempts(mut self, attempts: u32) -> Self {
        self.rate_limit_attempts = attempts;
        self
    }

    /// Backoff delay after the failure of attempt `attempt` (0-indexed).
    ///
    /// Non-decreasing in `attempt` until [`max_delay`](Self::max_delay) is
    /// reached, constant afterwards.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// The wait actually used for a server-suggested delay.
    pub fn suggested_wait(&self, suggested: Duration) -> Duration {
        suggested.saturating_add(self.suggested_wait_margin)
    }

    /// Largest attempt budget a single call can reach.
    pub fn attempt_ceiling(&self) -> u32 {
        self.max_attempts.max(self.rate_limit_attempts).max(1)
    }

    /// Upper bound on the total time one call can spend sleeping between
    /// attempts, i.e. the worst latency retries can add before the caller
    /// sees a result or an error.
    pub fn worst_case_wait(&self) -> Duration {
        let per_wait = self
            .max_delay
            .max(self.suggested_wait(self.max_suggested_wait));
        per_wait.saturating_mul(self.attempt_ceiling() - 1)
    }
}

/// Run `operation` under `policy`, retrying retryable failures.
///
/// Non-retryable failures propagate after exactly one attempt. Retryable ones
/// are absorbed until the (possibly extended) attempt budget is spent; the
/// last classified error is then returned. `status` hears about every retry
/// before the executor sleeps.
///
/// Dropping the returned future abandons any pending sleep, which is how the
/// streaming relay cancels a call mid-backoff.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    status: &dyn StatusHandler,
    mut operation: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RawFailure>>,
{
    let mut max_attempts = policy.max_attempts.max(1);
    let mut budget_extended = false;
    let mut attempt: u32 = 0;

    loop {
        let raw = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Call succeeded on attempt {}", attempt + 1);
                }
                return Ok(value);
            }
            Err(raw) => raw,
        };
        attempt += 1;

        let error = classify(&raw);
        if !error.retryable {
            warn!(
                kind = %error.kind,
                "Non-retryable failure on attempt {attempt}: {}",
                error.diagnostic
            );
            return Err(error);
        }

        if error.kind == ErrorKind::RateLimited && !budget_extended {
            budget_extended = true;
            let extended = policy.rate_limit_attempts.max(max_attempts);
            if extended > max_attempts {
                status.on_status(&StatusEvent::BudgetExtended {
                    from: max_attempts,
                    to: extended,
                });
                max_attempts = extended;
            }
        }

        if attempt >= max_attempts {
            status.on_status(&StatusEvent::GaveUp {
                kind: error.kind,
                attempts: attempt,
            });
            return Err(error);
        }

        let (wait, server_suggested) = match error.suggested_wait {
            Some(suggested) if suggested > policy.max_suggested_wait => {
                warn!(
                    "Server asked to wait {suggested:?}, more than the allowed {:?}; giving up",
                    policy.max_suggested_wait
                );
                status.on_status(&StatusEvent::GaveUp {
                    kind: error.kind,
                    attempts: attempt,
                });
                return Err(error);
            }
            Some(suggested) => (policy.suggested_wait(suggested), true),
            None => (policy.delay_for_attempt(attempt - 1), false),
        };

        debug!(
            kind = %error.kind,
            "Transient failure (attempt {attempt}/{max_attempts}): {}",
            error.diagnostic
        );
        status.on_status(&StatusEvent::Retrying {
            kind: error.kind,
            next_attempt: attempt + 1,
            max_attempts,
            wait,
            server_suggested,
        });
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::status::{FnStatus, NoopStatus};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every status event for later inspection.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<StatusEvent>>);

    impl StatusHandler for Recorder {
        fn on_status(&self, event: &StatusEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn waits(&self) -> Vec<Duration> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    StatusEvent::Retrying { wait, .. } => Some(*wait),
                    _ => None,
                })
                .collect()
        }

        fn extensions(&self) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, StatusEvent::BudgetExtended { .. }))
                .count()
        }
    }

    fn always_fail(
        calls: &AtomicU32,
        raw: RawFailure,
    ) -> impl FnMut() -> std::future::Ready<Result<(), RawFailure>> + '_ {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(raw.clone()))
        }
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.rate_limit_attempts, 6);
        assert_eq!(policy.base_delay, Duration::from_millis(2000));
    }

    #[test]
    fn delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (0..6)
            .map(|a| policy.delay_for_attempt(a).as_millis())
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 10000, 10000, 10000]);
    }

    #[test]
    fn delay_is_monotonic() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(30));
        let mut last = Duration::ZERO;
        for attempt in 0..40 {
            let d = policy.delay_for_attempt(attempt);
            assert!(d >= last, "attempt {attempt}: {d:?} < {last:?}");
            last = d;
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn worst_case_wait_bounds_all_sleeps() {
        let policy = RetryPolicy::default();
        // 5 sleeps at most, each at most max(10s, 60s + 1s).
        assert_eq!(policy.worst_case_wait(), Duration::from_secs(61 * 5));
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result = execute(&RetryPolicy::default(), &NoopStatus, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RawFailure>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_config_fails_fast_without_sleeping() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();
        let start = tokio::time::Instant::now();

        let err = execute(
            &RetryPolicy::default(),
            &recorder,
            always_fail(&calls, RawFailure::new("API_KEY_MISSING")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::MissingConfig);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(recorder.waits().is_empty());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_kinds_run_once() {
        for message in ["blocked: SAFETY", "HTTP 400: bad request", "HTTP 401: unauthorized"] {
            let calls = AtomicU32::new(0);
            let result = execute(
                &RetryPolicy::default(),
                &NoopStatus,
                always_fail(&calls, RawFailure::new(message)),
            )
            .await;
            assert!(result.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{message}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_extends_budget_once_with_capped_backoff() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();

        let err = execute(
            &RetryPolicy::default(),
            &recorder,
            always_fail(&calls, RawFailure::with_status(429, "Too Many Requests")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(recorder.extensions(), 1);
        let waits: Vec<u128> = recorder.waits().iter().map(|w| w.as_millis()).collect();
        assert_eq!(waits, vec![2000, 4000, 8000, 10000, 10000]);
    }

    #[tokio::test(start_paused = true)]
    async fn overload_never_exceeds_base_budget() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();

        let err = execute(
            &RetryPolicy::default(),
            &recorder,
            always_fail(&calls, RawFailure::with_status(503, "overloaded")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Overloaded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.extensions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_rate_limits_do_not_grow_budget_further() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();
        let policy = RetryPolicy::with_attempts(2).with_base_delay(Duration::from_millis(10));

        let _ = execute(
            &policy,
            &recorder,
            always_fail(&calls, RawFailure::new("quota exceeded")),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(recorder.extensions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suggested_wait_takes_precedence_with_margin() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();

        let result = execute(&RetryPolicy::default(), &recorder, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RawFailure::new("429 quota exceeded. Please retry in 7s."))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        let waits = recorder.waits();
        assert_eq!(waits, vec![Duration::from_secs(8)]);
        assert!(waits[0] >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_suggested_wait_fails_instead_of_sleeping_less() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();
        let start = tokio::time::Instant::now();

        let err = execute(
            &RetryPolicy::default(),
            &recorder,
            always_fail(&calls, RawFailure::new("quota exceeded, retry in 3600s")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(recorder.waits().is_empty());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_suggested_wait_gives_up() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();

        let err = execute(
            &RetryPolicy::default(),
            &recorder,
            always_fail(
                &calls,
                RawFailure::with_status(429, "slow down").with_retry_after(Duration::MAX),
            ),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(recorder.waits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_network_failure() {
        let calls = AtomicU32::new(0);
        let notes = Mutex::new(Vec::new());
        let status = FnStatus::new(|event: &StatusEvent| {
            notes.lock().unwrap().push(event.describe());
        });

        let result = execute(&RetryPolicy::default(), &status, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 | 1 => Err(RawFailure::new("request failed: connection reset")),
                    _ => Ok(n),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        let notes = notes.lock().unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(
            notes[0],
            "Connection problem; retrying in 2s (attempt 2/3)..."
        );
        assert_eq!(
            notes[1],
            "Connection problem; retrying in 4s (attempt 3/3)..."
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_failures_are_bounded() {
        let calls = AtomicU32::new(0);
        let _ = execute(
            &RetryPolicy::default(),
            &NoopStatus,
            always_fail(&calls, RawFailure::new("mystery")),
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
