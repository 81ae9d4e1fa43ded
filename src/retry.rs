//! The retry and rate-limit governor.
//!
//! Wraps a single AWS call with exponential backoff and full jitter, maps
//! conflict/not-found into their skip outcomes without retrying, and tracks
//! a rolling throttling window so [`crate::executor::MultiAccountExecutor`]
//! can adapt its concurrency.

use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::CoreError;
use crate::log_warn;

const BASE_DELAY_MS: u64 = 500;
const BACKOFF_FACTOR: u64 = 2;
const CAP_MS: u64 = 30_000;

/// What to do with a single-call outcome once the governor has classified
/// the underlying error.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Succeeded(T),
    /// `create-account-assignment` hit an existing assignment.
    SkippedAlreadyPresent,
    /// `delete-account-assignment` targeted an assignment already gone.
    SkippedAlreadyAbsent,
    /// Terminal failure after retries exhausted or a non-retriable error.
    Failed(CoreError),
}

/// Exponential-backoff-with-full-jitter policy: base 0.5s,
/// factor 2, cap 30s.
pub fn backoff_delay(attempt: u32) -> StdDuration {
    let capped = BASE_DELAY_MS
        .saturating_mul(BACKOFF_FACTOR.saturating_pow(attempt))
        .min(CAP_MS);
    let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
    StdDuration::from_millis(jittered)
}

/// Rolling window of throttling events, used to drive adaptive concurrency.
struct ThrottleWindow {
    events: Vec<DateTime<Utc>>,
}

impl ThrottleWindow {
    fn new() -> Self {
        Self { events: Vec::new() }
    }

    fn record(&mut self, now: DateTime<Utc>, window_secs: i64) {
        self.events.push(now);
        self.prune(now, window_secs);
    }

    fn prune(&mut self, now: DateTime<Utc>, window_secs: i64) {
        let cutoff = now - chrono::Duration::seconds(window_secs);
        self.events.retain(|t| *t >= cutoff);
    }

    fn count(&self, now: DateTime<Utc>, window_secs: i64) -> usize {
        let cutoff = now - chrono::Duration::seconds(window_secs);
        self.events.iter().filter(|t| **t >= cutoff).count()
    }
}

/// Wraps AWS calls with retry/backoff and exposes an adaptive concurrency
/// signal to the executor.
pub struct RetryGovernor {
    max_retries: u32,
    /// Consecutive-throttle threshold within `window_secs` that triggers a
    /// concurrency reduction.
    throttle_threshold: usize,
    window_secs: i64,
    window: Mutex<ThrottleWindow>,
    last_recovery_check: Mutex<DateTime<Utc>>,
    /// The most recent throttle event already accounted for by a
    /// concurrency reduction, so a periodic caller invoking
    /// `adjust_concurrency` repeatedly during one spike reduces once per
    /// new event rather than compounding every tick.
    last_reduction_event: Mutex<Option<DateTime<Utc>>>,
}

impl RetryGovernor {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            throttle_threshold: 3,
            window_secs: 10,
            window: Mutex::new(ThrottleWindow::new()),
            last_recovery_check: Mutex::new(Utc::now()),
            last_reduction_event: Mutex::new(None),
        }
    }

    /// Executes `call`, retrying on retriable errors up to `max_retries`
    /// times and sleeping `backoff_delay` between attempts. Non-retriable
    /// errors terminate immediately; `AwsConflict`/`AwsNotFound` are mapped
    /// to their skip outcomes per `classify_for` (create vs delete context).
    /// Returns the number of retries actually taken alongside the outcome,
    /// so callers can populate `AssignmentRecord::retries`.
    pub async fn call<T, F, Fut>(&self, is_create: bool, mut call: F) -> (CallOutcome<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(v) => return (CallOutcome::Succeeded(v), attempt),
                Err(CoreError::AwsConflict { .. }) if is_create => {
                    return (CallOutcome::SkippedAlreadyPresent, attempt)
                }
                Err(CoreError::AwsNotFound { .. }) if !is_create => {
                    return (CallOutcome::SkippedAlreadyAbsent, attempt)
                }
                Err(e) if e.is_retriable() => {
                    if matches!(e, CoreError::AwsThrottling { .. }) {
                        self.record_throttle();
                    }
                    if attempt >= self.max_retries {
                        log_warn!("retry budget exhausted after {attempt} attempts: {e}");
                        return (CallOutcome::Failed(e), attempt);
                    }
                    let delay = backoff_delay(attempt);
                    log_warn!("retriable error on attempt {attempt}, backing off {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return (CallOutcome::Failed(e), attempt),
            }
        }
    }

    fn record_throttle(&self) {
        let now = Utc::now();
        self.window.lock().unwrap().record(now, self.window_secs);
    }

    /// True if the throttling window has crossed the consecutive-event
    /// threshold and the executor should reduce concurrency.
    pub fn should_reduce_concurrency(&self) -> bool {
        let now = Utc::now();
        self.window.lock().unwrap().count(now, self.window_secs) >= self.throttle_threshold
    }

    /// Applies the 25%-reduction / 10%-recovery policy to a concurrency
    /// value, floored at 4. Safe to call on every scheduling
    /// tick: a reduction is only applied once per distinct throttle event,
    /// so a periodic caller doesn't compound the 25% cut every tick of a
    /// single ongoing spike. `now` is threaded through for determinism in
    /// tests.
    pub fn adjust_concurrency(&self, current: u32, now: DateTime<Utc>) -> u32 {
        let window = self.window.lock().unwrap();
        let over_threshold = window.count(now, self.window_secs) >= self.throttle_threshold;
        let latest_event = window.events.last().copied();
        drop(window);

        if over_threshold {
            let mut last_reduction = self.last_reduction_event.lock().unwrap();
            if *last_reduction != latest_event {
                *last_reduction = latest_event;
                *self.last_recovery_check.lock().unwrap() = now;
                return (current * 3 / 4).max(4);
            }
            return current;
        }
        let mut last_check = self.last_recovery_check.lock().unwrap();
        if now - *last_check >= chrono::Duration::minutes(1) {
            *last_check = now;
            return current + (current / 10).max(1);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let governor = RetryGovernor::new(3);
        let attempts = AtomicU32::new(0);
        let (outcome, retries) = governor
            .call(true, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CoreError::AwsThrottling { message: "x".to_string() })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(outcome, CallOutcome::Succeeded(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn conflict_on_create_is_skipped_not_retried() {
        let governor = RetryGovernor::new(3);
        let calls = AtomicU32::new(0);
        let (outcome, retries): (CallOutcome<()>, u32) = governor
            .call(true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::AwsConflict { existing: "x".to_string() }) }
            })
            .await;
        assert_eq!(outcome, CallOutcome::SkippedAlreadyPresent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn not_found_on_delete_is_skipped_not_retried() {
        let governor = RetryGovernor::new(3);
        let (outcome, _retries): (CallOutcome<()>, u32) = governor
            .call(false, || async { Err(CoreError::AwsNotFound { target: "x".to_string() }) })
            .await;
        assert_eq!(outcome, CallOutcome::SkippedAlreadyAbsent);
    }

    #[tokio::test]
    async fn access_denied_fails_without_retry() {
        let governor = RetryGovernor::new(3);
        let calls = AtomicU32::new(0);
        let (outcome, retries): (CallOutcome<()>, u32) = governor
            .call(true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CoreError::AwsAccessDenied {
                        action: "a".to_string(),
                        arn: "b".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(outcome, CallOutcome::Failed(CoreError::AwsAccessDenied { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }

    #[test]
    fn three_consecutive_throttles_trigger_25_percent_reduction() {
        let governor = RetryGovernor::new(3);
        let now = Utc::now();
        for _ in 0..3 {
            governor.window.lock().unwrap().record(now, governor.window_secs);
        }
        assert!(governor.should_reduce_concurrency());
        assert_eq!(governor.adjust_concurrency(20, now), 15);
    }

    #[test]
    fn floor_is_four() {
        let governor = RetryGovernor::new(3);
        let now = Utc::now();
        for _ in 0..3 {
            governor.window.lock().unwrap().record(now, governor.window_secs);
        }
        assert_eq!(governor.adjust_concurrency(4, now), 4);
    }

    #[test]
    fn recovery_grows_concurrency_after_a_minute_without_throttling() {
        let governor = RetryGovernor::new(3);
        let now = Utc::now();
        *governor.last_recovery_check.lock().unwrap() = now - chrono::Duration::minutes(2);
        assert_eq!(governor.adjust_concurrency(20, now), 22);
    }

    #[test]
    fn backoff_delay_is_capped() {
        for attempt in 0..10 {
            assert!(backoff_delay(attempt) <= StdDuration::from_millis(CAP_MS));
        }
    }
}
