//! Retry Engine
//!
//! Wraps an asynchronous operation with bounded retries and exponential
//! backoff. The wrapper has no side effects on the store: it only decides
//! whether to run the operation again and when.
//!
//! # Algorithm
//!
//! 1. Await the initial attempt. On success, done.
//!
//! 2. On failure, stop if the attempt has been superseded. Otherwise ask the
//!    policy whether to retry: after the initial attempt it is asked with
//!    `0`, after retry `n` with `n + 1`.
//!
//! 3. Sleep for `delay(n)`, where `n` is the attempt that just failed.
//!
//! 4. Check supersession again, then run the operation. Repeat from 2.
//!
//! When the policy declines, the last error is returned unchanged.
//!
//! # Supersession
//!
//! A query attempt is superseded when a newer trigger replaced it in the
//! store. Its result would be discarded anyway, so the chain stops retrying
//! and propagates the error it currently holds.

use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::config::DEFAULT_RETRY_ATTEMPTS;
use crate::error::FetchError;

/// Upper bound for the default backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Per-attempt delay function.
pub type RetryDelay = Rc<dyn Fn(u32) -> Duration>;

/// Decides whether a failed attempt is retried.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Retry while the probed attempt number is below the limit.
    Attempts(u32),
    /// Retry while the predicate returns true for `(attempt, error)`.
    Custom(Rc<dyn Fn(u32, &FetchError) -> bool>),
}

impl RetryPolicy {
    /// Build a predicate policy.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(u32, &FetchError) -> bool + 'static,
    {
        RetryPolicy::Custom(Rc::new(predicate))
    }

    /// Whether to retry after a failure, probed with `attempt`.
    pub fn should_retry(&self, attempt: u32, error: &FetchError) -> bool {
        match self {
            RetryPolicy::Attempts(max) => attempt < *max,
            RetryPolicy::Custom(predicate) => predicate(attempt, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Attempts(DEFAULT_RETRY_ATTEMPTS)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Attempts(max) => f.debug_tuple("Attempts").field(max).finish(),
            RetryPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Exponential backoff: no delay for attempt 0, then 1s, 2s, 4s, ... capped
/// at [`MAX_RETRY_DELAY`].
pub fn default_retry_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let ms = 1u64
        .checked_shl(attempt - 1)
        .and_then(|factor| factor.checked_mul(1_000))
        .unwrap_or(u64::MAX);
    Duration::from_millis(ms).min(MAX_RETRY_DELAY)
}

/// Run `initial`, retrying with `fetch` according to `policy`.
///
/// `superseded` is probed before every retry decision and before every new
/// attempt; once it returns true the current error is returned.
pub async fn with_retries<T, I, F, Fut, S>(
    initial: I,
    fetch: F,
    superseded: S,
    policy: RetryPolicy,
    delay: Option<RetryDelay>,
) -> Result<T, FetchError>
where
    I: Future<Output = Result<T, FetchError>>,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    S: Fn() -> bool,
{
    let mut error = match initial.await {
        Ok(value) => return Ok(value),
        Err(error) => error,
    };

    let mut attempt = 0u32;
    loop {
        if superseded() {
            debug!(attempt, "attempt superseded, not retrying");
            return Err(error);
        }

        let probe = if attempt == 0 { 0 } else { attempt + 1 };
        if !policy.should_retry(probe, &error) {
            debug!(attempt, %error, "giving up");
            return Err(error);
        }

        let wait = match &delay {
            Some(delay) => delay(attempt),
            None => default_retry_delay(attempt),
        };
        debug!(attempt, delay_ms = wait.as_millis() as u64, %error, "retrying");
        tokio::time::sleep(wait).await;

        attempt += 1;
        if superseded() {
            debug!(attempt, "superseded during backoff");
            return Err(error);
        }

        match fetch().await {
            Ok(value) => return Ok(value),
            Err(e) => error = e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use tokio::time::Instant;

    fn failing(calls: &Rc<Cell<u32>>) -> impl Fn() -> std::future::Ready<Result<u32, FetchError>> {
        let calls = calls.clone();
        move || {
            calls.set(calls.get() + 1);
            std::future::ready(Err(FetchError::msg(format!("failure {}", calls.get()))))
        }
    }

    #[test]
    fn backoff_table() {
        assert_eq!(default_retry_delay(0), Duration::ZERO);
        assert_eq!(default_retry_delay(1), Duration::from_millis(1_000));
        assert_eq!(default_retry_delay(2), Duration::from_millis(2_000));
        assert_eq!(default_retry_delay(3), Duration::from_millis(4_000));
        assert_eq!(default_retry_delay(5), Duration::from_millis(16_000));
        assert_eq!(default_retry_delay(10), Duration::from_millis(30_000));
        assert_eq!(default_retry_delay(80), MAX_RETRY_DELAY);
    }

    #[test]
    fn attempts_policy() {
        let err = FetchError::msg("x");
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4, &err));
        assert!(!policy.should_retry(5, &err));
        assert!(!RetryPolicy::Attempts(0).should_retry(0, &err));
    }

    #[tokio::test(start_paused = true)]
    async fn success_needs_no_retry() {
        let calls = Rc::new(Cell::new(0));
        let result = with_retries(
            async { Ok(7) },
            failing(&calls),
            || false,
            RetryPolicy::default(),
            None,
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_policy_runs_five_attempts_with_backoff() {
        let calls = Rc::new(Cell::new(0));
        let fetch = failing(&calls);
        let start = Instant::now();

        let result = with_retries(fetch(), &fetch, || false, RetryPolicy::default(), None).await;

        // Initial attempt plus four retries.
        assert_eq!(calls.get(), 5);
        assert_eq!(result, Err(FetchError::msg("failure 5")));
        // 0 + 1s + 2s + 4s of backoff.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(7_000));
        assert!(elapsed < Duration::from_millis(7_100));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let fetch = move || {
            calls_clone.set(calls_clone.get() + 1);
            let n = calls_clone.get();
            async move {
                if n < 3 {
                    Err(FetchError::msg("flaky"))
                } else {
                    Ok(n)
                }
            }
        };

        let result = with_retries(fetch(), &fetch, || false, RetryPolicy::default(), None).await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_policy_sees_probed_attempts() {
        let calls = Rc::new(Cell::new(0));
        let fetch = failing(&calls);
        let probes = Rc::new(RefCell::new(Vec::new()));
        let probes_clone = probes.clone();
        let policy = RetryPolicy::custom(move |attempt, _| {
            probes_clone.borrow_mut().push(attempt);
            attempt < 3
        });

        let result = with_retries(fetch(), &fetch, || false, policy, None).await;
        assert!(result.is_err());
        assert_eq!(*probes.borrow(), vec![0, 2, 3]);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_delay_is_used() {
        let calls = Rc::new(Cell::new(0));
        let fetch = failing(&calls);
        let delay: RetryDelay = Rc::new(|_| Duration::from_millis(10));
        let start = Instant::now();

        let _ = with_retries(fetch(), &fetch, || false, RetryPolicy::Attempts(3), Some(delay)).await;

        // Probes 0, 2, 3: three runs, two delays.
        assert_eq!(calls.get(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_chain_stops_immediately() {
        let calls = Rc::new(Cell::new(0));
        let fetch = failing(&calls);

        let result = with_retries(fetch(), &fetch, || true, RetryPolicy::default(), None).await;
        assert_eq!(calls.get(), 1);
        assert_eq!(result, Err(FetchError::msg("failure 1")));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_during_backoff_keeps_current_error() {
        let calls = Rc::new(Cell::new(0));
        let fetch = failing(&calls);
        let checks = Cell::new(0);
        // Becomes superseded on the fourth probe: after the first retry failed
        // and before the second retry starts.
        let superseded = || {
            checks.set(checks.get() + 1);
            checks.get() >= 4
        };

        let result = with_retries(fetch(), &fetch, superseded, RetryPolicy::default(), None).await;
        assert_eq!(calls.get(), 2);
        assert_eq!(result, Err(FetchError::msg("failure 2")));
    }
}
