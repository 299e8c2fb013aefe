//! Per-step retry and timeout engine.
//!
//! Each attempt runs under an optional per-attempt timeout. Retryability is
//! decided by the error classification: non-retryable errors abort after
//! one attempt, retryable ones are retried up to the configured attempt
//! budget with a fixed delay or exponential backoff between attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::telemetry::SharedTelemetry;

/// Default total attempts when a policy does not specify `retries`.
pub const DEFAULT_RETRIES: u32 = 3;

/// Retry policy for a step.
///
/// `delay` (fixed seconds between attempts) and `backoff` (exponential
/// factor over a 1-second base) are mutually exclusive; configuring both is
/// rejected before any I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default 3).
    pub retries: Option<u32>,
    /// Fixed delay between attempts, in seconds.
    pub delay: Option<f64>,
    /// Exponential backoff factor: `1000ms × backoff^(attempt-1)`.
    pub backoff: Option<f64>,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            retries: Some(1),
            delay: None,
            backoff: None,
        }
    }

    /// Reject contradictory configuration.
    pub fn validate(&self) -> Result<()> {
        if self.delay.is_some() && self.backoff.is_some() {
            return Err(Error::configuration(
                "retry accepts either 'delay' or 'backoff', not both",
            ));
        }
        Ok(())
    }

    pub(crate) fn total_attempts(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES).max(1)
    }

    /// Sleep duration after the `attempt`-th failure (1-based), when any.
    pub(crate) fn sleep_after(&self, attempt: u32) -> Option<Duration> {
        if let Some(delay) = self.delay {
            return Some(Duration::from_secs_f64(delay.max(0.0)));
        }
        if let Some(backoff) = self.backoff {
            let ms = 1000.0 * backoff.powi(attempt.saturating_sub(1) as i32);
            return Some(Duration::from_millis(ms.max(0.0) as u64));
        }
        None
    }
}

/// Run `op` under the policy. The attempt closure receives the 1-based
/// attempt number; timings recorded inside it therefore cover only the
/// attempt that succeeded.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    telemetry: &SharedTelemetry,
    step_id: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.validate()?;
    let attempts = policy.total_attempts();

    for attempt in 1..=attempts {
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                Ok(result) => result,
                Err(_) => {
                    telemetry.counter("workflow.timeout", 1);
                    Err(Error::timeout(limit.as_millis() as u64).with_step(step_id))
                }
            },
            None => op(attempt).await,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        telemetry.counter("error", 1);
        if !err.retryable() || attempts == 1 {
            return Err(err);
        }
        if attempt == attempts {
            return Err(Error::retry_exhausted(attempts, err));
        }

        warn!(step = step_id, attempt, error = %err, "attempt failed, retrying");
        telemetry.counter("workflow.retry", 1);
        if let Some(pause) = policy.sleep_after(attempt) {
            tokio::time::sleep(pause).await;
        }
    }

    // The loop always returns; attempts is >= 1.
    Err(Error::configuration("retry loop ended without an outcome"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorKind;
    use crate::telemetry::{NoopTelemetry, RecordingTelemetry};

    fn noop() -> SharedTelemetry {
        Arc::new(NoopTelemetry)
    }

    #[test]
    fn delay_and_backoff_are_mutually_exclusive() {
        let policy = RetryPolicy {
            retries: None,
            delay: Some(1.0),
            backoff: Some(2.0),
        };
        assert_eq!(
            policy.validate().unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn backoff_schedule_is_exponential() {
        let policy = RetryPolicy {
            retries: Some(4),
            delay: None,
            backoff: Some(2.0),
        };
        assert_eq!(policy.sleep_after(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.sleep_after(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.sleep_after(3), Some(Duration::from_millis(4000)));
    }

    #[tokio::test]
    async fn non_retryable_error_aborts_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(
            &RetryPolicy::default(),
            None,
            &noop(),
            "s",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::validation("t", "bad args")) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_error_is_retried_up_to_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(
            &RetryPolicy {
                retries: Some(3),
                delay: None,
                backoff: None,
            },
            None,
            &noop(),
            "s",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::mcp_connection("flaky")) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(
            &RetryPolicy {
                retries: Some(2),
                delay: None,
                backoff: None,
            },
            None,
            &noop(),
            "s",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Err(Error::timeout(100))
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_and_counts() {
        let telemetry = RecordingTelemetry::new();
        let shared: SharedTelemetry = Arc::clone(&telemetry);
        let result: Result<()> = run_with_retry(
            &RetryPolicy::none(),
            Some(Duration::from_millis(50)),
            &shared,
            "s",
            |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(telemetry.counter_total("workflow.timeout"), 1);
    }
}
