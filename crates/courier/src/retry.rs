//! Bounded retry around a single-shot action.
//!
//! Converts one attempt into at most `num_retries + 1` attempts with a fixed
//! sleep between them. Terminal errors and cancellation short-circuit; the
//! sleep itself races against the cancellation token so a cancelled run never
//! waits out a retry interval.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{WorkerError, deserialize_duration, serialize_duration};

/// Per-worker retry knobs, loaded from `[workerType.<name>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Extra attempts after the first one.
    #[serde(default, rename = "numRetries")]
    pub num_retries: u32,
    /// Fixed pause between attempts.
    #[serde(
        default,
        rename = "retrySleep",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_sleep: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            num_retries: 0,
            retry_sleep: Duration::ZERO,
        }
    }
}

impl RetrySettings {
    /// The worst-case time spent sleeping must fit inside the stage budget.
    pub fn validate_within(&self, stage_timeout: Duration) -> Result<(), String> {
        let total_sleep = self
            .retry_sleep
            .checked_mul(self.num_retries)
            .ok_or_else(|| "numRetries x retrySleep overflows".to_string())?;
        if total_sleep > stage_timeout {
            return Err(format!(
                "numRetries ({}) x retrySleep ({:?}) exceeds the stage timeout ({:?})",
                self.num_retries, self.retry_sleep, stage_timeout
            ));
        }
        Ok(())
    }
}

/// Run `op` until it succeeds, a terminal error surfaces, the attempts are
/// exhausted, or the token is cancelled.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    settings: RetrySettings,
    mut op: F,
) -> Result<T, WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let attempts = settings.num_retries.saturating_add(1);
    let mut last_err = WorkerError::Transient("no attempts were made".to_string());

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => {
                tracing::debug!(attempt, attempts, error = %err, "attempt failed");
                last_err = err;
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(settings.retry_sleep) => {}
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn settings(num_retries: u32, sleep: Duration) -> RetrySettings {
        RetrySettings {
            num_retries,
            retry_sleep: sleep,
        }
    }

    #[tokio::test]
    async fn first_success_needs_no_retry() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let out = retry(&cancel, settings(3, Duration::from_secs(1)), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, WorkerError>(7)
            }
        })
        .await;

        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let out = retry(&cancel, settings(3, Duration::from_secs(5)), move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WorkerError::Transient("exit 1".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(out, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_surface_the_last_error() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let out: Result<(), _> = retry(&cancel, settings(2, Duration::from_secs(1)), move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(WorkerError::Transient(format!("attempt {n}")))
            }
        })
        .await;

        assert_eq!(out, Err(WorkerError::Transient("attempt 2".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_bypass_remaining_attempts() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let out: Result<(), _> = retry(&cancel, settings(5, Duration::from_secs(1)), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(WorkerError::AuthNeeded("oidc prompt".into()))
            }
        })
        .await;

        assert_eq!(out, Err(WorkerError::AuthNeeded("oidc prompt".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_the_sleep_stops_further_attempts() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let cancel_in_op = cancel.clone();

        let out: Result<(), _> = retry(&cancel, settings(5, Duration::from_secs(3600)), move || {
            let c = c.clone();
            let cancel_in_op = cancel_in_op.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                // Fail, then cancel while the wrapper is sleeping.
                cancel_in_op.cancel();
                Err(WorkerError::Transient("exit 1".into()))
            }
        })
        .await;

        assert_eq!(out, Err(WorkerError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_returns_cancelled_without_an_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let out: Result<(), _> = retry(&cancel, settings(1, Duration::ZERO), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(out, Err(WorkerError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn validate_within_accepts_budgets_that_fit() {
        let s = settings(3, Duration::from_secs(10));
        assert!(s.validate_within(Duration::from_secs(30)).is_ok());
        assert!(s.validate_within(Duration::from_secs(31)).is_ok());
    }

    #[test]
    fn validate_within_rejects_oversized_budgets() {
        let s = settings(4, Duration::from_secs(10));
        let err = s.validate_within(Duration::from_secs(30)).unwrap_err();
        assert!(err.contains("exceeds"));
    }

    #[test]
    fn retry_settings_deserialize_from_config_keys() {
        let s: RetrySettings =
            toml::from_str("numRetries = 3\nretrySleep = \"15s\"\n").expect("parse");
        assert_eq!(s.num_retries, 3);
        assert_eq!(s.retry_sleep, Duration::from_secs(15));
    }
}
