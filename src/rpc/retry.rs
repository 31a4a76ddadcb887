//! Retry/backoff policy shared by the Tendermint and EVM RPC adapters
//! (spec.md §7: "transient RPC failures are retried with exponential backoff;
//! terminal failures are not retried").

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorCategory, PollError, RecoveryAction};

/// Exponential backoff parameters. Matches spec.md §7's "bounded exponential
/// backoff" description: delay doubles per attempt up to `max_delay_ms`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(10));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Runs `operation` until it succeeds, exhausts `policy.max_attempts`, the
/// error it returns is marked non-recoverable, or `cancel` fires.
///
/// A cancellation mid-backoff returns [`PollError::cancelled`] rather than the
/// last transport error, since the caller asked to stop, not that the chain
/// failed.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PollError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::cancelled());
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let recoverable = err.is_recoverable.unwrap_or(false);
                if !recoverable || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    message = %err.message,
                    "rpc call failed, retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PollError::cancelled()),
                }
            }
        }
    }
}

/// Classifies a `reqwest` transport failure into the wire error taxonomy
/// (spec.md §6): connection-level failures are `Network` and recoverable,
/// non-2xx/decoding failures are `Rpc` and recoverable, everything else is
/// `Unknown` and treated as non-recoverable so it surfaces immediately.
pub fn classify_transport_error(err: &reqwest::Error) -> PollError {
    let (category, recoverable, action) = if err.is_connect() || err.is_timeout() {
        (ErrorCategory::Network, true, RecoveryAction::CheckConnection)
    } else if err.is_status() || err.is_decode() || err.is_body() {
        (ErrorCategory::Rpc, true, RecoveryAction::CheckRpcStatus)
    } else {
        (ErrorCategory::Unknown, false, RecoveryAction::ContactSupport)
    };
    PollError::new(crate::error::ErrorSeverity::PollingError, err.to_string())
        .with_category(category)
        .with_recovery(recoverable, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retries_recoverable_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let cancel = CancellationToken::new();
        let result = retry_with_backoff(&policy, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PollError::new(crate::error::ErrorSeverity::PollingError, "transient")
                        .with_recovery(true, RecoveryAction::Retry))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_recoverable_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let result: Result<(), PollError> = retry_with_backoff(&policy, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(PollError::tx_error("bad transaction")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let cancel = CancellationToken::new();
        let result: Result<(), PollError> = retry_with_backoff(&policy, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(PollError::new(crate::error::ErrorSeverity::PollingError, "down")
                    .with_recovery(true, RecoveryAction::Retry))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_backoff() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), PollError> = retry_with_backoff(&policy, &cancel, || async {
            Err(PollError::new(crate::error::ErrorSeverity::PollingError, "down")
                .with_recovery(true, RecoveryAction::Retry))
        })
        .await;
        assert!(matches!(result, Err(e) if e.message == "Polling cancelled"));
    }
}
