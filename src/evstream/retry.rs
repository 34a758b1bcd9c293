//! Retry policies over one-shot asynchronous service calls.
//!
//! Two variants cover every call the receiver stack makes:
//!
//! - [`retry_on_error`] re-issues an operation while it fails with a
//!   transient error, failing fast on terminal ones. An optional fallback
//!   value substitutes for transient exhaustion (the close path uses this to
//!   stay best-effort).
//! - [`retry_while_none`] treats an empty result as the retry signal; the
//!   service legitimately returns nothing when a partition is idle.
//!
//! Both are additionally bounded by a wall-clock budget (the configured
//! operation timeout): any suspension longer than the budget is a failure,
//! not a hang.

use std::future::Future;
use std::time::Duration;

use crate::evstream::error::{EventHubsError, Result};

/// Maximum attempts before a retry loop gives up.
pub const RETRY_COUNT: u32 = 10;

/// Spacing between attempts.
pub const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Retry `op` on transient errors, up to [`RETRY_COUNT`] attempts within
/// `budget`. Terminal errors propagate unchanged. When `replacement` is
/// given, transient exhaustion (including the budget running out) yields it
/// instead of an error.
pub async fn retry_on_error<T, F, Fut>(
    label: &str,
    budget: Duration,
    mut op: F,
    replacement: Option<T>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = async {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < RETRY_COUNT => {
                    log::debug!(
                        "{}: transient failure on attempt {}/{}: {}",
                        label,
                        attempt,
                        RETRY_COUNT,
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(WAIT_INTERVAL).await;
                }
                Err(err) if err.is_transient() => {
                    log::warn!(
                        "{}: transient failures exhausted after {} attempts: {}",
                        label,
                        attempt,
                        err
                    );
                    return Err(EventHubsError::timeout(label, budget));
                }
                Err(err) => return Err(err),
            }
        }
    };

    let outcome = match tokio::time::timeout(budget, attempts).await {
        Ok(result) => result,
        Err(_) => Err(EventHubsError::timeout(label, budget)),
    };

    match outcome {
        Ok(value) => Ok(value),
        Err(err @ EventHubsError::Timeout { .. }) => match replacement {
            Some(fallback) => {
                log::warn!("{}: substituting the fallback value after retries: {}", label, err);
                Ok(fallback)
            }
            None => Err(err),
        },
        Err(err) => Err(err),
    }
}

/// Retry `op` while it succeeds with `None`, up to [`RETRY_COUNT`] attempts
/// within `budget`. Errors propagate unchanged; exhaustion fails with
/// [`EventHubsError::Timeout`].
pub async fn retry_while_none<T, F, Fut>(label: &str, budget: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let attempts = async {
        for attempt in 1..=RETRY_COUNT {
            match op().await? {
                Some(value) => return Ok(value),
                None => {
                    log::debug!("{}: empty receive on attempt {}/{}", label, attempt, RETRY_COUNT);
                    if attempt < RETRY_COUNT {
                        tokio::time::sleep(WAIT_INTERVAL).await;
                    }
                }
            }
        }
        Err(EventHubsError::timeout(label, budget))
    };

    match tokio::time::timeout(budget, attempts).await {
        Ok(result) => result,
        Err(_) => Err(EventHubsError::timeout(label, budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_on_error_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_on_error(
            "test op",
            Duration::from_secs(5),
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EventHubsError::Transient("server busy".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            None,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_error_fails_fast_on_terminal_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32> = retry_on_error(
            "test op",
            Duration::from_secs(5),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EventHubsError::ReceiverDisconnected("stolen".to_string())) }
            },
            None,
        )
        .await;
        assert!(matches!(result, Err(EventHubsError::ReceiverDisconnected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_on_error_substitutes_fallback_on_exhaustion() {
        let result = retry_on_error(
            "close",
            Duration::from_millis(50),
            || async { Err(EventHubsError::Transient("still busy".to_string())) },
            Some(()),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_retry_on_error_fallback_does_not_mask_terminal_errors() {
        let result = retry_on_error(
            "close",
            Duration::from_millis(50),
            || async { Err(EventHubsError::Internal("detached".to_string())) },
            Some(()),
        )
        .await;
        assert!(matches!(result, Err(EventHubsError::Internal(_))));
    }

    #[tokio::test]
    async fn test_retry_while_none_returns_first_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_while_none("test receive", Duration::from_secs(5), || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Ok(None)
                } else {
                    Ok(Some("event"))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "event");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_while_none_times_out_after_exhaustion() {
        let result: Result<u32> =
            retry_while_none("test receive", Duration::from_secs(30), || async { Ok(None) }).await;
        assert!(matches!(result, Err(EventHubsError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_retry_while_none_honors_wall_clock_budget() {
        let result: Result<u32> = retry_while_none("slow receive", Duration::from_millis(20), || {
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(None)
            }
        })
        .await;
        assert!(matches!(result, Err(EventHubsError::Timeout { .. })));
    }
}
