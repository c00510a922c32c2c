//! Caller-layer retry and timeout helpers
//!
//! The RPC service never times requests out on its own. Callers bound a
//! request with [`reject_by_timeout`] and repeat it with [`retry`].

use crate::backoff::Backoff;
use crate::error::TimeoutError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default number of attempts made by [`retry`]
pub const RETRY_LIMIT: u32 = 3;

/// Run `task` until it succeeds or `limit` attempts have been made.
///
/// Between attempts the helper sleeps for the current [`Backoff`] delay.
/// Before each repeat `on_retry(last_error, attempt)` is called; returning
/// `true` stops retrying and the last error is returned.
pub async fn retry<T, E, F, Fut, R>(mut task: F, mut on_retry: R, limit: u32) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E, u32) -> bool,
{
    let limit = limit.max(1);
    let mut backoff = Backoff::new();
    let mut attempt = 0;

    loop {
        match task().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= limit || on_retry(&error, attempt) {
                    return Err(error);
                }
            }
        }

        debug!(target: "retry", "Attempt {} failed, retrying in {} ms", attempt, backoff.value());
        tokio::time::sleep(Duration::from_millis(backoff.value())).await;
        backoff.next();
    }
}

/// Fail with a [`TimeoutError`] if `future` does not complete within `timeout`
pub async fn reject_by_timeout<F>(
    future: F,
    timeout: Duration,
    context: Option<&str>,
) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| TimeoutError::new(context, timeout.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<&str, String> = retry(
            || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
            |_, _| false,
            RETRY_LIMIT,
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error_at_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), u32> = retry(
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(n) }
            },
            |_, _| false,
            2,
        )
        .await;

        assert_eq!(result, Err(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_retry_can_stop_early() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_hook = Arc::clone(&seen);

        let result: Result<(), &str> = retry(
            || async { Err("fatal") },
            |error, attempt| {
                assert_eq!(*error, "fatal");
                seen_in_hook.store(attempt, Ordering::SeqCst);
                true
            },
            5,
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_by_timeout_expires() {
        let result =
            reject_by_timeout(std::future::pending::<()>(), Duration::from_millis(5000), Some("room.enter"))
                .await;

        let error = result.unwrap_err();
        assert_eq!(error.timeout_ms, 5000);
        assert!(error.to_string().starts_with("[room.enter] "));
    }

    #[tokio::test]
    async fn test_reject_by_timeout_passes_value_through() {
        let result = reject_by_timeout(async { 42 }, Duration::from_secs(1), None).await;
        assert_eq!(result, Ok(42));
    }
}
