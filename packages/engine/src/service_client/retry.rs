//! Generic retry wrapper (spec.md §4.3.1). A Rust closure already captures
//! its call's arguments, so this is a plain async function taking the retried
//! operation rather than a trait-object decorator — adapted from the
//! teacher's `classify_error`/`mark_failed` dance in `kernel/jobs/runner.rs`,
//! moved from "requeue in DB" to "sleep and re-attempt in-process".

use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::ServiceError;
use crate::store::Store;

pub struct RetryOptions {
    pub tries: u32,
    pub delay: std::time::Duration,
    /// If true, on exhaustion `Store::unlock(task_id)` runs before the error
    /// is returned to the caller.
    pub unlock_on_fail: Option<(Arc<Store>, i64)>,
}

impl RetryOptions {
    pub fn new(tries: u32, delay: std::time::Duration) -> Result<Self, anyhow::Error> {
        if tries < 1 {
            anyhow::bail!("tries must be >= 1");
        }
        Ok(Self {
            tries,
            delay,
            unlock_on_fail: None,
        })
    }

    pub fn unlock_on_fail(mut self, store: Arc<Store>, task_id: i64) -> Self {
        self.unlock_on_fail = Some((store, task_id));
        self
    }
}

/// Runs `op` up to `options.tries` times, sleeping `options.delay` between
/// attempts, retrying only errors where `ServiceError::is_retryable()` is
/// true. On exhaustion, unlocks the task (if configured) and re-raises the
/// last captured failure.
pub async fn retry<F, Fut, T>(options: RetryOptions, mut op: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < options.tries => {
                warn!(attempt, tries = options.tries, error = %err, "retrying service call");
                tokio::time::sleep(options.delay).await;
                continue;
            }
            Err(err) => {
                if let Some((store, task_id)) = &options.unlock_on_fail {
                    if let Err(unlock_err) = store.unlock(*task_id).await {
                        warn!(task_id, error = %unlock_err, "failed to unlock task after retry exhaustion");
                    }
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let calls = AtomicU32::new(0);
        let options = RetryOptions::new(3, std::time::Duration::from_millis(1)).unwrap();
        let result: Result<i32, ServiceError> = retry(options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_up_to_tries() {
        let calls = AtomicU32::new(0);
        let options = RetryOptions::new(3, std::time::Duration::from_millis(1)).unwrap();
        let result: Result<i32, ServiceError> = retry(options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::ProtocolError("boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let calls = AtomicU32::new(0);
        let options = RetryOptions::new(3, std::time::Duration::from_millis(1)).unwrap();
        let result: Result<i32, ServiceError> = retry(options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::ServiceAccessDenied) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn construction_fails_for_zero_tries() {
        assert!(RetryOptions::new(0, std::time::Duration::from_secs(1)).is_err());
    }
}
