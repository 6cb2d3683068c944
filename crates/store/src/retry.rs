//! Bounded exponential backoff for transient storage failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{classify, Result, StoreError};

/// Retry schedule applied to every bucket operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is exhausted. Only transient errors are retried.
    pub(crate) async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, object_store::Error>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let err = classify(err);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    if attempt >= self.max_attempts {
                        return Err(StoreError::RetriesExhausted {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    warn!(
                        op = op_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> object_store::Error {
        object_store::Error::Generic {
            store: "test",
            source: "503 slow down".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);

        let out = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);

        let err = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let err = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(object_store::Error::NotFound {
                        path: "gone".to_string(),
                        source: "404".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
