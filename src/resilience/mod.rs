//! # Infrastructure Retry
//!
//! Bounded retry for transient infrastructure failures (store, queue,
//! registry momentarily unreachable). This ceiling is independent of any
//! task's attempt budget: absorbing infra transience never charges a task,
//! and exhausting it surfaces the underlying error to the caller instead
//! of failing the task.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Run `operation`, retrying retryable errors with doubling delay.
    /// Non-retryable errors (Conflict, Validation, NotFound) return
    /// immediately untouched.
    pub async fn run<T, F, Fut>(&self, component: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        component,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DispatchError::transient("test", "flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflict_is_never_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let err = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DispatchError::conflict(uuid::Uuid::nil(), "lost race")) }
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let err = policy
            .run("test", || async {
                Err::<(), _>(DispatchError::transient("test", "still down"))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
