//! Bounded retry shared by the upload and download paths / 有限次数重试

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{TransferError, TransferResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Delay doubles after every failed attempt / 每次失败后间隔翻倍
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Backoff::Fixed)
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Cancellation is checked before
    /// every attempt and during the sleep between attempts; once the token
    /// fires, `TransferError::Cancelled` is returned instead of the last
    /// transient error.
    /// 取消信号优先于重试逻辑
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> TransferResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = TransferResult<T>>,
    {
        let mut delay = self.delay;
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if !err.is_retryable() || attempt >= self.attempts {
                return Err(err);
            }

            tracing::warn!(
                "attempt {}/{} failed, retrying in {:?}: {}",
                attempt,
                self.attempts,
                delay,
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            if self.backoff == Backoff::Exponential {
                delay = delay.saturating_mul(2);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Backoff::Exponential)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TransferError::Transient("reset".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: TransferResult<()> = fast(2)
            .run(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(TransferError::Transient(format!("try {}", attempt))) }
            })
            .await;
        match result {
            Err(TransferError::Transient(msg)) => assert_eq!(msg, "try 2"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: TransferResult<()> = fast(5)
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransferError::protocol("unexpected", "<html>")) }
            })
            .await;
        assert!(matches!(result, Err(TransferError::Protocol { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: TransferResult<()> = fast(3)
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_replaces_transient_error() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(10, Duration::from_secs(30), Backoff::Fixed);
        let token = cancel.clone();
        let counter = calls.clone();
        let result: TransferResult<()> = policy
            .run(&cancel, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                // Fires while the op is running / 执行过程中触发取消
                token.cancel();
                async { Err(TransferError::Transient("timeout".into())) }
            })
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(10, Duration::from_secs(30), Backoff::Fixed);
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let result: TransferResult<()> = policy
            .run(&cancel, |_| async { Err(TransferError::Transient("x".into())) })
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
