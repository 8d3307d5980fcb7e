//! Retry, backoff and cancellable pauses

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder, FixedBackoff};
pub use error::{RetryError, Retryable};

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::from_config(self)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial_backoff exceeds max_backoff".to_string());
        }
        Ok(())
    }
}

/// Helper for retrying operations with backoff
///
/// Only errors reporting [`Retryable::is_retryable`] are attempted again. An
/// operation that has started always runs to completion; shutdown is only
/// observed while waiting between attempts.
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl RetryHandle<ExponentialBackoff> {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.clone(), config.backoff())
    }
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    pub async fn retry<F, Fut, T, E>(
        &mut self,
        mut operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display + Retryable,
    {
        let mut retries = 0;
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let error = match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(attempts = self.attempts, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
                Err(e) => e,
            };

            if retries >= self.config.max_retries {
                warn!(
                    attempts = self.attempts,
                    error = %error,
                    "Maximum retry attempts exceeded"
                );
                return Err(RetryError::MaxRetriesExceeded {
                    attempts: self.attempts,
                    last: error,
                });
            }
            retries += 1;

            let delay = self.backoff.next_delay(retries);
            warn!(
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying after delay"
            );

            if !pause(delay, shutdown).await {
                debug!("Retry interrupted by shutdown signal");
                return Err(RetryError::Interrupted);
            }
        }
    }

    /// Total attempts made by this handle
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Resolves once shutdown has been requested
///
/// A dropped sender means no shutdown can ever arrive, so the future stays pending.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `delay` unless shutdown arrives first; returns `false` on shutdown
pub async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_requested(shutdown) => false,
    }
}

/// A receiver that never signals shutdown, for one-off calls outside a worker
pub fn never_shutdown() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_throttling() -> anyhow::Result<()> {
        let mut retry = RetryHandle::from_config(&fast_config(3));
        let (_tx, mut rx) = watch::channel(false);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let start = std::time::Instant::now();
        let result = retry
            .retry(
                || {
                    let value = counter_clone.clone();
                    async move {
                        if value.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(GatewayError::Throttled("slow down".into()))
                        } else {
                            Ok("success")
                        }
                    }
                },
                &mut rx,
            )
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts(), 3);
        // 10ms then 20ms
        assert!(start.elapsed() >= Duration::from_millis(30));
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_max_attempts() {
        let mut retry = RetryHandle::from_config(&fast_config(2));
        let mut rx = never_shutdown();

        let result: Result<(), _> = retry
            .retry(
                || async { Err(GatewayError::Throttled("always".into())) },
                &mut rx,
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::MaxRetriesExceeded { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_pause_returns_immediately_once_shutdown_is_set() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let completed = tokio_test::block_on(pause(Duration::from_secs(3600), &mut rx));
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let mut retry = RetryHandle::from_config(&fast_config(5));
        let mut rx = never_shutdown();

        let result: Result<(), _> = retry
            .retry(
                || async { Err(GatewayError::NotFound("no stream".into())) },
                &mut rx,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(GatewayError::NotFound(_)))));
        assert_eq!(retry.attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_shutdown_interrupts_backoff() -> anyhow::Result<()> {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            jitter_factor: 0.0,
        };
        let mut retry = RetryHandle::from_config(&config);
        let (tx, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            retry
                .retry(
                    || async { Err::<(), _>(GatewayError::Throttled("busy".into())) },
                    &mut rx,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true)?;

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await??;
        assert!(result.unwrap_err().is_interrupted());
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_with_dropped_sender_sleeps() {
        let mut rx = never_shutdown();
        let start = std::time::Instant::now();
        assert!(pause(Duration::from_millis(20), &mut rx).await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        let bad = RetryConfig {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
