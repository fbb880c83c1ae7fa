//! Bounded retry with exponential backoff for cross-node broadcasts.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::backoff::Backoff;
use crate::error::ConexusError;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Shutdown grace period: `shutdown()` waits this long for in-flight retries
/// to drain before returning, having already signalled every sleeping retry
/// to abandon with `Cancelled`.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RetryManager {
    max_attempts: usize,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    outstanding: Arc<AtomicUsize>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("max_attempts", &self.max_attempts)
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}

impl RetryManager {
    pub fn new(max_attempts: usize, base_delay: Duration, backoff_multiplier: f64, max_delay: Duration) -> Self {
        let backoff = Backoff::exponential(base_delay, backoff_multiplier).with_max(max_delay);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            sleeper: Arc::new(TokioSleeper),
            outstanding: Arc::new(AtomicUsize::new(0)),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Number of `execute_with_retry` calls currently in progress.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run `operation`, retrying on error up to `max_attempts` times with
    /// exponential backoff between attempts. `name` is used only for logging.
    pub async fn execute_with_retry<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, ConexusError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ConexusError>> + Send,
        T: Send,
    {
        if self.is_shutdown() {
            return Err(ConexusError::Cancelled);
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let result = self.run(name, &mut operation).await;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn run<T, F, Fut>(&self, name: &str, operation: &mut F) -> Result<T, ConexusError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ConexusError>> + Send,
        T: Send,
    {
        let mut rx = self.shutdown_rx.clone();
        let mut last_err = ConexusError::Cancelled;

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::debug!(name, attempt, max = self.max_attempts, error = %err, "retry manager: attempt failed");
                    last_err = err;

                    if attempt >= self.max_attempts {
                        tracing::warn!(name, attempts = self.max_attempts, "retry manager: attempts exhausted");
                        return Err(last_err);
                    }

                    let delay = self.backoff.delay(attempt);
                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                tracing::info!(name, attempt, "retry manager: abandoned on shutdown");
                                return Err(ConexusError::Cancelled);
                            }
                        }
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Signal all in-flight retries to abandon, then wait up to
    /// [`SHUTDOWN_GRACE_PERIOD`] for them to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE_PERIOD;
        while self.outstanding() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let remaining = self.outstanding();
        if remaining > 0 {
            tracing::warn!(remaining, "retry manager: shutdown grace period elapsed with retries still outstanding");
        } else {
            tracing::info!("retry manager: shut down cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retrying() {
        let manager =
            RetryManager::new(3, Duration::from_millis(10), 2.0, Duration::from_secs(1)).with_sleeper(InstantSleeper);
        let calls = Arc::new(StdAtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = manager
            .execute_with_retry("test", || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ConexusError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let manager =
            RetryManager::new(5, Duration::from_millis(10), 2.0, Duration::from_secs(1)).with_sleeper(InstantSleeper);
        let calls = Arc::new(StdAtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = manager
            .execute_with_retry("test", || {
                let calls = calls_clone.clone();
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(ConexusError::TransportUnavailable("down".into()))
                    } else {
                        Ok(99)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let manager =
            RetryManager::new(3, Duration::from_millis(10), 2.0, Duration::from_secs(1)).with_sleeper(InstantSleeper);
        let calls = Arc::new(StdAtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), ConexusError> = manager
            .execute_with_retry("test", || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ConexusError::TransportUnavailable("still down".into()))
                }
            })
            .await;

        assert!(result.unwrap_err().is_transport_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_drains_with_no_outstanding_work_immediately() {
        let manager = RetryManager::new(3, Duration::from_millis(10), 2.0, Duration::from_secs(1));
        manager.shutdown().await;
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn new_calls_after_shutdown_are_cancelled() {
        let manager = RetryManager::new(3, Duration::from_millis(10), 2.0, Duration::from_secs(1));
        manager.shutdown().await;

        let result: Result<(), ConexusError> =
            manager.execute_with_retry("test", || async { Ok(()) }).await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_abandons_a_sleeping_retry_with_cancelled() {
        let manager = RetryManager::new(5, Duration::from_secs(30), 2.0, Duration::from_secs(60));
        let manager_clone = manager.clone();

        let handle = tokio::spawn(async move {
            manager_clone
                .execute_with_retry("test", || async {
                    Err::<(), _>(ConexusError::TransportUnavailable("down".into()))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await;

        let result = handle.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }
}
