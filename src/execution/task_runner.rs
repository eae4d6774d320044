//! Bounded task runner with retry and cooperative cancellation

use crate::error::RuntimeError;
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a single backoff delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TaskRunner {
    permits: Arc<Semaphore>,
    retry_base_delay: Duration,
}

impl TaskRunner {
    pub fn new(max_concurrent: usize, retry_base_delay: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry_base_delay,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.retry_base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let multiplier = 1u128 << retries_used.min(20);
        let millis = base_ms
            .saturating_mul(multiplier)
            .min(MAX_RETRY_DELAY.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Run `task` under a concurrency permit, retrying up to `retry` times.
    ///
    /// Cancellation is checked before each attempt and while waiting between
    /// attempts; a running attempt is never interrupted.
    pub async fn run<T, F, Fut>(
        &self,
        task_name: &str,
        retry: u32,
        cancellation: &CancellationToken,
        mut task: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RuntimeError::Aborted)?;

        let mut retries_used = 0;
        loop {
            if cancellation.is_cancelled() {
                debug!(task = task_name, "Task cancelled before attempt");
                return Err(RuntimeError::Aborted);
            }

            let error = match task(retries_used).await {
                Ok(value) => return Ok(value),
                Err(RuntimeError::Aborted) => return Err(RuntimeError::Aborted),
                Err(e) => e,
            };

            if retries_used >= retry {
                return Err(error);
            }

            let delay = self.backoff(retries_used);
            retries_used += 1;
            warn!(
                task = task_name,
                error = %error,
                retry_attempt = retries_used,
                retry_in_ms = delay.as_millis() as u64,
                "Retrying task after failure"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancellation.cancelled() => return Err(RuntimeError::Aborted),
            }
        }
    }
}
