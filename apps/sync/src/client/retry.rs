//! Retry with exponential backoff, and the manual retry queue.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{is_retryable_status, ApiError, ErrorKind};

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first.
    pub retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * 2^(n-1)` before attempt `n+1`.
    pub retry_delay: Duration,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            retryable_statuses: (400..=599).filter(|s| is_retryable_status(*s)).collect(),
        }
    }
}

impl RetryOptions {
    /// Network failures (no status) are always retryable.
    pub fn is_retryable(&self, error: &ApiError) -> bool {
        match error.status {
            Some(status) => self.retryable_statuses.contains(&status),
            None => error.kind == ErrorKind::Network,
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

pub async fn with_retry<T, F, Fut>(options: &RetryOptions, op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    with_retry_notify(options, op, |_, _| {}).await
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. `on_retry(attempt, error)` fires before each backoff sleep.
///
/// The returned error's `is_retryable` reflects `options`, so callers can
/// decide whether to offer a manual retry.
pub async fn with_retry_notify<T, F, Fut, N>(
    options: &RetryOptions,
    mut op: F,
    mut on_retry: N,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
    N: FnMut(u32, &ApiError),
{
    let attempts = options.retries.max(1);
    let mut attempt = 1;

    loop {
        let mut error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        error.is_retryable = options.is_retryable(&error);
        if !error.is_retryable {
            return Err(error);
        }
        if attempt >= attempts {
            warn!("Giving up after {attempt} attempts: {error}");
            return Err(error);
        }

        let delay = options.delay_after(attempt);
        warn!(
            "Attempt {} failed ({}), retrying after {}ms...",
            attempt,
            error,
            delay.as_millis()
        );
        on_retry(attempt, &error);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Manual retry queue
// ────────────────────────────────────────────────────────────────────────────

pub type RetryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// A failed operation the user can trigger again ("try again").
#[derive(Clone)]
pub struct RetryQueueItem {
    pub id: Uuid,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: ApiError,
    retry_fn: RetryFn,
}

impl fmt::Debug for RetryQueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryQueueItem")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("error", &self.error)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded,
    Failed { attempts_left: u32 },
    GaveUp,
    UnknownItem,
}

#[derive(Clone, Default)]
pub struct RetryQueue {
    items: Arc<Mutex<Vec<RetryQueueItem>>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `retry_fn` for manual retry. Non-retryable errors are refused.
    pub fn enqueue(&self, error: ApiError, max_attempts: u32, retry_fn: RetryFn) -> Option<Uuid> {
        if !error.is_retryable {
            return None;
        }
        let id = Uuid::new_v4();
        self.lock().push(RetryQueueItem {
            id,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            error,
            retry_fn,
        });
        Some(id)
    }

    pub fn items(&self) -> Vec<RetryQueueItem> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|item| item.id != id);
        items.len() != before
    }

    pub async fn retry(&self, id: Uuid) -> RetryOutcome {
        let retry_fn = match self.lock().iter().find(|item| item.id == id) {
            Some(item) => item.retry_fn.clone(),
            None => return RetryOutcome::UnknownItem,
        };

        let result = retry_fn().await;

        let mut items = self.lock();
        let Some(index) = items.iter().position(|item| item.id == id) else {
            // Dismissed while the retry was running.
            return RetryOutcome::UnknownItem;
        };

        match result {
            Ok(()) => {
                items.remove(index);
                info!("Retry {id} succeeded");
                RetryOutcome::Succeeded
            }
            Err(error) => {
                let item = &mut items[index];
                item.attempts += 1;
                item.error = error;
                if item.attempts >= item.max_attempts {
                    warn!("Retry {id} exhausted after {} attempts", item.attempts);
                    items.remove(index);
                    RetryOutcome::GaveUp
                } else {
                    RetryOutcome::Failed {
                        attempts_left: item.max_attempts - item.attempts,
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RetryQueueItem>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
