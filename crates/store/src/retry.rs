//! Bounded exponential backoff for `Busy` storage errors.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// First wait after a busy error.
const INITIAL_DELAY: Duration = Duration::from_millis(5);
/// Per-wait cap.
const MAX_DELAY: Duration = Duration::from_millis(200);
/// Cumulative budget; once exhausted the `Busy` error surfaces.
const RETRY_BUDGET: Duration = Duration::from_secs(30);

/// Backoff state for one contended operation.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    started: Instant,
    attempts: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            next: INITIAL_DELAY,
            started: Instant::now(),
            attempts: 0,
        }
    }

    /// Whether the cumulative budget allows another attempt.
    pub fn can_retry(&self) -> bool {
        self.started.elapsed() < RETRY_BUDGET
    }

    /// Sleep for the current delay and double it (capped).
    pub async fn wait(&mut self) {
        self.attempts += 1;
        tokio::time::sleep(self.next).await;
        self.next = (self.next * 2).min(MAX_DELAY);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` until it succeeds, fails with a non-`Busy` error, or the retry
/// budget runs out.
pub async fn with_busy_retry<T, F, Fut>(operation: &str, mut f: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut backoff = Backoff::new();
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(StorageError::Busy(msg)) if backoff.can_retry() => {
                debug!(operation, attempts = backoff.attempts(), "busy, backing off");
                backoff.wait().await;
                let _ = msg;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_busy_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(StorageError::Busy("locked".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_busy_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = with_busy_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Schema("no such table".into())) }
        })
        .await;
        assert!(matches!(result, Err(StorageError::Schema(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new();
        assert_eq!(b.next, INITIAL_DELAY);
        b.next = (b.next * 2).min(MAX_DELAY);
        assert_eq!(b.next, Duration::from_millis(10));
        b.next = MAX_DELAY * 4;
        b.next = (b.next * 2).min(MAX_DELAY);
        assert_eq!(b.next, MAX_DELAY);
    }
}
