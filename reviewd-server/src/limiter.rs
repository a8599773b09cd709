//! Token-bucket rate limiter for upstream review calls.
//!
//! The bucket refills continuously. `acquire` suspends the caller until
//! a token is available or the configured wait elapses, whichever
//! comes first. Uses `tokio::time` so tests can run under paused time.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use crate::error::ReviewError;

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// Upper bound on a single wait slice; acquire loops, so this only
/// bounds how long we sleep between checks when refill is very slow.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available, otherwise report how long until
    /// the next token materializes.
    fn try_take(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().expect("bucket mutex poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        inner.last_refill = now;

        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_per_sec <= 0.0 {
            return Err(MAX_SLEEP);
        }
        let deficit = 1.0 - inner.tokens;
        let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
        Err(wait.min(MAX_SLEEP))
    }

    /// Acquire one token, suspending until one is available.
    ///
    /// Fails with `ReviewError::RateLimitTimeout` if no token became
    /// available within `max_wait`.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), ReviewError> {
        timeout(max_wait, async {
            loop {
                match self.try_take() {
                    Ok(()) => return,
                    Err(wait) => sleep(wait).await,
                }
            }
        })
        .await
        .map_err(|_| ReviewError::RateLimitTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_acquires_immediately() {
        let bucket = TokenBucket::new(2.0, 1.0);
        let start = Instant::now();
        bucket.acquire(Duration::from_secs(10)).await.unwrap();
        bucket.acquire(Duration::from_secs(10)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_token_per_second_spacing() {
        // Capacity 1, one token per second: the second and third
        // acquisitions must each wait about a second.
        let bucket = TokenBucket::new(1.0, 1.0);
        let start = Instant::now();

        bucket.acquire(Duration::from_secs(30)).await.unwrap();
        bucket.acquire(Duration::from_secs(30)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));

        bucket.acquire(Duration::from_secs(30)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let bucket = TokenBucket::new(1.0, 0.1);
        bucket.acquire(Duration::from_secs(1)).await.unwrap();

        // Next token is 10 seconds out; a 1 second wait must fail.
        let err = bucket.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ReviewError::RateLimitTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_refill_never_grants_beyond_capacity() {
        let bucket = TokenBucket::new(1.0, 0.0);
        bucket.acquire(Duration::from_secs(1)).await.unwrap();
        let err = bucket.acquire(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ReviewError::RateLimitTimeout));
    }
}
