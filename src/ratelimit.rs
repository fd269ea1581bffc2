//! Process-wide token buckets for external API rate limiting.
//!
//! One bucket per upstream endpoint, created at startup and shared by every
//! worker. Callers `acquire().await` before each request; the call sleeps
//! until a token is available, so a bucket with rate 1.0 serializes callers
//! to one request per second regardless of fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A refilling token bucket. Clone shares the underlying bucket.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<BucketState>>,
    rate_per_sec: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `rate_per_sec` tokens accrue per second, up to `burst` stored tokens.
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            })),
            rate_per_sec,
            burst,
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Seconds until the next whole token accrues.
                (1.0 - state.tokens) / self.rate_per_sec
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Non-blocking variant used by tests.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.inner.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_empty() {
        let bucket = TokenBucket::new(1000.0, 2.0);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(100.0, 1.0);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn acquire_blocks_until_token() {
        let bucket = TokenBucket::new(50.0, 1.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // Refill rate is 50/s, so the second acquire waits roughly 20ms.
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
