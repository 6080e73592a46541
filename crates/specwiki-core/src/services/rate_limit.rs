//! Token-bucket rate limiting toward upstream model services.
//!
//! One bucket per service, instantiated once per process and injected
//! explicitly; stages acquire a token before every remote call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// A token bucket with configurable rate and burst.
pub struct TokenBucket {
    /// Tokens added per second
    rate: f64,
    /// Maximum tokens the bucket holds
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        assert!(rate > 0.0, "rate must be positive");
        assert!(burst >= 1.0, "burst must hold at least one token");
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (for tests and metrics)
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        state.tokens
    }
}

/// The process-wide buckets, one per upstream service.
#[derive(Clone)]
pub struct RateLimiters {
    pub chat: Arc<TokenBucket>,
    pub vlm: Arc<TokenBucket>,
    pub embedding: Arc<TokenBucket>,
    pub partition: Arc<TokenBucket>,
}

impl RateLimiters {
    pub fn new(
        chat: TokenBucket,
        vlm: TokenBucket,
        embedding: TokenBucket,
        partition: TokenBucket,
    ) -> Self {
        Self {
            chat: Arc::new(chat),
            vlm: Arc::new(vlm),
            embedding: Arc::new(embedding),
            partition: Arc::new(partition),
        }
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(
            TokenBucket::new(2.0, 4.0),
            TokenBucket::new(2.0, 4.0),
            TokenBucket::new(5.0, 10.0),
            TokenBucket::new(1.0, 2.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_tokens_are_immediately_available() {
        let bucket = TokenBucket::new(1.0, 3.0);
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn empty_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(20.0, 1.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // 1 token at 20/s refills in ~50ms
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn refill_is_capped_at_burst() {
        let bucket = TokenBucket::new(1000.0, 2.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bucket.available().await <= 2.0);
    }
}
