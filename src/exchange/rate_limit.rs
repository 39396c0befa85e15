//! Token-bucket rate limiter for exchange order placement.
//!
//! Structurally grounded on `joaquinbejar-deribit-http/src/rate_limit.rs`'s
//! `TokenBucket`, collapsed to the single category this system needs: spec
//! §4.1/§5 call for a minimum ~100ms inter-call gap within one hedge batch
//! and a shared 10 ops/s token bucket overall, not Deribit's five
//! endpoint-class buckets.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    tokens: u32,
    refill_rate: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: u32) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u32;
        if tokens_to_add > 0 {
            self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn time_until_token(&self) -> Duration {
        if self.tokens > 0 {
            Duration::from_secs(0)
        } else {
            Duration::from_secs_f64(1.0 / self.refill_rate as f64)
        }
    }
}

/// Shared rate limiter for all exchange order-placement calls in a process.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    min_gap: Duration,
    last_call: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    /// `ops_per_sec` token bucket (default 10/s per spec §5), plus an
    /// explicit minimum inter-call gap (default 100ms per spec §4.1) that
    /// self-paces batched hedge order submission.
    pub fn new(ops_per_sec: u32, min_gap: Duration) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(ops_per_sec, ops_per_sec))),
            min_gap,
            last_call: Arc::new(Mutex::new(None)),
        }
    }

    pub fn default_for_venue() -> Self {
        Self::new(10, Duration::from_millis(100))
    }

    /// Blocks until both the min-gap pacing and the token bucket admit the
    /// next call.
    pub async fn acquire(&self) {
        {
            let mut last_call = self.last_call.lock().await;
            if let Some(prev) = *last_call {
                let elapsed = prev.elapsed();
                if elapsed < self.min_gap {
                    sleep(self.min_gap - elapsed).await;
                }
            }
            *last_call = Some(Instant::now());
        }

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_consume() {
                    return;
                }
                bucket.time_until_token()
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforces_minimum_gap() {
        let limiter = RateLimiter::new(1000, Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
