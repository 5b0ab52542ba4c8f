//! Token-bucket rate limiting, one bucket per API key (or the nil UUID for
//! unauthenticated traffic).

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64,
    buckets: Mutex<HashMap<Uuid, Bucket>>,
}

impl RateLimiter {
    /// `max_tokens` is the burst size, `refill_rate` tokens added per second.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self { max_tokens, refill_rate, buckets: Mutex::new(HashMap::new()) }
    }

    /// Tries to consume one token for `key`. Returns `false` if exhausted.
    pub async fn check(&self, key: Uuid) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();

        let bucket = buckets.entry(key).or_insert(Bucket { tokens: self.max_tokens, last_refill: now });
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn cleanup(&self, max_idle: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
    }
}
