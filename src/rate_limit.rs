use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};

/// Requests per second and burst capacity for one push-service origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_rps: u32,
    pub burst: u32,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
    pub last_refill_age_ms: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        let cap = capacity.max(1) as f64;
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec: refill_per_sec.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    pub fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    pub fn snapshot(&self) -> RateLimiterStats {
        let age = Instant::now().duration_since(self.last_refill).as_millis() as u64;
        RateLimiterStats {
            capacity: self.capacity,
            tokens: self.tokens,
            refill_per_sec: self.refill_per_sec,
            last_refill_age_ms: age,
        }
    }
}

/// Proof that a send was admitted. Dropping it returns nothing to the
/// bucket; tokens come back only through refill.
#[derive(Debug)]
pub struct Permit {
    _private: (),
}

/// Per-origin admission control.
///
/// Buckets are created on first use from the origin's configured limit,
/// falling back to the default limit. Origins without either are unthrottled.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    limits: HashMap<String, RateLimit>,
    default_limit: Option<RateLimit>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, RateLimit>, default_limit: Option<RateLimit>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            limits,
            default_limit,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(HashMap::new(), None)
    }

    /// Wait until `origin` has capacity. Sleeps between checks; never spins.
    pub async fn acquire(&self, origin: &str) -> Permit {
        let Some(bucket) = self.bucket_for(origin).await else {
            return Permit { _private: () };
        };

        loop {
            let wait = {
                let mut bucket = bucket.lock().await;
                match bucket.try_take() {
                    Ok(()) => return Permit { _private: () },
                    Err(wait) => wait,
                }
            };
            tracing::trace!(origin, wait_ms = wait.as_millis() as u64, "rate limited");
            #[cfg(feature = "metrics")]
            metrics::counter!("push.rate_limited").increment(1);
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    async fn bucket_for(&self, origin: &str) -> Option<Arc<Mutex<TokenBucket>>> {
        if let Some(bucket) = self.buckets.read().await.get(origin) {
            return Some(bucket.clone());
        }

        let limit = self.limits.get(origin).copied().or(self.default_limit)?;
        let mut guard = self.buckets.write().await;
        let bucket = guard
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(limit.burst, limit.max_rps))));
        Some(bucket.clone())
    }

    pub async fn stats(&self) -> HashMap<String, RateLimiterStats> {
        let guard = self.buckets.read().await;
        let mut stats = HashMap::new();
        for (origin, bucket) in guard.iter() {
            let bucket = bucket.lock().await;
            stats.insert(origin.clone(), bucket.snapshot());
        }
        stats
    }
}

/// Push-service origin of an endpoint URL (`scheme://host[:port]`).
pub fn origin_of(endpoint: &str) -> Option<String> {
    let url = url::Url::parse(endpoint).ok()?;
    url.host_str()?;
    Some(url.origin().ascii_serialization())
}
