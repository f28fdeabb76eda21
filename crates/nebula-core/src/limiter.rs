//! Per-connection, per-event token bucket rate limiting.
//!
//! Each connection owns one [`RateLimiter`]. Buckets are created lazily on
//! the first event of a given name and start full, so a fresh connection
//! gets its whole burst immediately. Once a connection has
//! [`MAX_BUCKETS`] named buckets, every further name shares one overflow
//! bucket. The limiter never leaves the task that owns the connection, so
//! it needs no locking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;

/// Default refill rate in tokens per second.
pub const DEFAULT_REFILL_PER_SEC: f64 = 10.0;

/// Default burst capacity.
pub const DEFAULT_BURST: u32 = 20;

/// Named buckets per connection before names share the overflow bucket.
pub const MAX_BUCKETS: usize = 64;

/// Rate limiter parameters shared by every bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Maximum number of tokens a bucket can hold.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_refill_per_sec() -> f64 {
    DEFAULT_REFILL_PER_SEC
}

fn default_burst() -> u32 {
    DEFAULT_BURST
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
            burst: DEFAULT_BURST,
        }
    }
}

/// A single token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.burst),
            last_refill: now,
        }
    }

    /// Refill based on the time elapsed since the last refill.
    ///
    /// A `now` earlier than the last refill counts as zero elapsed time.
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(f64::from(config.burst));
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Refill, then take one token if available.
    pub fn try_acquire(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        self.refill(config, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token count, without refilling.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Token buckets for one connection, keyed by event name.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: HashMap<String, TokenBucket>,
    overflow: Option<TokenBucket>,
}

impl RateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            overflow: None,
        }
    }

    /// Decide whether one more `event` may pass now.
    pub fn allow(&mut self, event: &str) -> bool {
        self.allow_at(event, Instant::now())
    }

    /// Decide whether one more `event` may pass at `now`.
    pub fn allow_at(&mut self, event: &str, now: Instant) -> bool {
        let config = &self.config;
        if let Some(bucket) = self.buckets.get_mut(event) {
            return bucket.try_acquire(config, now);
        }

        if self.buckets.len() >= MAX_BUCKETS {
            return self
                .overflow
                .get_or_insert_with(|| TokenBucket::full(config, now))
                .try_acquire(config, now);
        }

        let mut bucket = TokenBucket::full(config, now);
        let allowed = bucket.try_acquire(config, now);
        self.buckets.insert(event.to_string(), bucket);
        allowed
    }

    /// Tokens left in the bucket for `event`, if it exists.
    #[must_use]
    pub fn tokens(&self, event: &str) -> Option<f64> {
        self.buckets.get(event).map(TokenBucket::tokens)
    }

    /// Number of named buckets allocated so far.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_deny() {
        let mut limiter = RateLimiter::new(RateLimitConfig::default());
        let now = Instant::now();

        let allowed = (0..25).filter(|_| limiter.allow_at("emit", now)).count();
        assert_eq!(allowed, 20);
    }

    #[test]
    fn test_refill_after_one_second() {
        let mut limiter = RateLimiter::new(RateLimitConfig::default());
        let start = Instant::now();

        for _ in 0..25 {
            limiter.allow_at("emit", start);
        }
        assert!(!limiter.allow_at("emit", start));

        let later = start + Duration::from_secs(1);
        assert!(limiter.allow_at("emit", later));
        let left = limiter.tokens("emit").unwrap();
        assert!((left - 9.0).abs() < 1e-9, "left = {left}");
    }

    #[test]
    fn test_cap_holds_after_long_idle() {
        let config = RateLimitConfig {
            refill_per_sec: 10.0,
            burst: 20,
        };
        let mut limiter = RateLimiter::new(config);
        let start = Instant::now();

        limiter.allow_at("emit", start);
        limiter.allow_at("emit", start + Duration::from_secs(3600));
        assert!(limiter.tokens("emit").unwrap() <= 19.0);

        let allowed = (0..100)
            .filter(|_| limiter.allow_at("emit", start + Duration::from_secs(7200)))
            .count();
        assert_eq!(allowed, 20);
    }

    #[test]
    fn test_buckets_are_per_event() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            refill_per_sec: 1.0,
            burst: 1,
        });
        let now = Instant::now();

        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_rotating_names_share_overflow_bucket() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            refill_per_sec: 1.0,
            burst: 1,
        });
        let now = Instant::now();

        let allowed = (0..1_000)
            .filter(|i| limiter.allow_at(&format!("event-{i}"), now))
            .count();
        assert_eq!(allowed, MAX_BUCKETS + 1);
        assert_eq!(limiter.bucket_count(), MAX_BUCKETS);

        // Names seen before the cap keep their own bucket.
        assert!(limiter.tokens("event-0").is_some());
        assert!(limiter.tokens("event-999").is_none());
    }

    #[test]
    fn test_backwards_clock_adds_nothing() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            refill_per_sec: 10.0,
            burst: 2,
        });
        let later = Instant::now() + Duration::from_secs(10);
        let earlier = later - Duration::from_secs(5);

        assert!(limiter.allow_at("e", later));
        assert!(limiter.allow_at("e", later));
        assert!(!limiter.allow_at("e", earlier));
        assert_eq!(limiter.tokens("e"), Some(0.0));
    }

    #[test]
    fn test_fractional_accrual_is_kept() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            refill_per_sec: 10.0,
            burst: 1,
        });
        let start = Instant::now();

        assert!(limiter.allow_at("e", start));
        // 50ms = half a token; denied, but the half token stays.
        assert!(!limiter.allow_at("e", start + Duration::from_millis(50)));
        assert!(limiter.allow_at("e", start + Duration::from_millis(100)));
    }
}
