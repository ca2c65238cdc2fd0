//! Per-venue rate limiting: a token bucket per venue (`calls_per_second`,
//! `burst_size`) rather than a fixed-window counter, so bursts up to
//! capacity are allowed while the steady-state rate stays bounded. Tokens
//! refill continuously at `calls_per_second` up to `burst_size`, so a venue
//! that's been idle can burst briefly instead of being capped at a hard
//! per-window count.

use std::time::{Duration, Instant};

/// One bucket per venue. `acquire` is synchronous and non-blocking: callers
/// that need to wait call `acquire_wait` instead, which sleeps until a token
/// is available.
pub struct TokenBucket {
    capacity: f64,
    calls_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(calls_per_second: f64, burst_size: u32) -> Self {
        let capacity = burst_size.max(1) as f64;
        Self { capacity, calls_per_second: calls_per_second.max(0.0), tokens: capacity, last_refill: Instant::now() }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.calls_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempts to take one token. Returns `true` and debits the bucket on
    /// success; returns `false` (bucket left untouched) if none is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Duration the caller would need to wait for a token to become
    /// available, `None` if one is available right now.
    pub fn time_until_available(&mut self) -> Option<Duration> {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            None
        } else if self.calls_per_second <= 0.0 {
            Some(Duration::from_secs(u64::MAX / 2))
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.calls_per_second))
        }
    }

    /// Blocks (via `tokio::time::sleep`) until a token is available, then
    /// takes it. Used at the connector-call suspension point.
    pub async fn acquire_wait(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            if let Some(wait) = self.time_until_available() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// One `TokenBucket` per venue name, created lazily from config on first use.
pub struct RateLimiterRegistry {
    calls_per_second: f64,
    burst_size: u32,
    buckets: std::collections::HashMap<String, TokenBucket>,
}

impl RateLimiterRegistry {
    pub fn new(calls_per_second: f64, burst_size: u32) -> Self {
        Self { calls_per_second, burst_size, buckets: std::collections::HashMap::new() }
    }

    pub fn bucket(&mut self, venue: &str) -> &mut TokenBucket {
        self.buckets
            .entry(venue.to_string())
            .or_insert_with(|| TokenBucket::new(self.calls_per_second, self.burst_size))
    }

    pub async fn acquire(&mut self, venue: &str) {
        self.bucket(venue).acquire_wait().await;
    }
}
