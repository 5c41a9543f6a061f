//! Sliding-window rate limiter for join attempts and chat posts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    window: Duration,
    /// Per-key tracking: key → attempt timestamps.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt for `key` if it is allowed.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;

        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Whether an attempt would be allowed, without recording it.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(attempts) => {
                let active = attempts
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count();
                (active as u32) < self.max_attempts
            }
            None => true,
        }
    }

    /// Record an attempt unconditionally.
    pub fn record(&mut self, key: &str) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .push(Instant::now());
    }

    /// Drop expired entries to bound memory.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;

        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Join attempts per client IP.
#[derive(Debug)]
pub struct JoinRateLimit {
    inner: RateLimiter,
}

impl Default for JoinRateLimit {
    /// 5 attempts per minute per IP.
    fn default() -> Self {
        Self {
            inner: RateLimiter::new(5, Duration::from_secs(60)),
        }
    }
}

impl JoinRateLimit {
    pub fn check(&mut self, ip: &IpAddr) -> bool {
        self.inner.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.inner.gc();
    }

    /// Client IPs with attempts still inside the window.
    pub fn tracked_keys(&self) -> usize {
        self.inner.tracked_keys()
    }
}
