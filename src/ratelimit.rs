// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-client token bucket limiter for the signing entry points.
//!
//! Buckets are keyed by the verified client identity and live in a
//! `DashMap`, so clients never contend on a shared lock. Over-budget calls
//! are rejected immediately; nothing is queued.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::clock::{SharedClock, SystemClock};

/// Identity used when the caller presented no client certificate.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Idle buckets older than this are removed by [`ClientRateLimiter::sweep`].
const DEFAULT_IDLE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub rate_per_sec: f64,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 100.0,
            burst: 100,
        }
    }
}

/// Rejection carrying the time until one token is available again.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rate limit exceeded for {client}, retry in {retry_after_ms}ms")]
pub struct RateLimited {
    pub client: String,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    refilled_at: DateTime<Utc>,
}

pub struct ClientRateLimiter {
    buckets: DashMap<String, TokenBucket>,
    config: RateLimitConfig,
    clock: SharedClock,
    idle_ttl: Duration,
}

impl ClientRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            clock: Arc::new(SystemClock),
            idle_ttl: Duration::seconds(DEFAULT_IDLE_TTL_SECS),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Take one token for `client`, or reject.
    pub fn check(&self, client: &str) -> Result<(), RateLimited> {
        let client = if client.trim().is_empty() {
            UNKNOWN_CLIENT
        } else {
            client
        };
        let now = self.clock.now();
        let capacity = f64::from(self.config.burst.max(1));

        let mut bucket = self
            .buckets
            .entry(client.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                refilled_at: now,
            });

        let elapsed = (now - bucket.refilled_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate_per_sec).min(capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        let retry_after_ms = if self.config.rate_per_sec > 0.0 {
            (missing / self.config.rate_per_sec * 1000.0).ceil() as u64
        } else {
            u64::MAX
        };
        Err(RateLimited {
            client: client.to_string(),
            retry_after_ms,
        })
    }

    /// Drop buckets that have been idle long enough to be full again.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - self.idle_ttl;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.refilled_at > cutoff);
        before - self.buckets.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
