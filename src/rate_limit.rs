//! Fixed-window request counters keyed by caller.
//!
//! The first hit for a key opens a window ending at `reset_at`; later hits in
//! that window increment the counter and are blocked once it exceeds the
//! rule's maximum. The first hit after `reset_at` opens a fresh window.
//! State is per process and lost on restart.

use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time left until the current window resets.
    pub reset_in: Duration,
}

impl RateDecision {
    /// `reset_in` rounded up to whole seconds, as sent in headers.
    pub fn reset_secs(&self) -> u64 {
        self.reset_in.as_millis().div_ceil(1000) as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    counters: DashMap<String, Counter>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, rule: RateRule) -> RateDecision {
        self.check_at(key, rule, Instant::now())
    }

    fn check_at(&self, key: &str, rule: RateRule, now: Instant) -> RateDecision {
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            reset_at: now + rule.window,
        });
        if counter.reset_at <= now {
            counter.count = 0;
            counter.reset_at = now + rule.window;
        }
        counter.count = counter.count.saturating_add(1);

        RateDecision {
            allowed: counter.count <= rule.max_requests,
            limit: rule.max_requests,
            remaining: rule.max_requests.saturating_sub(counter.count),
            reset_in: counter.reset_at.saturating_duration_since(now),
        }
    }

    /// Drop counters whose window has ended.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.reset_at > now);
        before.saturating_sub(self.counters.len())
    }

    pub fn reset(&self, key: &str) {
        self.counters.remove(key);
    }

    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}
