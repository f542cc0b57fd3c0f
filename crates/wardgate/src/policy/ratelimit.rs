//! Fixed-window rate limiting (spec 4.3).
//!
//! Each distinct key gets its own window/count pair. `allow(key, now)`
//! resets the window once `now - start >= window`, then admits the
//! request if `count < max`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct Window {
    start: DateTime<Utc>,
    count: u64,
}

/// A single rule's rate limit configuration: `max` requests per `window`.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub max: u64,
    pub window: Duration,
}

/// Per-key registry of sliding windows for one rule. Bounded in practice
/// by periodic `prune`, per spec 9 ("Rate-limit memory ... bounded LRU
/// eviction or periodic prune of windows whose start is older than
/// `2 x window`").
#[derive(Debug)]
pub struct RateLimiter {
    quota: Quota,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(quota: Quota) -> Self {
        Self {
            quota,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the request identified by `key` is allowed at `now`,
    /// incrementing the window's count as a side effect.
    pub fn allow(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert(Window {
            start: now,
            count: 0,
        });

        let elapsed = (now - window.start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed >= self.quota.window {
            window.start = now;
            window.count = 0;
        }

        if window.count < self.quota.max {
            window.count += 1;
            true
        } else {
            false
        }
    }

    /// Drops windows that started more than `2 * quota.window` ago, so
    /// long-lived keyspaces (e.g. per-IP) don't grow unbounded.
    pub fn prune(&self, now: DateTime<Utc>) {
        let ceiling = chrono::Duration::from_std(self.quota.window * 2).unwrap_or_default();
        self.windows
            .lock()
            .retain(|_, w| now - w.start < ceiling);
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
