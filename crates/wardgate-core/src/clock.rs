use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Source of "now", injected everywhere a component would otherwise call
/// `Utc::now()` directly. Keeping this behind a trait is what lets the
/// policy engine and rate limiter be tested deterministically (spec
/// requirement: "evaluate(m,p) is deterministic given fixed clock and
/// rate state").
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that can be advanced manually. Used by tests for rate limiter
/// windows, rule time-ranges, and approval timeouts.
#[derive(Debug)]
pub struct TestClock {
    millis: AtomicI64,
}

impl TestClock {
    pub fn at(dt: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(dt.timestamp_millis()),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.millis
            .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, dt: DateTime<Utc>) {
        self.millis.store(dt.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .expect("valid timestamp")
    }
}
