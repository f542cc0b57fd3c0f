//! The policy engine (spec 4.1), glob matcher (4.2), and rate limiter (4.3).

pub mod engine;
pub mod glob;
pub mod ratelimit;
pub mod rule;

pub use engine::Engine;
pub use glob::glob_match;
pub use ratelimit::{Quota, RateLimiter};
pub use rule::{
    Action, ClockInterval, Decision, DecisionAction, ExecMatch, HttpMatch, Rule, RuleError,
    TimeRange, Weekday,
};
