//! Rule evaluation (spec 4.1).

use std::sync::Arc;

use wardgate_core::Clock;

use super::rule::{Decision, Rule};
use super::ratelimit::RateLimiter;

/// An ordered, immutable rule list plus one rate limiter per rule that
/// declares a `rate_limit`. Constructed once per endpoint/conclave.
pub struct Engine {
    rules: Vec<Rule>,
    limiters: Vec<Option<RateLimiter>>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(rules: Vec<Rule>, clock: Arc<dyn Clock>) -> Self {
        let limiters = rules
            .iter()
            .map(|r| r.rate_limit.map(RateLimiter::new))
            .collect();
        Self {
            rules,
            limiters,
            clock,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// spec 4.1 `evaluate_http`.
    pub fn evaluate_http(&self, method: &str, path: &str, key: &str) -> Decision {
        let now = self.clock.now();
        for (idx, rule) in self.rules.iter().enumerate() {
            if !rule.http.matches(method, path) {
                continue;
            }
            if let Some(window) = &rule.time_range {
                if !window.allows(now) {
                    // Window excludes now: skip, don't reject.
                    continue;
                }
            }
            if let Some(limiter) = &self.limiters[idx] {
                if !limiter.allow(key, now) {
                    return Decision::rate_limited(rule.rate_limit.expect("limiter implies rate_limit").window.as_secs());
                }
            }
            return Decision::from_rule_action(rule.action, rule.message.clone());
        }
        Decision::deny("default deny")
    }

    /// spec 4.1 `evaluate_exec`.
    pub fn evaluate_exec(&self, command: &str, args: &str, cwd: &str, key: &str) -> Decision {
        let now = self.clock.now();
        for (idx, rule) in self.rules.iter().enumerate() {
            if !rule.exec.matches(command, args, cwd) {
                continue;
            }
            if let Some(window) = &rule.time_range {
                if !window.allows(now) {
                    continue;
                }
            }
            if let Some(limiter) = &self.limiters[idx] {
                if !limiter.allow(key, now) {
                    return Decision::rate_limited(rule.rate_limit.expect("limiter implies rate_limit").window.as_secs());
                }
            }
            return Decision::from_rule_action(rule.action, rule.message.clone());
        }
        Decision::deny("default deny")
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
