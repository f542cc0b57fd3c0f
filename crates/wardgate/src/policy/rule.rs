//! Declarative policy rules (spec 3, 4.1).

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::glob::glob_match;
use super::ratelimit::Quota;

/// The action a matching rule prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Deny,
    Ask,
    Queue,
}

/// Weekday set for a rule's time window, Monday-first to match
/// `chrono::Weekday`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<chrono::Weekday> for Weekday {
    fn from(w: chrono::Weekday) -> Self {
        match w {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// One `HH:MM-HH:MM` interval, stored as minute-of-day bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockInterval {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl ClockInterval {
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| RuleError::BadTimeRange(s.to_string()))?;
        Ok(Self {
            start_minute: parse_hhmm(start)?,
            end_minute: parse_hhmm(end)?,
        })
    }

    pub fn contains(&self, minute_of_day: u32) -> bool {
        if self.start_minute <= self.end_minute {
            (self.start_minute..=self.end_minute).contains(&minute_of_day)
        } else {
            // Wraps past midnight.
            minute_of_day >= self.start_minute || minute_of_day <= self.end_minute
        }
    }
}

fn parse_hhmm(s: &str) -> Result<u32, RuleError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| RuleError::BadTimeRange(s.to_string()))?;
    let h: u32 = h.parse().map_err(|_| RuleError::BadTimeRange(s.to_string()))?;
    let m: u32 = m.parse().map_err(|_| RuleError::BadTimeRange(s.to_string()))?;
    if h > 23 || m > 59 {
        return Err(RuleError::BadTimeRange(s.to_string()));
    }
    Ok(h * 60 + m)
}

/// A rule's optional time window: an allowed weekday set and/or a set of
/// allowed clock-hour intervals. If the window excludes "now" the rule is
/// skipped (not rejected) during evaluation.
#[derive(Debug, Clone, Default)]
pub struct TimeRange {
    pub weekdays: Option<Vec<Weekday>>,
    pub intervals: Vec<ClockInterval>,
}

impl TimeRange {
    pub fn allows(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        if let Some(allowed) = &self.weekdays {
            let today: Weekday = now.weekday().into();
            if !allowed.contains(&today) {
                return false;
            }
        }
        if self.intervals.is_empty() {
            return true;
        }
        let minute_of_day = (now.time().num_seconds_from_midnight()) / 60;
        self.intervals.iter().any(|i| i.contains(minute_of_day))
    }
}

use chrono::Timelike;

/// Match fields for an HTTP-shaped request. All are optional; all present
/// fields must match.
#[derive(Debug, Clone, Default)]
pub struct HttpMatch {
    pub method: Option<String>,
    pub path_glob: Option<String>,
}

impl HttpMatch {
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if let Some(m) = &self.method {
            if m != "*" && !m.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(glob) = &self.path_glob {
            if !glob_match(glob, path) {
                return false;
            }
        }
        true
    }
}

/// Match fields for an exec-shaped request (conclave command). All are
/// optional; all present fields must match.
#[derive(Debug, Clone, Default)]
pub struct ExecMatch {
    pub command_glob: Option<String>,
    pub args_regex: Option<Regex>,
    pub cwd_glob: Option<String>,
}

impl ExecMatch {
    pub fn matches(&self, command: &str, args: &str, cwd: &str) -> bool {
        if let Some(glob) = &self.command_glob {
            if !glob_match(glob, command) {
                return false;
            }
        }
        if let Some(re) = &self.args_regex {
            if re.find(args).is_none() {
                return false;
            }
        }
        if let Some(glob) = &self.cwd_glob {
            if !glob_match(glob, cwd) {
                return false;
            }
        }
        true
    }
}

/// A single immutable policy rule (spec 3: "Rule").
#[derive(Debug, Clone)]
pub struct Rule {
    pub http: HttpMatch,
    pub exec: ExecMatch,
    pub action: Action,
    pub message: Option<String>,
    pub rate_limit: Option<Quota>,
    pub time_range: Option<TimeRange>,
}

impl Rule {
    pub fn allow(http: HttpMatch) -> Self {
        Self {
            http,
            exec: ExecMatch::default(),
            action: Action::Allow,
            message: None,
            rate_limit: None,
            time_range: None,
        }
    }
}

/// The outcome of evaluating a request against a rule list. A superset of
/// `Action`: `RateLimited` is synthesized by the engine, never declared
/// directly on a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Allow,
    Deny,
    Ask,
    Queue,
    RateLimited,
}

impl From<Action> for DecisionAction {
    fn from(a: Action) -> Self {
        match a {
            Action::Allow => DecisionAction::Allow,
            Action::Deny => DecisionAction::Deny,
            Action::Ask => DecisionAction::Ask,
            Action::Queue => DecisionAction::Queue,
        }
    }
}

/// A decision returned by the policy engine (spec 4.1: "Decision carries
/// an action tag and an optional message").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: DecisionAction,
    pub message: Option<String>,
    /// Populated only for `RateLimited` decisions, so the HTTP layer can
    /// set `Retry-After` (spec 7) without re-deriving the rule's window.
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            action: DecisionAction::Allow,
            message: None,
            retry_after_secs: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Deny,
            message: Some(message.into()),
            retry_after_secs: None,
        }
    }

    pub fn ask(message: Option<String>) -> Self {
        Self {
            action: DecisionAction::Ask,
            message,
            retry_after_secs: None,
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            action: DecisionAction::RateLimited,
            message: Some("rate limited".to_string()),
            retry_after_secs: Some(retry_after_secs),
        }
    }

    pub fn from_rule_action(action: Action, message: Option<String>) -> Self {
        Self {
            action: action.into(),
            message,
            retry_after_secs: None,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.action == DecisionAction::Allow
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid time range {0:?}, expected HH:MM-HH:MM")]
    BadTimeRange(String),
    #[error("invalid args regex: {0}")]
    BadRegex(#[from] regex::Error),
}
