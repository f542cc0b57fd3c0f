use std::sync::Arc;

use wardgate_core::TestClock;

use super::rule::{Action, DecisionAction, ExecMatch, HttpMatch, Rule};
use super::ratelimit::Quota;
use super::*;

fn engine(rules: Vec<Rule>) -> Engine {
    let clock = Arc::new(TestClock::at(chrono::Utc::now()));
    Engine::new(rules, clock)
}

fn rule(action: Action, method: &str, path: &str) -> Rule {
    Rule {
        http: HttpMatch {
            method: Some(method.to_string()),
            path_glob: Some(path.to_string()),
        },
        exec: ExecMatch::default(),
        action,
        message: None,
        rate_limit: None,
        time_range: None,
    }
}

#[test]
fn first_matching_rule_wins() {
    let e = engine(vec![
        rule(Action::Deny, "GET", "tasks"),
        rule(Action::Allow, "*", "**"),
    ]);
    assert_eq!(e.evaluate_http("GET", "tasks", "k").action, DecisionAction::Deny);
}

#[test]
fn empty_rule_list_is_default_deny() {
    let e = engine(vec![]);
    let d = e.evaluate_http("GET", "tasks", "k");
    assert_eq!(d.action, DecisionAction::Deny);
    assert!(d.message.unwrap().contains("default deny"));
}

#[test]
fn no_matching_rule_is_default_deny() {
    let e = engine(vec![rule(Action::Allow, "GET", "tasks")]);
    assert_eq!(
        e.evaluate_http("POST", "tasks", "k").action,
        DecisionAction::Deny
    );
}

#[test]
fn rate_limited_rule_exhausts_then_rejects() {
    let mut r = rule(Action::Allow, "GET", "tasks");
    r.rate_limit = Some(Quota {
        max: 2,
        window: std::time::Duration::from_secs(60),
    });
    let e = engine(vec![r]);
    assert_eq!(e.evaluate_http("GET", "tasks", "a1").action, DecisionAction::Allow);
    assert_eq!(e.evaluate_http("GET", "tasks", "a1").action, DecisionAction::Allow);
    assert_eq!(
        e.evaluate_http("GET", "tasks", "a1").action,
        DecisionAction::RateLimited
    );
    // independent key has its own budget
    assert_eq!(e.evaluate_http("GET", "tasks", "a2").action, DecisionAction::Allow);
}

#[test]
fn time_window_miss_skips_rule_not_rejects() {
    use super::rule::{TimeRange, Weekday};

    let clock = Arc::new(TestClock::at(
        chrono::DateTime::parse_from_rfc3339("2026-07-28T10:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc),
    ));
    // 2026-07-28 is a Tuesday.
    let mut blocked = rule(Action::Deny, "GET", "tasks");
    blocked.time_range = Some(TimeRange {
        weekdays: Some(vec![Weekday::Monday]),
        intervals: vec![],
    });
    let fallback = rule(Action::Allow, "GET", "tasks");
    let e = Engine::new(vec![blocked, fallback], clock);
    assert_eq!(e.evaluate_http("GET", "tasks", "k").action, DecisionAction::Allow);
}

#[test]
fn evaluate_exec_matches_command_args_cwd() {
    let mut r = Rule {
        http: HttpMatch::default(),
        exec: ExecMatch {
            command_glob: Some("rm".to_string()),
            args_regex: Some(regex::Regex::new("-rf").unwrap()),
            cwd_glob: None,
        },
        action: Action::Deny,
        message: Some("no recursive deletes".to_string()),
        rate_limit: None,
        time_range: None,
    };
    r.message = Some("no recursive deletes".to_string());
    let e = engine(vec![r]);
    let d = e.evaluate_exec("rm", "-rf /", "/home", "k");
    assert_eq!(d.action, DecisionAction::Deny);
    assert_eq!(d.message.as_deref(), Some("no recursive deletes"));

    // args don't match -> falls through to default deny, different message
    let d2 = e.evaluate_exec("rm", "file.txt", "/home", "k");
    assert_eq!(d2.action, DecisionAction::Deny);
    assert!(d2.message.unwrap().contains("default deny"));
}
