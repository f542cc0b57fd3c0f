use std::sync::Arc;

use wardgate_core::TestClock;

use super::*;

fn store() -> GrantStore {
    GrantStore::new(Arc::new(TestClock::at(Utc::now())))
}

fn grant(scope: &str, agent: &str, command: &str, action: GrantAction) -> Grant {
    Grant {
        id: String::new(),
        created_at: Utc::now(),
        expires_at: None,
        agent_id: agent.to_string(),
        scope: scope.to_string(),
        r#match: GrantMatch {
            command_glob: Some(command.to_string()),
            ..Default::default()
        },
        action,
        reason: None,
    }
}

#[test]
fn add_and_check_exec_roundtrip() {
    let s = store();
    s.add(grant("conclave:obsidian", "a1", "rm", GrantAction::Allow))
        .unwrap();
    let found = s.check_exec("a1", "conclave:obsidian", "rm", "-rf /tmp", "/home");
    assert!(found.is_some());
    assert_eq!(found.unwrap().action, GrantAction::Allow);
}

#[test]
fn wildcard_agent_matches_any() {
    let s = store();
    s.add(grant("conclave:obsidian", "*", "rm", GrantAction::Allow))
        .unwrap();
    assert!(s.check_exec("anyone", "conclave:obsidian", "rm", "", "").is_some());
}

#[test]
fn wrong_scope_does_not_match() {
    let s = store();
    s.add(grant("conclave:obsidian", "a1", "rm", GrantAction::Allow))
        .unwrap();
    assert!(s.check_exec("a1", "conclave:other", "rm", "", "").is_none());
}

#[test]
fn expired_grant_never_matches() {
    let s = store();
    let mut g = grant("conclave:obsidian", "a1", "rm", GrantAction::Allow);
    g.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
    s.add(g).unwrap();
    assert!(s.check_exec("a1", "conclave:obsidian", "rm", "", "").is_none());
}

#[test]
fn revoke_removes_grant() {
    let s = store();
    let added = s
        .add(grant("conclave:obsidian", "a1", "rm", GrantAction::Allow))
        .unwrap();
    assert!(s.check_exec("a1", "conclave:obsidian", "rm", "", "").is_some());
    s.revoke(&added.id).unwrap();
    assert!(s.check_exec("a1", "conclave:obsidian", "rm", "", "").is_none());
}

#[test]
fn revoke_unknown_id_errors() {
    let s = store();
    assert!(matches!(s.revoke("nope"), Err(GrantError::NotFound(_))));
}

#[test]
fn prune_drops_expired_only() {
    let s = store();
    let mut expired = grant("conclave:obsidian", "a1", "rm", GrantAction::Allow);
    expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
    s.add(expired).unwrap();
    s.add(grant("conclave:obsidian", "a1", "ls", GrantAction::Allow))
        .unwrap();
    s.prune().unwrap();
    assert_eq!(s.list().len(), 1);
    assert_eq!(s.list()[0].r#match.command_glob.as_deref(), Some("ls"));
}

#[test]
fn exec_grant_ignores_http_only_method_field() {
    // spec 9: an HTTP-only `method` field on a grant is silently ignored
    // when matching exec requests.
    let s = store();
    let mut g = grant("conclave:obsidian", "a1", "rm", GrantAction::Allow);
    g.r#match.method = Some("GET".to_string());
    s.add(g).unwrap();
    assert!(s.check_exec("a1", "conclave:obsidian", "rm", "", "").is_some());
}

#[test]
fn load_from_file_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grants.json");
    {
        let s = GrantStore::load_from_file(&path, Arc::new(TestClock::at(Utc::now()))).unwrap();
        s.add(grant("conclave:obsidian", "a1", "rm", GrantAction::Allow))
            .unwrap();
    }
    let s2 = GrantStore::load_from_file(&path, Arc::new(TestClock::at(Utc::now()))).unwrap();
    assert_eq!(s2.list().len(), 1);
}
