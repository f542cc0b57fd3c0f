//! End-to-end scenarios (spec 8 "Concrete end-to-end scenarios"), driven
//! against the real `axum::Router` the binary serves via
//! `tower::ServiceExt::oneshot` -- no socket, no toolchain execution
//! needed to have written these correctly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use tower::ServiceExt;

use wardgate::notify::{NoopNotifier, NotifierSet};
use wardgate::{
    AdapterError, AdapterKind, ApprovalManager, AppState, AppStateInner, AuditDecision, AuditStore,
    CredentialSource, ForwardRequest, ForwardResponse, GatewayConfig, Grant, GrantAction, GrantMatch,
    GrantStore, Hub, QueryParams, UpstreamAdapter,
};
use wardgate_core::{signal, SystemClock};

const CONFIG_YAML: &str = r#"
server:
  listen: "127.0.0.1:0"
  base_url: "http://localhost:8080"
agents:
  - id: tessa
    key_env: TESSA_KEY
  - id: a1
    key_env: A1_KEY
  - id: a2
    key_env: A2_KEY
endpoints:
  todoist:
    upstream: "https://api.todoist.com/rest/v2"
    auth:
      type: bearer
      credential_env: TODOIST_TOKEN
    rules:
      - method: GET
        action: allow
  tasks_ask:
    upstream: "https://api.example.com"
    auth:
      type: bearer
      credential_env: TODOIST_TOKEN
    rules:
      - method: POST
        action: ask
  rated:
    upstream: "https://api.example.com"
    auth:
      type: bearer
      credential_env: TODOIST_TOKEN
    rules:
      - method: GET
        action: allow
        rate_limit: { max: 2, window: "1m" }
conclaves:
  obsidian:
    key_env: OBSIDIAN_SECRET
    rules:
      - command: "rg"
        action: allow
      - command: "rm"
        action: deny
        message: "rm is blocked by policy"
"#;

const CONFIG_YAML_SHORT_TIMEOUT: &str = r#"
server:
  listen: "127.0.0.1:0"
  base_url: "http://localhost:8080"
  approval_timeout: "1s"
agents:
  - id: tessa
    key_env: TESSA_KEY
endpoints:
  slow_ask:
    upstream: "https://api.example.com"
    auth:
      type: bearer
      credential_env: TODOIST_TOKEN
    rules:
      - method: POST
        action: ask
"#;

/// Records every forwarded request and answers with a fixed 200. HTTP
/// reverse-proxying itself is already exercised by `HttpAdapter`'s own
/// unit tests; these scenarios only need to observe what the pipeline
/// decided to forward and with what injected credential.
#[derive(Default)]
struct MockAdapter {
    calls: Mutex<Vec<(String, ForwardRequest)>>,
}

#[async_trait::async_trait]
impl UpstreamAdapter for MockAdapter {
    async fn forward(&self, upstream: &str, req: ForwardRequest) -> Result<ForwardResponse, AdapterError> {
        self.calls.lock().unwrap().push((upstream.to_string(), req.clone()));
        Ok(ForwardResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from_static(b"{\"ok\":true}"),
        })
    }
}

struct FixedCredentials(HashMap<String, String>);

impl CredentialSource for FixedCredentials {
    fn resolve(&self, credential_ref: &str) -> Option<String> {
        self.0.get(credential_ref).cloned()
    }
}

/// Assembles an `AppState` the way `wardgate-app`'s `main` does, minus
/// the environment-variable plumbing (tests wire agent keys and
/// credentials directly instead of resolving them from `std::env`). The
/// returned `ShutdownTrigger` must stay alive for the test's duration --
/// dropping it immediately trips every `cancel.signaled()` suspension
/// point in the pipeline.
fn build_state(
    yaml: &str,
    agent_keys: &[(&str, &str)],
    admin_key: Option<&str>,
    http_adapter: Option<Arc<MockAdapter>>,
) -> (AppState, signal::ShutdownTrigger) {
    let clock = Arc::new(SystemClock);
    let config = GatewayConfig::from_yaml_str(yaml, clock.clone()).expect("valid test config");

    let mut adapters: HashMap<AdapterKind, Arc<dyn UpstreamAdapter>> = HashMap::new();
    if let Some(mock) = http_adapter {
        adapters.insert(AdapterKind::Http, mock);
    }

    let mut creds = HashMap::new();
    creds.insert("TODOIST_TOKEN".to_string(), "upstream-secret".to_string());

    let (trigger, shutdown) = signal::new();

    let approvals = Arc::new(ApprovalManager::new(
        config.base_url.clone(),
        config.approval_timeout,
        config.history_limit,
        NotifierSet::new(vec![Arc::new(NoopNotifier)]),
        clock.clone(),
    ));
    let audit = Arc::new(AuditStore::new(config.audit_capacity, clock.clone()));
    let hub = Arc::new(Hub::new(HashMap::new(), clock.clone()));

    let state = Arc::new(AppStateInner {
        config,
        grants: GrantStore::new(clock.clone()),
        approvals: Some(approvals),
        audit,
        hub,
        adapters,
        credentials: Arc::new(FixedCredentials(creds)),
        agent_keys: agent_keys.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        admin_key: admin_key.map(str::to_string),
        clock,
        shutdown,
    });
    (state, trigger)
}

fn query_all(state: &AppState) -> Vec<wardgate::StoredEntry> {
    state.audit.query(&QueryParams { limit: 10, ..Default::default() })
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn req(method: &str, uri: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {bearer}"))
        .body(Body::empty())
        .unwrap()
}

fn req_json(method: &str, uri: &str, bearer: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {bearer}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Scenario 1: "Allow-then-proxy".
#[tokio::test]
async fn allow_then_proxy() {
    let mock = Arc::new(MockAdapter::default());
    let (state, _trigger) = build_state(CONFIG_YAML, &[("T", "tessa")], Some("A"), Some(mock.clone()));
    let router = wardgate::router(state.clone());

    let resp = router.oneshot(req("GET", "/todoist/tasks", "T")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let calls = mock.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (upstream, fwd) = &calls[0];
    assert_eq!(upstream, "https://api.todoist.com/rest/v2");
    assert_eq!(fwd.method, "GET");
    assert_eq!(fwd.path, "tasks");
    assert_eq!(fwd.headers.get("authorization"), Some(&"Bearer upstream-secret".to_string()));
    drop(calls);

    let entries = query_all(&state);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry.decision, AuditDecision::Allow);
}

/// Scenario 2: "Default-deny".
#[tokio::test]
async fn default_deny_unmatched_method() {
    let (state, _trigger) = build_state(CONFIG_YAML, &[("T", "tessa")], Some("A"), None);
    let router = wardgate::router(state.clone());

    let resp = router.oneshot(req("POST", "/todoist/tasks", "T")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let json = body_json(resp).await;
    assert!(json["message"].as_str().unwrap().contains("default deny"));

    let entries = query_all(&state);
    assert_eq!(entries[0].entry.decision, AuditDecision::Deny);
}

/// Scenario 3: "Ask approve-by-ID".
#[tokio::test]
async fn ask_then_admin_approve_by_id() {
    let mock = Arc::new(MockAdapter::default());
    let (state, _trigger) =
        build_state(CONFIG_YAML, &[("tessa_key", "tessa")], Some("A"), Some(mock.clone()));
    let router = wardgate::router(state.clone());

    let pending_router = router.clone();
    let handle = tokio::spawn(async move {
        pending_router
            .oneshot(req("POST", "/tasks_ask/new", "tessa_key"))
            .await
            .unwrap()
    });

    let mut approval_id = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let list = router.clone().oneshot(req("GET", "/ui/api/approvals", "A")).await.unwrap();
        let json = body_json(list).await;
        if let Some(first) = json["approvals"].as_array().and_then(|a| a.first()) {
            assert!(first.get("token").is_none(), "admin surface must never emit the approval token");
            approval_id = first["id"].as_str().map(str::to_string);
            break;
        }
    }
    let approval_id = approval_id.expect("approval should have registered as pending");

    let approve = router
        .clone()
        .oneshot(req("POST", &format!("/ui/api/approvals/{approval_id}/approve"), "A"))
        .await
        .unwrap();
    assert_eq!(approve.status(), StatusCode::NO_CONTENT);

    let resp = handle.await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let entries = query_all(&state);
    assert_eq!(entries[0].entry.decision, AuditDecision::Allow);
}

/// Scenario 4: "Ask timeout".
#[tokio::test(start_paused = true)]
async fn ask_times_out_when_unanswered() {
    let (state, _trigger) =
        build_state(CONFIG_YAML_SHORT_TIMEOUT, &[("tessa_key", "tessa")], Some("A"), None);
    let router = wardgate::router(state.clone());

    let resp = router.oneshot(req("POST", "/slow_ask/new", "tessa_key")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let entries = query_all(&state);
    assert_eq!(entries[0].entry.decision, AuditDecision::Deny);

    let history = wardgate::router(state.clone())
        .oneshot(req("GET", "/ui/api/history", "A"))
        .await
        .unwrap();
    let json = body_json(history).await;
    assert_eq!(json["history"][0]["status"].as_str().unwrap(), "expired");
}

/// Scenario 5: "Rate limit".
#[tokio::test]
async fn rate_limit_is_keyed_per_agent() {
    let mock = Arc::new(MockAdapter::default());
    let (state, _trigger) = build_state(
        CONFIG_YAML,
        &[("a1_key", "a1"), ("a2_key", "a2")],
        Some("A"),
        Some(mock),
    );
    let router = wardgate::router(state.clone());

    for attempt in 0..2 {
        let resp = router.clone().oneshot(req("GET", "/rated/items", "a1_key")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "a1 attempt {attempt} should be allowed");
    }
    let resp = router.clone().oneshot(req("GET", "/rated/items", "a1_key")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().get("retry-after").is_some());

    let resp = router.clone().oneshot(req("GET", "/rated/items", "a2_key")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK, "a2 has an independent rate-limit key");
}

/// Scenario 6: "Conclave pipeline rejection".
#[tokio::test]
async fn conclave_pipeline_denies_on_any_segment_deny() {
    let (state, _trigger) = build_state(CONFIG_YAML, &[("tessa_key", "tessa")], Some("A"), None);
    let router = wardgate::router(state.clone());

    let resp = router
        .oneshot(req_json(
            "POST",
            "/conclaves/obsidian/exec",
            "tessa_key",
            serde_json::json!({ "raw": "rg TODO | rm -rf /" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let json = body_json(resp).await;
    assert_eq!(json["action"], "deny");
    assert!(json["message"].as_str().unwrap().contains("rm"));
}

/// Scenario 7: "Grant overrides deny".
#[tokio::test]
async fn grant_overrides_conclave_deny() {
    let (state, _trigger) = build_state(CONFIG_YAML, &[("a1_key", "a1")], Some("A"), None);

    state
        .grants
        .add(Grant {
            id: String::new(),
            created_at: chrono::Utc::now(),
            expires_at: None,
            agent_id: "a1".to_string(),
            scope: "conclave:obsidian".to_string(),
            r#match: GrantMatch {
                command_glob: Some("rm".to_string()),
                ..Default::default()
            },
            action: GrantAction::Allow,
            reason: Some("explicitly approved for this incident".to_string()),
        })
        .unwrap();

    let router = wardgate::router(state.clone());
    let resp = router
        .oneshot(req_json(
            "POST",
            "/conclaves/obsidian/exec",
            "a1_key",
            serde_json::json!({ "raw": "rm -rf /" }),
        ))
        .await
        .unwrap();

    // The grant bypassed the deny; the only reason this now fails is
    // that no conclave is actually connected in this test.
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["action"], "error");
    assert!(json["message"].as_str().unwrap().contains("not connected"));
}

/// Scenario 8: "Unsafe command rejection".
#[tokio::test]
async fn unsafe_command_substitution_rejected() {
    let (state, _trigger) = build_state(CONFIG_YAML, &[("tessa_key", "tessa")], Some("A"), None);
    let router = wardgate::router(state.clone());

    let resp = router
        .oneshot(req_json(
            "POST",
            "/conclaves/obsidian/exec",
            "tessa_key",
            serde_json::json!({ "raw": "echo $(cat /etc/passwd)" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let json = body_json(resp).await;
    assert!(json["message"].as_str().unwrap().contains("command substitution"));
}
