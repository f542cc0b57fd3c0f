//! Request pipeline: per-endpoint handler composition (spec 4.7).
//!
//! strip path prefix -> agent authentication -> audit wrapper -> the
//! protocol-specific handler. Every fallible branch produces a
//! [`PipelineError`], which carries its HTTP status and audit decision
//! tag together (SPEC_FULL.md 7) so there is exactly one place that maps
//! "what went wrong" onto both the response and the audit record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, RawQuery, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use wardgate_core::signal::ShutdownWatcher;
use wardgate_core::Clock;

use crate::adapter::{AdapterError, CredentialSource, ForwardRequest, UpstreamAdapter};
use crate::approval::{ApprovalContent, ApprovalError, ApprovalManager, NewApprovalRequest};
use crate::audit::{AuditDecision, AuditEntry, AuditStore};
use crate::config::{AdapterKind, Conclave, Endpoint, GatewayConfig};
use crate::exec::{parse_pipeline, Segment};
use crate::grants::{GrantAction, GrantStore};
use crate::hub::{ClientFrame, ExecGuard, Hub};
use crate::policy::{Decision, DecisionAction, Engine};

pub mod admin;

/// Everything a handler needs to evaluate and forward a request. Built
/// once at startup and shared behind an `Arc` (spec 9: shared mutable
/// state, single-writer-many-readers).
pub struct AppStateInner {
    pub config: GatewayConfig,
    pub grants: GrantStore,
    pub approvals: Option<Arc<ApprovalManager>>,
    pub audit: Arc<AuditStore>,
    pub hub: Arc<Hub>,
    pub adapters: HashMap<AdapterKind, Arc<dyn UpstreamAdapter>>,
    pub credentials: Arc<dyn CredentialSource>,
    /// agent bearer key -> agent id, resolved once from `agents[].key_env`.
    pub agent_keys: HashMap<String, String>,
    pub admin_key: Option<String>,
    pub clock: Arc<dyn Clock>,
    /// Cancels every in-flight approval wait and exec ceiling on process
    /// shutdown (spec 5: "every blocking operation accepts a caller
    /// cancellation token").
    pub shutdown: ShutdownWatcher,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn adapter_for(&self, kind: AdapterKind) -> Option<&Arc<dyn UpstreamAdapter>> {
        self.adapters.get(&kind)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/conclaves/ws", get(conclave_ws_handler))
        .route("/conclaves/", get(list_conclaves_handler))
        .route("/conclaves/{name}/exec", post(conclave_exec_handler))
        .route("/approve/{id}", get(approve_link_handler))
        .route("/deny/{id}", get(deny_link_handler))
        .route("/status/{id}", get(status_handler))
        .merge(admin::router())
        .route(
            "/{endpoint}/",
            get(endpoint_handler)
                .post(endpoint_handler)
                .put(endpoint_handler)
                .delete(endpoint_handler)
                .patch(endpoint_handler),
        )
        .route(
            "/{endpoint}/{*rest}",
            get(endpoint_handler)
                .post(endpoint_handler)
                .put(endpoint_handler)
                .delete(endpoint_handler)
                .patch(endpoint_handler),
        )
        .with_state(state)
}

/// spec 7 error taxonomy: HTTP status, audit decision tag, and an
/// optional message carried together (SPEC_FULL.md 7).
#[derive(Debug, Clone)]
pub enum PipelineError {
    Unauthenticated,
    NotFound(&'static str),
    Deny(String),
    RateLimited(Option<u64>),
    /// spec 7: "Approval system unavailable (ask decision with no manager
    /// configured) -> 403, fail-closed."
    ApprovalUnavailable,
    UpstreamUnreachable(String),
    AdapterNotImplemented,
    ConclaveUnavailable(String),
    BadRequest(String),
}

impl PipelineError {
    fn status(&self) -> StatusCode {
        match self {
            PipelineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Deny(_) | PipelineError::ApprovalUnavailable => StatusCode::FORBIDDEN,
            PipelineError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::UpstreamUnreachable(_) | PipelineError::AdapterNotImplemented => StatusCode::BAD_GATEWAY,
            PipelineError::ConclaveUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// `None` means "don't audit this at all" (spec 7: auth failures get
    /// no audit-of-detail).
    fn audit_decision(&self) -> Option<AuditDecision> {
        match self {
            PipelineError::Unauthenticated | PipelineError::NotFound(_) => None,
            PipelineError::Deny(_) | PipelineError::ApprovalUnavailable => Some(AuditDecision::Deny),
            PipelineError::RateLimited(_) => Some(AuditDecision::RateLimited),
            PipelineError::UpstreamUnreachable(_)
            | PipelineError::AdapterNotImplemented
            | PipelineError::ConclaveUnavailable(_)
            | PipelineError::BadRequest(_) => Some(AuditDecision::Error),
        }
    }

    fn message(&self) -> Option<String> {
        match self {
            PipelineError::Unauthenticated => None,
            PipelineError::NotFound(what) => Some(format!("unknown {what}")),
            PipelineError::Deny(msg) => Some(msg.clone()),
            PipelineError::ApprovalUnavailable => Some("approval system unavailable".to_string()),
            PipelineError::RateLimited(_) => Some("rate limited".to_string()),
            PipelineError::UpstreamUnreachable(msg) => Some(msg.clone()),
            PipelineError::AdapterNotImplemented => Some("adapter not implemented".to_string()),
            PipelineError::ConclaveUnavailable(msg) => Some(msg.clone()),
            PipelineError::BadRequest(msg) => Some(msg.clone()),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let action = match self.audit_decision() {
            Some(AuditDecision::RateLimited) => "rate_limited",
            Some(AuditDecision::Deny) => "deny",
            Some(AuditDecision::Error) | None => "error",
            Some(AuditDecision::Allow) => "allow",
        };
        let mut resp = (status, Json(json!({ "action": action, "message": self.message() }))).into_response();
        if let PipelineError::RateLimited(Some(secs)) = &self {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert("retry-after", value);
            }
        }
        resp
    }
}

/// Applies the audit-classification half of `PipelineError` to an
/// in-progress [`AuditEntry`] and records it, unless the error is one
/// spec 7 says gets no audit detail (auth failures).
fn audit_error(audit: &AuditStore, mut entry: AuditEntry, start: Instant, err: &PipelineError) {
    let Some(decision) = err.audit_decision() else { return };
    entry.decision = decision;
    entry.message = err.message();
    entry.duration_ms = elapsed_ms(start);
    audit.record(entry, None);
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn authenticate_agent(state: &AppStateInner, headers: &HeaderMap) -> Result<String, PipelineError> {
    let token = bearer_token(headers).ok_or(PipelineError::Unauthenticated)?;
    state
        .agent_keys
        .get(token)
        .cloned()
        .ok_or(PipelineError::Unauthenticated)
}

fn require_admin(state: &AppStateInner, headers: &HeaderMap) -> Result<(), PipelineError> {
    let expected = state.admin_key.as_deref().ok_or(PipelineError::Unauthenticated)?;
    let token = bearer_token(headers).ok_or(PipelineError::Unauthenticated)?;
    if token == expected {
        Ok(())
    } else {
        Err(PipelineError::Unauthenticated)
    }
}

fn source_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// spec 4.7 HTTP endpoint handler.
async fn endpoint_handler(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let name = path_params.get("endpoint").cloned().unwrap_or_default();
    let rest = path_params.get("rest").cloned().unwrap_or_default();

    let agent_id = match authenticate_agent(&state, &headers) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    let Some(endpoint) = state.config.endpoints.get(&name) else {
        return PipelineError::NotFound("endpoint").into_response();
    };

    let mut entry = AuditEntry::new(name.clone(), method.to_string(), rest.clone());
    entry.agent_id = agent_id.clone();
    entry.source_ip = source_ip(&headers);

    if !endpoint.allows_agent(&agent_id) {
        let err = PipelineError::Deny("agent not permitted on this endpoint".to_string());
        audit_error(&state.audit, entry, start, &err);
        return err.into_response();
    }

    let scope = format!("endpoint:{name}");
    let decision = if let Some(grant) = state.grants.check_http(&agent_id, &scope, method.as_str(), &rest) {
        match grant.action {
            GrantAction::Allow => Decision::allow(),
            GrantAction::Deny => Decision::deny(grant.reason.unwrap_or_else(|| "denied by grant".to_string())),
        }
    } else {
        endpoint.engine.evaluate_http(method.as_str(), &rest, &agent_id)
    };

    let allowed = match decision.action {
        DecisionAction::Deny => {
            let err = PipelineError::Deny(decision.message.unwrap_or_else(|| "denied".to_string()));
            audit_error(&state.audit, entry, start, &err);
            return err.into_response();
        }
        DecisionAction::RateLimited => {
            let err = PipelineError::RateLimited(decision.retry_after_secs);
            audit_error(&state.audit, entry, start, &err);
            return err.into_response();
        }
        DecisionAction::Allow => true,
        DecisionAction::Ask | DecisionAction::Queue => {
            match ask_for_approval(
                &state,
                name.clone(),
                method.to_string(),
                rest.clone(),
                agent_id.clone(),
                approval_content(&headers, &body),
            )
            .await
            {
                Ok(approved) => approved,
                Err(()) => {
                    let err = PipelineError::ApprovalUnavailable;
                    audit_error(&state.audit, entry, start, &err);
                    return err.into_response();
                }
            }
        }
    };

    if !allowed {
        let err = PipelineError::Deny("approval denied or timed out".to_string());
        audit_error(&state.audit, entry, start, &err);
        return err.into_response();
    }

    match forward(&state, endpoint, &method, &rest, &headers, body).await {
        Ok((resp, upstream_status, bytes_written, captured_body)) => {
            entry.decision = AuditDecision::Allow;
            entry.upstream_status = Some(upstream_status);
            entry.bytes_written = bytes_written;
            entry.duration_ms = elapsed_ms(start);
            state.audit.record(entry, captured_body);
            resp
        }
        Err(err) => {
            audit_error(&state.audit, entry, start, &err);
            err.into_response()
        }
    }
}

fn approval_content(headers: &HeaderMap, body: &Bytes) -> ApprovalContent {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let raw_body = std::str::from_utf8(body).ok().map(str::to_string);
    let snapshot = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    ApprovalContent {
        content_type,
        summary: None,
        raw_body,
        headers: snapshot,
    }
}

/// Returns `Ok(approved)`, or `Err(())` when approval is unavailable (no
/// manager configured: spec 7 "fail-closed") or the wait itself failed
/// by timeout/cancellation (treated as not-approved).
async fn ask_for_approval(
    state: &AppStateInner,
    endpoint: String,
    method: String,
    path: String,
    agent_id: String,
    content: ApprovalContent,
) -> Result<bool, ()> {
    let Some(manager) = &state.approvals else {
        return Err(());
    };
    match manager
        .request_approval(
            NewApprovalRequest {
                endpoint,
                method,
                path,
                agent_id,
                content: Some(content),
            },
            state.shutdown.clone(),
        )
        .await
    {
        Ok(approved) => Ok(approved),
        Err(ApprovalError::Timeout(_)) | Err(ApprovalError::Cancelled) => Ok(false),
        Err(_) => Err(()),
    }
}

type ForwardOk = (Response, u16, u64, Option<String>);

async fn forward(
    state: &AppStateInner,
    endpoint: &Endpoint,
    method: &Method,
    rest: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<ForwardOk, PipelineError> {
    let adapter = state
        .adapter_for(endpoint.adapter)
        .ok_or_else(|| PipelineError::UpstreamUnreachable("no adapter configured for this endpoint".to_string()))?;
    let upstream = endpoint
        .upstream
        .as_deref()
        .ok_or_else(|| PipelineError::UpstreamUnreachable("no upstream configured".to_string()))?;

    let mut fwd_headers: HashMap<String, String> = headers
        .iter()
        .filter(|(k, _)| *k != axum::http::header::AUTHORIZATION && *k != axum::http::header::HOST)
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    if let Some(auth) = &endpoint.auth {
        if let Some(credential) = state.credentials.resolve(&auth.credential_env) {
            let header_value = match auth.kind.as_str() {
                "bearer" => format!("Bearer {credential}"),
                other => {
                    tracing::warn!(kind = other, "unknown auth kind, defaulting to bearer injection");
                    format!("Bearer {credential}")
                }
            };
            fwd_headers.insert("authorization".to_string(), header_value);
        }
    }

    let captured_body = if endpoint.body_capture {
        std::str::from_utf8(&body).ok().map(str::to_string)
    } else {
        None
    };

    let req = ForwardRequest {
        method: method.to_string(),
        path: rest.to_string(),
        headers: fwd_headers,
        body,
    };

    match adapter.forward(upstream, req).await {
        Ok(resp) => {
            let status = resp.status;
            let bytes_written = resp.body.len() as u64;
            let mut builder = Response::builder().status(status);
            for (k, v) in &resp.headers {
                if let Ok(value) = HeaderValue::from_str(v) {
                    builder = builder.header(k, value);
                }
            }
            let response = builder
                .body(axum::body::Body::from(resp.body))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "bad upstream response").into_response());
            Ok((response, status, bytes_written, captured_body))
        }
        Err(AdapterError::NotImplemented) => Err(PipelineError::AdapterNotImplemented),
        Err(err) => Err(PipelineError::UpstreamUnreachable(err.to_string())),
    }
}

// ---------------------------------------------------------------------
// Conclave exec API (spec 6, 4.6, 4.7)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecBody {
    raw: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExecResponseBody {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
struct ConclaveSummary {
    name: String,
    connected: bool,
}

async fn list_conclaves_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let agent_id = match authenticate_agent(&state, &headers) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    let conclaves: Vec<ConclaveSummary> = state
        .config
        .conclaves
        .values()
        .filter(|c| c.allows_agent(&agent_id))
        .map(|c| ConclaveSummary {
            name: c.name.clone(),
            connected: state.hub.is_connected(&c.name),
        })
        .collect();
    Json(json!({ "conclaves": conclaves })).into_response()
}

async fn conclave_exec_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecBody>,
) -> Response {
    let start = Instant::now();
    let agent_id = match authenticate_agent(&state, &headers) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    let Some(conclave) = state.config.conclaves.get(&name) else {
        return PipelineError::NotFound("conclave").into_response();
    };

    let mut entry = AuditEntry::new(name.clone(), "EXEC".to_string(), body.raw.clone());
    entry.agent_id = agent_id.clone();
    entry.source_ip = source_ip(&headers);

    if !conclave.allows_agent(&agent_id) {
        let err = PipelineError::Deny("agent not permitted on this conclave".to_string());
        audit_error(&state.audit, entry, start, &err);
        return Json(exec_body_for(&err)).into_response();
    }

    let segments = match parse_pipeline(&body.raw, conclave.allow_redirects) {
        Ok(segs) => segs,
        Err(parse_err) => {
            let err = PipelineError::Deny(parse_err.to_string());
            audit_error(&state.audit, entry, start, &err);
            return (err.status(), Json(exec_body_for(&err))).into_response();
        }
    };
    if segments.is_empty() {
        // An empty or separator-only command (`""`, `";"`, whitespace)
        // parses to zero segments; default-deny rather than let it fall
        // through to an unconditional allow (spec 4.1, 7).
        let err = PipelineError::Deny("empty command".to_string());
        audit_error(&state.audit, entry, start, &err);
        return (err.status(), Json(exec_body_for(&err))).into_response();
    }

    let cwd = body.cwd.clone().unwrap_or_else(|| conclave.cwd.clone().unwrap_or_default());
    let combined = evaluate_segments(&state.grants, &name, &conclave.engine, &agent_id, &segments, &cwd);

    let allowed = match combined.action {
        DecisionAction::Deny => {
            let err = PipelineError::Deny(combined.message.unwrap_or_else(|| "denied".to_string()));
            audit_error(&state.audit, entry, start, &err);
            return (err.status(), Json(exec_body_for(&err))).into_response();
        }
        DecisionAction::RateLimited => {
            let err = PipelineError::RateLimited(combined.retry_after_secs);
            audit_error(&state.audit, entry, start, &err);
            return err.into_response();
        }
        DecisionAction::Allow => true,
        DecisionAction::Ask | DecisionAction::Queue => {
            match ask_for_approval(
                &state,
                name.clone(),
                "EXEC".to_string(),
                body.raw.clone(),
                agent_id.clone(),
                ApprovalContent {
                    content_type: None,
                    summary: Some(format!("Agent {agent_id} wants to run `{}` on {name}", body.raw)),
                    raw_body: Some(body.raw.clone()),
                    headers: HashMap::new(),
                },
            )
            .await
            {
                Ok(approved) => approved,
                Err(()) => {
                    let err = PipelineError::ApprovalUnavailable;
                    audit_error(&state.audit, entry, start, &err);
                    return (err.status(), Json(exec_body_for(&err))).into_response();
                }
            }
        }
    };

    if !allowed {
        let err = PipelineError::Deny("approval denied or timed out".to_string());
        audit_error(&state.audit, entry, start, &err);
        return Json(exec_body_for(&err)).into_response();
    }

    run_exec(&state, &name, conclave, &segments, &cwd, entry, start).await
}

fn exec_body_for(err: &PipelineError) -> ExecResponseBody {
    let action = match err.audit_decision() {
        Some(AuditDecision::RateLimited) => "rate_limited",
        Some(AuditDecision::Deny) => "deny",
        _ => "error",
    };
    ExecResponseBody {
        action,
        message: err.message(),
        stdout: None,
        stderr: None,
        exit_code: None,
    }
}

/// spec 4.7: "deny if any segment denies; rate_limited if any segment is
/// rate-limited; ask if any segment asks ...; allow only if every segment
/// allows (possibly via grant)."
fn evaluate_segments(
    grants: &GrantStore,
    conclave_name: &str,
    engine: &Engine,
    agent_id: &str,
    segments: &[Segment],
    cwd: &str,
) -> Decision {
    let scope = format!("conclave:{conclave_name}");
    let decisions: Vec<Decision> = segments
        .iter()
        .map(|seg| {
            let args = seg.args_joined();
            if let Some(grant) = grants.check_exec(agent_id, &scope, &seg.command, &args, cwd) {
                match grant.action {
                    GrantAction::Allow => Decision::allow(),
                    GrantAction::Deny => Decision::deny(grant.reason.unwrap_or_else(|| "denied by grant".to_string())),
                }
            } else {
                engine.evaluate_exec(&seg.command, &args, cwd, agent_id)
            }
        })
        .collect();

    if let Some(d) = decisions.iter().find(|d| d.action == DecisionAction::Deny) {
        return d.clone();
    }
    if let Some(d) = decisions.iter().find(|d| d.action == DecisionAction::RateLimited) {
        return d.clone();
    }
    if let Some(d) = decisions.iter().find(|d| matches!(d.action, DecisionAction::Ask | DecisionAction::Queue)) {
        return d.clone();
    }
    Decision::allow()
}

async fn run_exec(
    state: &AppStateInner,
    conclave_name: &str,
    conclave: &Conclave,
    segments: &[Segment],
    cwd: &str,
    mut entry: AuditEntry,
    start: Instant,
) -> Response {
    if !state.hub.is_connected(conclave_name) {
        let err = PipelineError::ConclaveUnavailable("conclave not connected".to_string());
        audit_error(&state.audit, entry, start, &err);
        return (err.status(), Json(exec_body_for(&err))).into_response();
    }

    // Redirects are already stripped by `parse_pipeline` when
    // `allow_redirects` is false (spec 4.7: "defense in depth against a
    // client that stripped redirections locally"); the chain/pipe
    // operator itself is not preserved verbatim, only reconstructed as a
    // `;`-joined sequence, since each segment was already independently
    // policy-approved and the remote shell only needs to run all of them.
    let command_line = segments.iter().map(Segment::to_command_line).collect::<Vec<_>>().join(" ; ");

    match run_exec_on_conclave(state, conclave_name, command_line, cwd.to_string()).await {
        Ok((stdout, stderr, exit_code)) => {
            entry.decision = AuditDecision::Allow;
            entry.bytes_written = (stdout.len() + stderr.len()) as u64;
            entry.duration_ms = elapsed_ms(start);
            state.audit.record(entry, None);
            Json(ExecResponseBody {
                action: "allow",
                message: None,
                stdout: Some(stdout),
                stderr: Some(stderr),
                exit_code: Some(exit_code),
            })
            .into_response()
        }
        Err(message) => {
            let err = PipelineError::ConclaveUnavailable(message);
            audit_error(&state.audit, entry, start, &err);
            (err.status(), Json(exec_body_for(&err))).into_response()
        }
    }
}

/// spec 5: "Conclave exec ... blocks until exit/error message, conclave
/// disconnect, context cancellation, or a 5-minute ceiling; on ceiling or
/// cancellation, an explicit kill frame is sent to the conclave."
async fn run_exec_on_conclave(
    state: &AppStateInner,
    conclave_name: &str,
    command: String,
    cwd: String,
) -> Result<(String, String, i32), String> {
    let request_id = uuid::Uuid::new_v4().simple().to_string();
    let mut rx = state
        .hub
        .send_exec(conclave_name, &request_id, command, Vec::new(), cwd)
        .await
        .map_err(|e| e.to_string())?;
    let _guard = ExecGuard::new(state.hub.clone(), conclave_name, request_id.clone());

    let mut stdout = String::new();
    let mut stderr = String::new();
    let ceiling = tokio::time::sleep(Duration::from_secs(300));
    tokio::pin!(ceiling);
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            _ = &mut ceiling => {
                let _ = state.hub.send_kill(conclave_name, &request_id).await;
                return Err("exec exceeded 5-minute ceiling".to_string());
            }
            _ = shutdown.signaled() => {
                let _ = state.hub.send_kill(conclave_name, &request_id).await;
                return Err("gateway shutting down".to_string());
            }
            msg = rx.recv() => {
                let Some(value) = msg else {
                    return Err("conclave disconnected".to_string());
                };
                match serde_json::from_value::<ClientFrame>(value) {
                    Ok(ClientFrame::Stdout { data, .. }) => stdout.push_str(&data),
                    Ok(ClientFrame::Stderr { data, .. }) => stderr.push_str(&data),
                    Ok(ClientFrame::Exit { exit_code, .. }) => return Ok((stdout, stderr, exit_code)),
                    Ok(ClientFrame::Error { message, .. }) => return Err(message),
                    Ok(ClientFrame::Pong) | Err(_) => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Conclave control-plane websocket (spec 6, 4.6)
// ---------------------------------------------------------------------

async fn conclave_ws_handler(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let Some(secret) = bearer_token(&headers) else {
        return PipelineError::Unauthenticated.into_response();
    };
    let Some(claimed_name) = headers.get("x-conclave-name").and_then(|v| v.to_str().ok()) else {
        return PipelineError::BadRequest("missing X-Conclave-Name".to_string()).into_response();
    };
    let name = match state.hub.authenticate(secret, claimed_name) {
        Ok(name) => name,
        Err(_) => return PipelineError::Unauthenticated.into_response(),
    };
    if state.hub.is_connected(&name) {
        return (StatusCode::CONFLICT, "conclave already connected").into_response();
    }

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = hub.handle_socket(socket, name.clone()).await {
            tracing::warn!(conclave = %name, error = %err, "conclave socket closed with error");
        }
    })
}

// ---------------------------------------------------------------------
// Public approval endpoints (spec 6: "unauthenticated; token in URL is
// the capability")
// ---------------------------------------------------------------------

async fn approve_link_handler(State(state): State<AppState>, Path(id): Path<String>, query: RawQuery) -> Response {
    respond_to_link(&state, &id, query, true)
}

async fn deny_link_handler(State(state): State<AppState>, Path(id): Path<String>, query: RawQuery) -> Response {
    respond_to_link(&state, &id, query, false)
}

fn token_from_query(query: &RawQuery) -> Option<&str> {
    let raw = query.0.as_deref()?;
    raw.split('&').find_map(|pair| pair.strip_prefix("token="))
}

fn respond_to_link(state: &AppStateInner, id: &str, query: RawQuery, approve: bool) -> Response {
    let Some(manager) = &state.approvals else {
        return html_page("approval system unavailable");
    };
    let Some(token) = token_from_query(&query) else {
        return html_page("missing token");
    };
    let result = if approve { manager.approve(id, token) } else { manager.deny(id, token) };
    match result {
        Ok(()) => html_page(if approve { "Request approved." } else { "Request denied." }),
        Err(err) => html_page(&err.to_string()),
    }
}

fn html_page(message: &str) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        format!("<html><body><p>{message}</p></body></html>"),
    )
        .into_response()
}

async fn status_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(manager) = &state.approvals else {
        return PipelineError::NotFound("approval manager").into_response();
    };
    match manager.get(&id) {
        Some(req) => Json(json!({ "id": req.id, "status": req.status })).into_response(),
        None => PipelineError::NotFound("approval").into_response(),
    }
}
