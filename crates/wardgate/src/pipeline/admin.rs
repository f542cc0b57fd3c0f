//! Admin API (spec 6 "Admin API"): approvals, history, audit queries, and
//! grant management. Every route is gated by [`require_admin`]; none of
//! it is reachable by an agent bearer key.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::{require_admin, AppState};
use crate::audit::{AuditDecision, QueryParams};
use crate::grants::{Grant, GrantError, GrantMatch};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ui/api/approvals", get(list_approvals))
        .route("/ui/api/approvals/{id}", get(get_approval))
        .route("/ui/api/approvals/{id}/approve", post(approve_approval))
        .route("/ui/api/approvals/{id}/deny", post(deny_approval))
        .route("/ui/api/history", get(list_history))
        .route("/ui/api/logs", get(list_logs))
        .route("/ui/api/logs/filters", get(list_log_filters))
        .route("/ui/api/grants", get(list_grants).post(create_grant))
        .route("/ui/api/grants/{id}", delete(revoke_grant))
}

async fn list_approvals(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let Some(manager) = &state.approvals else {
        return Json(json!({ "approvals": [] })).into_response();
    };
    Json(json!({ "approvals": manager.list() })).into_response()
}

async fn get_approval(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let Some(manager) = &state.approvals else {
        return (StatusCode::NOT_FOUND, "no approval manager configured").into_response();
    };
    match manager.get(&id) {
        Some(req) => Json(req).into_response(),
        None => (StatusCode::NOT_FOUND, "approval not found").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ApproveQuery {
    grant: Option<String>,
}

/// `POST /ui/api/approvals/<id>/approve?grant=<duration>|always`.
/// The optional `grant` query param additionally creates a standing grant
/// bound to the approved request's agent/endpoint/method/path so the same
/// request doesn't need to ask again (spec 6: admin approve "may also
/// materialize a grant").
async fn approve_approval(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<ApproveQuery>,
) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let Some(manager) = &state.approvals else {
        return (StatusCode::NOT_FOUND, "no approval manager configured").into_response();
    };
    let approved = manager.get(&id);
    match manager.approve_by_id(&id) {
        Ok(()) => {
            if let Some(grant_spec) = &q.grant {
                if let Some(req) = approved {
                    match materialize_grant(&state, &req, grant_spec) {
                        Ok(grant) => {
                            if let Err(err) = state.grants.add(grant) {
                                tracing::warn!(error = %err, "failed to materialize grant from approval");
                            }
                        }
                        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
                    }
                }
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => approval_error_response(err),
    }
}

/// Builds the grant that `?grant=<duration>|always` materializes from an
/// approved request, binding scope and match fields to what was actually
/// approved instead of a generic endpoint-wide allow. A conclave `EXEC`
/// approval (`method == "EXEC"`) carries the raw command line in `path`;
/// the grant binds to its leading command word rather than the endpoint
/// path/method pair an HTTP approval would use.
fn materialize_grant(
    state: &AppState,
    req: &crate::approval::ApprovalRequest,
    grant_spec: &str,
) -> Result<Grant, String> {
    let expires_at = if grant_spec == "always" {
        None
    } else {
        let duration = crate::config::parse_duration(grant_spec)
            .map_err(|_| format!("invalid grant duration {grant_spec:?}"))?;
        Some(state.clock.now() + chrono::Duration::from_std(duration).unwrap_or_default())
    };

    let (scope, r#match) = if req.method == "EXEC" {
        let command = req.path.split_whitespace().next().unwrap_or(&req.path).to_string();
        (
            format!("conclave:{}", req.endpoint),
            GrantMatch {
                command_glob: Some(command),
                ..Default::default()
            },
        )
    } else {
        (
            format!("endpoint:{}", req.endpoint),
            GrantMatch {
                method: Some(req.method.clone()),
                path_glob: Some(req.path.clone()),
                ..Default::default()
            },
        )
    };

    Ok(Grant {
        id: String::new(),
        created_at: state.clock.now(),
        expires_at,
        agent_id: req.agent_id.clone(),
        scope,
        r#match,
        action: crate::grants::GrantAction::Allow,
        reason: Some(format!("materialized from approval {}", req.id)),
    })
}

async fn deny_approval(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let Some(manager) = &state.approvals else {
        return (StatusCode::NOT_FOUND, "no approval manager configured").into_response();
    };
    match manager.deny_by_id(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => approval_error_response(err),
    }
}

fn approval_error_response(err: crate::approval::ApprovalError) -> Response {
    use crate::approval::ApprovalError;
    let status = match err {
        ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
        ApprovalError::NotPending(_, _) | ApprovalError::Timeout(_) => StatusCode::CONFLICT,
        ApprovalError::BadToken(_) => StatusCode::FORBIDDEN,
        ApprovalError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "message": err.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn list_history(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<HistoryQuery>) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let Some(manager) = &state.approvals else {
        return Json(json!({ "history": [] })).into_response();
    };
    Json(json!({ "history": manager.history(q.limit.unwrap_or(100)) })).into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    endpoint: Option<String>,
    agent: Option<String>,
    decision: Option<String>,
    method: Option<String>,
    before: Option<String>,
    limit: Option<usize>,
}

async fn list_logs(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<LogsQuery>) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let decision = match q.decision.as_deref() {
        None => None,
        Some("allow") => Some(AuditDecision::Allow),
        Some("deny") => Some(AuditDecision::Deny),
        Some("rate_limited") => Some(AuditDecision::RateLimited),
        Some("error") => Some(AuditDecision::Error),
        Some(other) => return (StatusCode::BAD_REQUEST, format!("unknown decision {other:?}")).into_response(),
    };
    let before = match q.before.as_deref() {
        None => None,
        Some(raw) => match chrono::DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => Some(dt.with_timezone(&chrono::Utc)),
            Err(_) => return (StatusCode::BAD_REQUEST, format!("invalid before timestamp {raw:?}")).into_response(),
        },
    };
    let params = QueryParams {
        endpoint: q.endpoint,
        agent: q.agent,
        decision,
        method: q.method,
        before,
        limit: q.limit.unwrap_or(100),
    };
    Json(json!({ "logs": state.audit.query(&params) })).into_response()
}

async fn list_log_filters(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    Json(json!({
        "endpoints": state.audit.get_endpoints(),
        "agents": state.audit.get_agents(),
        "decisions": ["allow", "deny", "rate_limited", "error"],
    }))
    .into_response()
}

async fn list_grants(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    Json(json!({ "grants": state.grants.list() })).into_response()
}

async fn create_grant(State(state): State<AppState>, headers: HeaderMap, Json(grant): Json<Grant>) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    match state.grants.add(grant) {
        Ok(grant) => (StatusCode::CREATED, Json(grant)).into_response(),
        Err(err) => grant_error_response(err),
    }
}

async fn revoke_grant(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    match state.grants.revoke(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => grant_error_response(err),
    }
}

fn grant_error_response(err: GrantError) -> Response {
    let status = match err {
        GrantError::NotFound(_) => StatusCode::NOT_FOUND,
        GrantError::Persist(_) | GrantError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "message": err.to_string() }))).into_response()
}
