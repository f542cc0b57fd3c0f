//! Approval manager (spec 3 "Approval Request", 4.5).
//!
//! Holds every pending ask-decision, drives its out-of-band lifecycle,
//! and fans a notification out to every configured channel without
//! blocking on them. The result-delivery slot is a one-capacity,
//! non-blocking handoff (`tokio::sync::oneshot`): whichever transition
//! wins takes the sender out of the map under the lock and sends without
//! holding the lock across the send (spec 9, second open question).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use wardgate_core::{ids, signal::ShutdownWatcher, Clock};

use crate::notify::{Notification, NotifierSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// Optional content payload attached to an ask decision (spec 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// A single ask-decision (spec 3 "Approval Request"). The `token` field
/// must never be emitted by the admin surface (spec 3 invariant); callers
/// constructing a `RequestView` for the admin API should always go
/// through `ApprovalRequest::redacted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub agent_id: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ApprovalContent>,
}

/// Request parameters for `ApprovalManager::request_approval`. Separate
/// from `ApprovalRequest` because id/token/status/timestamps are the
/// manager's to assign.
#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub agent_id: String,
    pub content: Option<ApprovalContent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(String),
    #[error("approval {0} is not pending (status: {1:?})")]
    NotPending(String, ApprovalStatus),
    #[error("invalid token for approval {0}")]
    BadToken(String),
    #[error("approval {0} timed out")]
    Timeout(String),
    #[error("approval wait was cancelled")]
    Cancelled,
}

struct PendingEntry {
    request: ApprovalRequest,
    result_tx: Option<oneshot::Sender<ApprovalStatus>>,
}

/// Pending-request registry, out-of-band response wait, history, and
/// notifier fan-out (spec 4.5).
pub struct ApprovalManager {
    pending: Mutex<HashMap<String, PendingEntry>>,
    history: Mutex<VecDeque<ApprovalRequest>>,
    history_limit: usize,
    notifiers: NotifierSet,
    base_url: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ApprovalManager {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        history_limit: usize,
        notifiers: NotifierSet,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            notifiers,
            base_url: base_url.into(),
            timeout,
            clock,
        }
    }

    /// spec 4.5 `request_approval`. Blocks until a terminal status is
    /// reached (approved, denied, expired-by-timeout) or `cancel` fires.
    pub async fn request_approval(
        &self,
        req: NewApprovalRequest,
        mut cancel: ShutdownWatcher,
    ) -> Result<bool, ApprovalError> {
        let id = ids::request_id();
        let token = ids::capability_token();
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(self.timeout).unwrap_or_default();

        let request = ApprovalRequest {
            id: id.clone(),
            token: token.clone(),
            endpoint: req.endpoint.clone(),
            method: req.method.clone(),
            path: req.path.clone(),
            agent_id: req.agent_id.clone(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at,
            responded_at: None,
            content: req.content,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id.clone(),
            PendingEntry {
                request: request.clone(),
                result_tx: Some(tx),
            },
        );

        let summary = request
            .content
            .as_ref()
            .and_then(|c| c.summary.clone())
            .unwrap_or_else(|| {
                format!(
                    "Agent {} wants to {} {} on {}",
                    req.agent_id, req.method, req.path, req.endpoint
                )
            });
        self.notifiers.notify_all(Notification {
            request_id: id.clone(),
            approve_url: format!("{}/approve/{}?token={}", self.base_url, id, token),
            deny_url: format!("{}/deny/{}?token={}", self.base_url, id, token),
            endpoint: req.endpoint,
            method: req.method,
            path: req.path,
            agent_id: req.agent_id,
            summary,
        });

        tokio::select! {
            result = rx => {
                match result {
                    Ok(status) => Ok(status == ApprovalStatus::Approved),
                    Err(_) => Err(ApprovalError::Cancelled),
                }
            }
            _ = tokio::time::sleep(self.timeout) => {
                self.finalize(&id, ApprovalStatus::Expired);
                Err(ApprovalError::Timeout(id))
            }
            _ = cancel.signaled() => {
                Err(ApprovalError::Cancelled)
            }
        }
    }

    /// spec 4.5 `approve` (token-authenticated, public link path).
    pub fn approve(&self, id: &str, token: &str) -> Result<(), ApprovalError> {
        self.respond(id, Some(token), ApprovalStatus::Approved)
    }

    /// spec 4.5 `deny` (token-authenticated, public link path).
    pub fn deny(&self, id: &str, token: &str) -> Result<(), ApprovalError> {
        self.respond(id, Some(token), ApprovalStatus::Denied)
    }

    /// spec 4.5 `approve_by_id` (admin, no token).
    pub fn approve_by_id(&self, id: &str) -> Result<(), ApprovalError> {
        self.respond(id, None, ApprovalStatus::Approved)
    }

    /// spec 4.5 `deny_by_id` (admin, no token).
    pub fn deny_by_id(&self, id: &str) -> Result<(), ApprovalError> {
        self.respond(id, None, ApprovalStatus::Denied)
    }

    fn respond(
        &self,
        id: &str,
        token: Option<&str>,
        status: ApprovalStatus,
    ) -> Result<(), ApprovalError> {
        debug_assert!(status.is_terminal() && status != ApprovalStatus::Expired);

        let now = self.clock.now();
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(id) else {
            return Err(ApprovalError::NotFound(id.to_string()));
        };
        if let Some(token) = token {
            if entry.request.token != token {
                return Err(ApprovalError::BadToken(id.to_string()));
            }
        }
        if entry.request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotPending(id.to_string(), entry.request.status));
        }
        if now > entry.request.expires_at {
            entry.request.status = ApprovalStatus::Expired;
            entry.request.responded_at = Some(now);
            let tx = entry.result_tx.take();
            let finished = entry.request.clone();
            drop(pending);
            if let Some(tx) = tx {
                let _ = tx.send(ApprovalStatus::Expired);
            }
            self.push_history(finished);
            return Err(ApprovalError::Timeout(id.to_string()));
        }

        entry.request.status = status;
        entry.request.responded_at = Some(now);
        let tx = entry.result_tx.take();
        let finished = entry.request.clone();
        drop(pending);

        if let Some(tx) = tx {
            let _ = tx.send(status);
        }
        self.push_history(finished);
        Ok(())
    }

    fn finalize(&self, id: &str, status: ApprovalStatus) {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(id) else {
            return;
        };
        if entry.request.status != ApprovalStatus::Pending {
            return;
        }
        entry.request.status = status;
        entry.request.responded_at = Some(self.clock.now());
        let tx = entry.result_tx.take();
        let finished = entry.request.clone();
        drop(pending);
        if let Some(tx) = tx {
            let _ = tx.send(status);
        }
        self.push_history(finished);
    }

    fn push_history(&self, request: ApprovalRequest) {
        let mut history = self.history.lock();
        history.push_front(request);
        history.truncate(self.history_limit);
    }

    /// spec 4.5 `list`: snapshot of pending, non-expired requests.
    pub fn list(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .values()
            .map(|e| e.request.clone())
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect()
    }

    /// spec 4.5 `history`: newest-first snapshot of up to `n` terminal
    /// requests.
    pub fn history(&self, n: usize) -> Vec<ApprovalRequest> {
        self.history.lock().iter().take(n).cloned().collect()
    }

    /// spec 4.5 `get`.
    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        if let Some(entry) = self.pending.lock().get(id) {
            return Some(entry.request.clone());
        }
        self.history.lock().iter().find(|r| r.id == id).cloned()
    }

    /// spec 4.5 `cleanup`: drop live-map entries older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(max_age).unwrap_or_default();
        self.pending.lock().retain(|_, e| now - e.request.created_at < cutoff);
    }
}

#[cfg(test)]
#[path = "approval_tests.rs"]
mod tests;
