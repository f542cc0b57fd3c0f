//! Dynamic grant store (spec 3 "Grant", 4.4).
//!
//! A grant is a revocable, optionally time-limited override of static
//! policy. The store is a flat `Vec` behind a single lock; matching is a
//! linear scan (spec: "order-independent within a scope; the first
//! non-expired grant found ... short-circuits to allow").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wardgate_core::Clock;

use crate::policy::glob_match;

/// Match shape for a grant. HTTP-only fields (`method`) are ignored when
/// matching exec requests and vice versa (spec 9, "Open question
/// (source ambiguity)": preserved deliberately, not a bug).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_glob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd_glob: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAction {
    Allow,
    Deny,
}

/// A dynamic override to static policy (spec 3 "Grant").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    #[serde(default)]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub agent_id: String,
    /// `endpoint:<name>` or `conclave:<name>`.
    pub scope: String,
    #[serde(default)]
    pub r#match: GrantMatch,
    pub action: GrantAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Grant {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    fn agent_matches(&self, agent: &str) -> bool {
        self.agent_id == "*" || self.agent_id == agent
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GrantError {
    #[error("grant {0} not found")]
    NotFound(String),
    #[error("failed to persist grants: {0}")]
    Persist(#[from] std::io::Error),
    #[error("failed to serialize grants: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Thread-safe grant collection with optional on-disk persistence (spec
/// 4.4: "atomically writes the full JSON array to a sibling temp file and
/// renames over the target path").
pub struct GrantStore {
    grants: RwLock<Vec<Grant>>,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl GrantStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            grants: RwLock::new(Vec::new()),
            path: None,
            clock,
        }
    }

    /// Loads grants from `path` if it exists, then prunes expired ones
    /// (spec 3: "destroyed by ... file-load pruning") and persists that
    /// prune back. Subsequent mutations persist to `path`.
    pub fn load_from_file(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, GrantError> {
        let path = path.into();
        let grants = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            Vec::new()
        };
        let store = Self {
            grants: RwLock::new(grants),
            path: Some(path),
            clock,
        };
        store.prune()?;
        Ok(store)
    }

    pub fn list(&self) -> Vec<Grant> {
        self.grants.read().clone()
    }

    pub fn add(&self, mut grant: Grant) -> Result<Grant, GrantError> {
        if grant.id.is_empty() {
            grant.id = Uuid::new_v4().simple().to_string();
        }
        let now = self.clock.now();
        self.grants.write().push(grant.clone());
        self.persist_best_effort(now);
        Ok(grant)
    }

    pub fn revoke(&self, id: &str) -> Result<(), GrantError> {
        let mut grants = self.grants.write();
        let before = grants.len();
        grants.retain(|g| g.id != id);
        if grants.len() == before {
            return Err(GrantError::NotFound(id.to_string()));
        }
        drop(grants);
        self.persist_best_effort(self.clock.now());
        Ok(())
    }

    /// Drops every expired grant and persists the result.
    pub fn prune(&self) -> Result<(), GrantError> {
        let now = self.clock.now();
        self.grants.write().retain(|g| !g.is_expired(now));
        self.persist_best_effort(now);
        Ok(())
    }

    /// spec 4.4 `check_http`.
    pub fn check_http(&self, agent: &str, scope: &str, method: &str, path: &str) -> Option<Grant> {
        let now = self.clock.now();
        self.grants.read().iter().find(|g| {
            g.scope == scope
                && !g.is_expired(now)
                && g.agent_matches(agent)
                && g
                    .r#match
                    .method
                    .as_deref()
                    .is_none_or(|m| m.is_empty() || m.eq_ignore_ascii_case(method))
                && g
                    .r#match
                    .path_glob
                    .as_deref()
                    .is_none_or(|glob| glob_match(glob, path))
        }).cloned()
    }

    /// spec 4.4 `check_exec`. HTTP-only `method` is ignored (spec 9).
    pub fn check_exec(
        &self,
        agent: &str,
        scope: &str,
        command: &str,
        args: &str,
        cwd: &str,
    ) -> Option<Grant> {
        let now = self.clock.now();
        self.grants.read().iter().find(|g| {
            g.scope == scope
                && !g.is_expired(now)
                && g.agent_matches(agent)
                && g
                    .r#match
                    .command_glob
                    .as_deref()
                    .is_none_or(|glob| glob_match(glob, command))
                && g
                    .r#match
                    .args_regex
                    .as_deref()
                    .is_none_or(|pattern| {
                        regex::Regex::new(pattern)
                            .map(|re| re.is_match(args))
                            .unwrap_or(false)
                    })
                && g
                    .r#match
                    .cwd_glob
                    .as_deref()
                    .is_none_or(|glob| glob_match(glob, cwd))
        }).cloned()
    }

    /// Best-effort persistence: a write failure is logged and otherwise
    /// swallowed (spec 7: "Persistence failures ... mutation proceeds in
    /// memory; the next successful write recovers the on-disk copy").
    fn persist_best_effort(&self, _now: DateTime<Utc>) {
        let Some(path) = &self.path else { return };
        if let Err(err) = write_atomic(path, &self.grants.read()) {
            tracing::warn!(error = %err, path = %path.display(), "failed to persist grant store");
        }
    }
}

fn write_atomic(path: &Path, grants: &[Grant]) -> Result<(), GrantError> {
    let body = serde_json::to_vec_pretty(grants)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(&body)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
#[path = "grants_tests.rs"]
mod tests;
