//! Fixed-capacity ring buffer audit store (spec 3 "Audit Entry", 4.8).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wardgate_core::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allow,
    Deny,
    RateLimited,
    Error,
}

impl AuditDecision {
    /// spec 4.7: classify by HTTP status (403 -> deny, 429 -> rate_limited,
    /// 2xx/3xx -> allow, else error).
    pub fn from_status(status: u16) -> Self {
        match status {
            403 => AuditDecision::Deny,
            429 => AuditDecision::RateLimited,
            200..=399 => AuditDecision::Allow,
            _ => AuditDecision::Error,
        }
    }
}

/// One audit record (spec 3 "Audit Entry"). Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub request_id: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub source_ip: String,
    pub agent_id: String,
    pub decision: AuditDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    pub bytes_written: u64,
    pub duration_ms: u64,
}

impl AuditEntry {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().simple().to_string(),
            endpoint: endpoint.into(),
            method: method.into(),
            path: path.into(),
            source_ip: String::new(),
            agent_id: String::new(),
            decision: AuditDecision::Error,
            message: None,
            upstream_status: None,
            bytes_written: 0,
            duration_ms: 0,
        }
    }
}

/// Stored form: the entry plus a UTC timestamp and optional captured body
/// (spec 3: "Stored-form wraps it with a UTC timestamp and optionally the
/// request body if body-capture is enabled").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: AuditEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pub endpoint: Option<String>,
    pub agent: Option<String>,
    pub decision: Option<AuditDecision>,
    pub method: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl QueryParams {
    fn matches(&self, e: &StoredEntry) -> bool {
        if let Some(ep) = &self.endpoint {
            if &e.entry.endpoint != ep {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if &e.entry.agent_id != agent {
                return false;
            }
        }
        if let Some(decision) = self.decision {
            if e.entry.decision != decision {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if !e.entry.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(before) = self.before {
            if e.timestamp >= before {
                return false;
            }
        }
        true
    }
}

struct Ring {
    buf: Vec<Option<StoredEntry>>,
    head: usize,
    count: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![None; capacity.max(1)],
            head: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn push(&mut self, entry: StoredEntry) {
        self.buf[self.head] = Some(entry);
        self.head = (self.head + 1) % self.capacity();
        self.count = (self.count + 1).min(self.capacity());
    }

    /// Iterates newest-first starting at the slot just before `head`.
    fn iter_newest_first(&self) -> impl Iterator<Item = &StoredEntry> {
        let cap = self.capacity();
        (0..self.count).map(move |i| {
            let idx = (self.head + cap - 1 - i) % cap;
            self.buf[idx].as_ref().expect("within count")
        })
    }
}

/// Thread-safe ring buffer of audit entries (spec 4.8).
pub struct AuditStore {
    ring: RwLock<Ring>,
    clock: Arc<dyn Clock>,
}

impl AuditStore {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            ring: RwLock::new(Ring::new(capacity)),
            clock,
        }
    }

    /// spec 4.8 `add`. Never fails.
    pub fn record(&self, entry: AuditEntry, body: Option<String>) {
        let stored = StoredEntry {
            timestamp: self.clock.now(),
            entry,
            body,
        };
        self.ring.write().push(stored);
    }

    /// spec 4.8 `query`.
    pub fn query(&self, params: &QueryParams) -> Vec<StoredEntry> {
        let limit = if params.limit == 0 { usize::MAX } else { params.limit };
        self.ring
            .read()
            .iter_newest_first()
            .filter(|e| params.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_endpoints(&self) -> Vec<String> {
        self.unique_sorted(|e| e.entry.endpoint.clone())
    }

    pub fn get_agents(&self) -> Vec<String> {
        self.unique_sorted(|e| e.entry.agent_id.clone())
    }

    fn unique_sorted(&self, f: impl Fn(&StoredEntry) -> String) -> Vec<String> {
        let ring = self.ring.read();
        let mut values: Vec<String> = ring
            .iter_newest_first()
            .map(f)
            .filter(|v| !v.is_empty())
            .collect();
        values.sort();
        values.dedup();
        values
    }

    pub fn count(&self) -> usize {
        self.ring.read().count
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
