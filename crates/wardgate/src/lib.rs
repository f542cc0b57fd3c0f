//! Wardgate: a trust-boundary gateway that sits between autonomous agents
//! and the tools/services they're allowed to touch, enforcing declarative
//! policy, dynamic grants, rate limits, and human-in-the-loop approval on
//! every request.

pub mod adapter;
pub mod approval;
pub mod audit;
pub mod config;
pub mod exec;
pub mod grants;
pub mod hub;
pub mod notify;
pub mod pipeline;
pub mod policy;

pub use adapter::{AdapterError, CredentialSource, EnvCredentialSource, ForwardRequest, ForwardResponse, HttpAdapter, UpstreamAdapter};
pub use approval::{ApprovalContent, ApprovalError, ApprovalManager, ApprovalRequest, ApprovalStatus, NewApprovalRequest};
pub use audit::{AuditDecision, AuditEntry, AuditStore, QueryParams, StoredEntry};
pub use config::{parse_duration, AdapterKind, Conclave, ConfigError, Endpoint, GatewayConfig, NotifySpec, RawConfig};
pub use exec::{parse_pipeline, ExecParseError, Segment};
pub use grants::{Grant, GrantAction, GrantError, GrantMatch, GrantStore};
pub use hub::{Hub, HubError};
pub use pipeline::{router, AppState, AppStateInner};
pub use policy::{Action, Decision, DecisionAction, Engine, Rule};
