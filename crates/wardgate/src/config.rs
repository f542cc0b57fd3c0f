//! Configuration types (spec 6 "Configuration (YAML-shaped, source-loaded)").
//!
//! YAML loading itself, preset expansion, and capability-bundle expansion
//! are external collaborators per spec 1 ("YAML configuration loading and
//! preset expansion ... out of scope"); this module owns the *shape* those
//! collaborators must populate, plus enough `serde_yaml` deserialization to
//! turn a config file into the immutable `Engine`-backed types the request
//! pipeline actually runs against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use wardgate_core::Clock;

use crate::policy::{Action, ClockInterval, Engine, ExecMatch, HttpMatch, Quota, Rule, TimeRange, Weekday};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("rule {index} in {owner:?}: {source}")]
    Rule {
        owner: String,
        index: usize,
        #[source]
        source: crate::policy::RuleError,
    },
    #[error("invalid duration {0:?}, expected e.g. \"30s\", \"5m\", \"1h\"")]
    BadDuration(String),
    #[error("unknown adapter kind {0:?}")]
    UnknownAdapter(String),
    #[error("unknown weekday {0:?}")]
    UnknownWeekday(String),
}

/// Parses `"30s"`, `"5m"`, `"1h"`, `"2d"` (bare digits default to seconds).
/// Exposed so `wardgate-app` can apply the same grammar to the `notify`
/// block's timeout without duplicating the parser.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n: u64 = digits.parse().map_err(|_| ConfigError::BadDuration(s.to_string()))?;
    let secs = match unit {
        "s" | "" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        _ => return Err(ConfigError::BadDuration(s.to_string())),
    };
    Ok(Duration::from_secs(secs))
}

fn parse_weekday(s: &str) -> Result<Weekday, ConfigError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Weekday::Monday,
        "tue" | "tuesday" => Weekday::Tuesday,
        "wed" | "wednesday" => Weekday::Wednesday,
        "thu" | "thursday" => Weekday::Thursday,
        "fri" | "friday" => Weekday::Friday,
        "sat" | "saturday" => Weekday::Saturday,
        "sun" | "sunday" => Weekday::Sunday,
        _ => return Err(ConfigError::UnknownWeekday(s.to_string())),
    })
}

/// Raw `rate_limit:` block.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSpec {
    pub max: u64,
    pub window: String,
}

/// Raw `time_range:` block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeRangeSpec {
    #[serde(default)]
    pub weekdays: Option<Vec<String>>,
    #[serde(default)]
    pub hours: Vec<String>,
}

/// Raw `match:` + action/message/rate_limit/time_range block (spec 3
/// "Rule"). Deserialized directly off the YAML rule list, then converted
/// into an immutable [`Rule`] by [`RuleSpec::into_rule`].
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    pub action: Action,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub time_range: Option<TimeRangeSpec>,
}

impl RuleSpec {
    pub fn into_rule(self) -> Result<Rule, ConfigError> {
        let rate_limit = match self.rate_limit {
            Some(rl) => Some(Quota {
                max: rl.max,
                window: parse_duration(&rl.window)?,
            }),
            None => None,
        };
        let time_range = match self.time_range {
            Some(tr) => {
                let weekdays = tr
                    .weekdays
                    .map(|ws| ws.iter().map(|w| parse_weekday(w)).collect::<Result<Vec<_>, _>>())
                    .transpose()?;
                let intervals = tr
                    .hours
                    .iter()
                    .map(|h| ClockInterval::parse(h))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ConfigError::BadDuration(tr.hours.join(",")))?;
                Some(TimeRange { weekdays, intervals })
            }
            None => None,
        };
        let args_regex = self
            .args
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .map_err(crate::policy::RuleError::BadRegex)
            .map_err(|e| ConfigError::Rule {
                owner: "rule".to_string(),
                index: 0,
                source: e,
            })?;
        Ok(Rule {
            http: HttpMatch {
                method: self.method,
                path_glob: self.path,
            },
            exec: ExecMatch {
                command_glob: self.command,
                args_regex,
                cwd_glob: self.cwd,
            },
            action: self.action,
            message: self.message,
            rate_limit,
            time_range,
        })
    }
}

fn rules_into_engine(owner: &str, specs: Vec<RuleSpec>, clock: Arc<dyn Clock>) -> Result<Engine, ConfigError> {
    let mut rules = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
        let rule = spec.into_rule().map_err(|err| match err {
            ConfigError::Rule { source, .. } => ConfigError::Rule {
                owner: owner.to_string(),
                index,
                source,
            },
            other => other,
        })?;
        rules.push(rule);
    }
    Ok(Engine::new(rules, clock))
}

/// The adapter kind an endpoint fronts (spec 3 "Endpoint / Conclave
/// configuration"). A closed tagged sum, matched exhaustively at every
/// forwarding site (spec 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Http,
    Imap,
    Smtp,
    Conclave,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub credential_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEndpoint {
    #[serde(default = "default_http_adapter")]
    pub adapter: AdapterKind,
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    /// Named rule bundles; expansion into concrete rules is config-loader
    /// territory out of scope per spec 1 and is left to the caller.
    #[serde(default)]
    pub capabilities: HashMap<String, Action>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub agents: Option<Vec<String>>,
    #[serde(default)]
    pub body_capture: bool,
    #[serde(default)]
    pub imap: Option<serde_yaml::Value>,
    #[serde(default)]
    pub smtp: Option<serde_yaml::Value>,
}

fn default_http_adapter() -> AdapterKind {
    AdapterKind::Http
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConclave {
    pub key_env: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub agents: Option<Vec<String>>,
    #[serde(default)]
    pub allow_redirects: bool,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub commands: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub listen: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub admin_key_env: Option<String>,
    #[serde(default)]
    pub approval_timeout: Option<String>,
    #[serde(default)]
    pub history_limit: Option<usize>,
    #[serde(default)]
    pub audit_capacity: Option<usize>,
    /// Path to the grant store's persisted JSON array (spec 6 "Persisted
    /// state layout"). `None` keeps grants in-memory only.
    #[serde(default)]
    pub grants_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSpec {
    pub url_env: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifySpec {
    #[serde(default)]
    pub slack: Option<WebhookSpec>,
    #[serde(default)]
    pub webhook: Option<WebhookSpec>,
    #[serde(default)]
    pub timeout: Option<String>,
}

/// The full YAML document (spec 6 "Configuration").
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub server: ServerSpec,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub endpoints: HashMap<String, RawEndpoint>,
    #[serde(default)]
    pub conclaves: HashMap<String, RawConclave>,
    #[serde(default)]
    pub notify: NotifySpec,
}

impl RawConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }
}

/// A materialized endpoint: immutable rule engine plus everything the
/// pipeline needs to reach the upstream and inject its credential.
pub struct Endpoint {
    pub name: String,
    pub adapter: AdapterKind,
    pub upstream: Option<String>,
    pub auth: Option<AuthSpec>,
    pub engine: Engine,
    pub allowed_agents: Option<Vec<String>>,
    pub body_capture: bool,
}

impl Endpoint {
    pub fn allows_agent(&self, agent_id: &str) -> bool {
        self.allowed_agents
            .as_ref()
            .is_none_or(|allow| allow.iter().any(|a| a == agent_id))
    }
}

/// A materialized conclave (spec 3 "Endpoint / Conclave configuration").
pub struct Conclave {
    pub name: String,
    pub key_env: String,
    pub cwd: Option<String>,
    pub allowed_agents: Option<Vec<String>>,
    pub allow_redirects: bool,
    pub engine: Engine,
}

impl Conclave {
    pub fn allows_agent(&self, agent_id: &str) -> bool {
        self.allowed_agents
            .as_ref()
            .is_none_or(|allow| allow.iter().any(|a| a == agent_id))
    }
}

/// The full, materialized gateway configuration. Immutable after load
/// (spec 3: "Endpoint / Conclave configuration ... Immutable after load").
pub struct GatewayConfig {
    pub listen: String,
    pub base_url: String,
    pub admin_key_env: Option<String>,
    pub approval_timeout: Duration,
    pub history_limit: usize,
    pub audit_capacity: usize,
    pub grants_file: Option<String>,
    pub agents: HashMap<String, AgentSpec>,
    pub endpoints: HashMap<String, Endpoint>,
    pub conclaves: HashMap<String, Conclave>,
    pub notify: NotifySpec,
}

impl GatewayConfig {
    pub fn from_raw(raw: RawConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let approval_timeout = raw
            .server
            .approval_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .unwrap_or(Duration::from_secs(300));

        let mut endpoints = HashMap::new();
        for (name, raw_ep) in raw.endpoints {
            let engine = rules_into_engine(&name, raw_ep.rules, clock.clone())?;
            endpoints.insert(
                name.clone(),
                Endpoint {
                    name,
                    adapter: raw_ep.adapter,
                    upstream: raw_ep.upstream,
                    auth: raw_ep.auth,
                    engine,
                    allowed_agents: raw_ep.agents,
                    body_capture: raw_ep.body_capture,
                },
            );
        }

        let mut conclaves = HashMap::new();
        for (name, raw_c) in raw.conclaves {
            let engine = rules_into_engine(&name, raw_c.rules, clock.clone())?;
            conclaves.insert(
                name.clone(),
                Conclave {
                    name,
                    key_env: raw_c.key_env,
                    cwd: raw_c.cwd,
                    allowed_agents: raw_c.agents,
                    allow_redirects: raw_c.allow_redirects,
                    engine,
                },
            );
        }

        let agents = raw
            .agents
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();

        Ok(Self {
            listen: raw.server.listen,
            base_url: raw.server.base_url.unwrap_or_else(|| "http://localhost:8080".to_string()),
            admin_key_env: raw.server.admin_key_env,
            approval_timeout,
            history_limit: raw.server.history_limit.unwrap_or(500),
            audit_capacity: raw.server.audit_capacity.unwrap_or(10_000),
            grants_file: raw.server.grants_file,
            agents,
            endpoints,
            conclaves,
            notify: raw.notify,
        })
    }

    pub fn from_yaml_str(s: &str, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Self::from_raw(RawConfig::from_yaml_str(s)?, clock)
    }
}
