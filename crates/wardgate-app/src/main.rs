//! `wardgate` binary: CLI flags, config loading, logging init, and server
//! startup/shutdown wiring (SPEC_FULL.md 1 "wardgate-app ... Mirrors
//! `crates/agentgateway-app`"). Everything here is assembly -- the actual
//! subsystems live in the `wardgate` library.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use wardgate::{
    adapter::{EnvCredentialSource, HttpAdapter, ImapAdapter, SmtpAdapter, UpstreamAdapter},
    notify::{Notifier, NotifierSet, SlackNotifier, WebhookNotifier},
    parse_duration, AdapterKind, ApprovalManager, AuditStore, GatewayConfig, GrantStore, Hub,
};
use wardgate_core::{signal, SystemClock};

/// Exit codes (spec 6): 0 success, nonzero for config errors, 2 for bad
/// flags (clap's own default when argument parsing fails).
const EXIT_CONFIG_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "wardgate", version, about = "Trust-boundary gateway for autonomous agents")]
struct Cli {
    /// Path to the YAML gateway configuration.
    #[arg(short, long, default_value = "wardgate.yaml")]
    config: std::path::PathBuf,

    /// Emit structured JSON log lines instead of human-readable ones.
    #[arg(long)]
    log_json: bool,

    /// Override `server.listen` from the config file.
    #[arg(long)]
    listen: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    wardgate_core::telemetry::init(cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        tracing::error!(error = ?err, "wardgate exited with an error");
        eprintln!("error: {err:#}");
        std::process::exit(EXIT_CONFIG_ERROR);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let yaml = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;

    let clock = Arc::new(SystemClock);
    let mut config = GatewayConfig::from_yaml_str(&yaml, clock.clone())
        .with_context(|| format!("parsing config file {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let agent_keys = resolve_agent_keys(&config)?;
    let admin_key = config
        .admin_key_env
        .as_deref()
        .map(|env| resolve_env(env, "server.admin_key_env"))
        .transpose()?;

    let grants = match &config.grants_file {
        Some(path) => GrantStore::load_from_file(path, clock.clone())
            .with_context(|| format!("loading grants file {path}"))?,
        None => GrantStore::new(clock.clone()),
    };

    let notifiers = build_notifiers(&config)?;
    let approvals = Arc::new(ApprovalManager::new(
        config.base_url.clone(),
        config.approval_timeout,
        config.history_limit,
        notifiers,
        clock.clone(),
    ));

    let audit = Arc::new(AuditStore::new(config.audit_capacity, clock.clone()));

    let conclave_secrets = resolve_conclave_secrets(&config)?;
    let hub = Arc::new(Hub::new(conclave_secrets, clock.clone()));

    let mut adapters: HashMap<AdapterKind, Arc<dyn UpstreamAdapter>> = HashMap::new();
    adapters.insert(AdapterKind::Http, Arc::new(HttpAdapter::default()));
    adapters.insert(AdapterKind::Imap, Arc::new(ImapAdapter));
    adapters.insert(AdapterKind::Smtp, Arc::new(SmtpAdapter));

    let (shutdown_trigger, shutdown_watcher) = signal::new();
    let listen = config.listen.clone();

    let state: wardgate::AppState = Arc::new(wardgate::AppStateInner {
        config,
        grants,
        approvals: Some(approvals),
        audit,
        hub,
        adapters,
        credentials: Arc::new(EnvCredentialSource),
        agent_keys,
        admin_key,
        clock,
        shutdown: shutdown_watcher,
    });

    let router = wardgate::router(state);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding listen address {listen}"))?;
    tracing::info!(%listen, "wardgate listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal(shutdown_trigger))
        .await
        .context("server loop failed")?;

    Ok(())
}

/// Resolves `agents: [{id, key_env}]` into a bearer-token -> agent-id
/// lookup table (spec 6: "agents: [{id, key_env}]"; spec 4.7: agent auth
/// matches `Authorization: Bearer ...` against this table).
fn resolve_agent_keys(config: &GatewayConfig) -> anyhow::Result<HashMap<String, String>> {
    let mut keys = HashMap::with_capacity(config.agents.len());
    for agent in config.agents.values() {
        let key = resolve_env(&agent.key_env, &format!("agents[{}].key_env", agent.id))?;
        keys.insert(key, agent.id.clone());
    }
    Ok(keys)
}

/// Resolves each conclave's `key_env` into a shared-secret -> name table
/// for [`Hub::authenticate`] (spec 4.6).
fn resolve_conclave_secrets(config: &GatewayConfig) -> anyhow::Result<HashMap<String, String>> {
    let mut secrets = HashMap::with_capacity(config.conclaves.len());
    for conclave in config.conclaves.values() {
        let secret = resolve_env(&conclave.key_env, &format!("conclaves.{}.key_env", conclave.name))?;
        secrets.insert(secret, conclave.name.clone());
    }
    Ok(secrets)
}

fn resolve_env(var: &str, owner: &str) -> anyhow::Result<String> {
    std::env::var(var).with_context(|| format!("{owner} references unset environment variable {var}"))
}

/// Builds the notifier fan-out set from `notify.{slack,webhook}` (spec 6,
/// 4.5). Notifier wire formats are implemented by [`wardgate::notify`];
/// this is just config -> concrete-channel wiring.
fn build_notifiers(config: &GatewayConfig) -> anyhow::Result<NotifierSet> {
    let timeout = config
        .notify
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| anyhow::anyhow!("notify.timeout: {e}"))?
        .unwrap_or(Duration::from_secs(10));

    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if let Some(slack) = &config.notify.slack {
        let url = resolve_env(&slack.url_env, "notify.slack.url_env")?;
        if url.is_empty() {
            bail!("notify.slack.url_env resolved to an empty webhook URL");
        }
        notifiers.push(Arc::new(SlackNotifier::new(url, timeout)));
    }
    if let Some(webhook) = &config.notify.webhook {
        let url = resolve_env(&webhook.url_env, "notify.webhook.url_env")?;
        if url.is_empty() {
            bail!("notify.webhook.url_env resolved to an empty webhook URL");
        }
        notifiers.push(Arc::new(WebhookNotifier::new(url, timeout)));
    }
    Ok(NotifierSet::new(notifiers))
}

/// Resolves once either signal arrives, then flips the shared watch so
/// every long-lived task (approval waits, conclave exec ceilings, the
/// hub's heartbeat loop) unwinds before the process exits.
async fn wait_for_shutdown_signal(trigger: signal::ShutdownTrigger) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            std::future::pending::<()>().await;
            return;
        };
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
    trigger.shutdown();
}
