//! Upstream adapter and credential-source interfaces (SPEC_FULL.md 6).
//!
//! Per-protocol adapter bodies are external collaborators per spec 1
//! ("per-protocol adapter bodies (IMAP message fetch/move, SMTP MIME
//! assembly, HTTP reverse-proxying) ... out of scope"); this module owns
//! only the trait boundary, plus the one adapter body simple enough to be
//! in-scope plumbing (`HttpAdapter`).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("upstream unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("adapter not implemented")]
    NotImplemented,
    #[error("no upstream configured")]
    NoUpstream,
}

/// A normalized outbound request, already policy-approved.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: String,
    /// Path relative to the endpoint's upstream base, after the
    /// `/<endpoint_name>` prefix has been stripped.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Per spec 1, protocol adapters are an external collaborator with a
/// specified interface only.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    async fn forward(&self, upstream: &str, req: ForwardRequest) -> Result<ForwardResponse, AdapterError>;
}

/// HTTP reverse-proxying: the one adapter body simple enough to be
/// genuinely in-scope plumbing (SPEC_FULL.md 6).
pub struct HttpAdapter {
    client: reqwest::Client,
}

impl Default for HttpAdapter {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl UpstreamAdapter for HttpAdapter {
    async fn forward(&self, upstream: &str, req: ForwardRequest) -> Result<ForwardResponse, AdapterError> {
        let url = format!("{}/{}", upstream.trim_end_matches('/'), req.path.trim_start_matches('/'));
        let method = reqwest::Method::from_bytes(req.method.as_bytes()).unwrap_or(reqwest::Method::GET);
        let mut builder = self.client.request(method, url).body(req.body);
        for (k, v) in &req.headers {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp.bytes().await?;
        Ok(ForwardResponse { status, headers, body })
    }
}

/// Stub: IMAP message fetch/move is an out-of-scope adapter body (spec 1).
/// Present so `AdapterKind` is matched exhaustively without pretending
/// IMAP wire handling is implemented.
#[derive(Default)]
pub struct ImapAdapter;

#[async_trait]
impl UpstreamAdapter for ImapAdapter {
    async fn forward(&self, _upstream: &str, _req: ForwardRequest) -> Result<ForwardResponse, AdapterError> {
        Err(AdapterError::NotImplemented)
    }
}

/// Stub: SMTP MIME assembly is an out-of-scope adapter body (spec 1).
#[derive(Default)]
pub struct SmtpAdapter;

#[async_trait]
impl UpstreamAdapter for SmtpAdapter {
    async fn forward(&self, _upstream: &str, _req: ForwardRequest) -> Result<ForwardResponse, AdapterError> {
        Err(AdapterError::NotImplemented)
    }
}

/// Credential vault interface (spec 1: "credential vault (env-var
/// lookup)" is an external collaborator).
pub trait CredentialSource: Send + Sync {
    fn resolve(&self, credential_ref: &str) -> Option<String>;
}

/// Reads credentials from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialSource;

impl CredentialSource for EnvCredentialSource {
    fn resolve(&self, credential_ref: &str) -> Option<String> {
        std::env::var(credential_ref).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCredentialSource(HashMap<String, String>);

    impl CredentialSource for FixedCredentialSource {
        fn resolve(&self, credential_ref: &str) -> Option<String> {
            self.0.get(credential_ref).cloned()
        }
    }

    #[test]
    fn resolves_known_credential() {
        let mut m = HashMap::new();
        m.insert("TODOIST_TOKEN".to_string(), "secret123".to_string());
        let source = FixedCredentialSource(m);
        assert_eq!(source.resolve("TODOIST_TOKEN"), Some("secret123".to_string()));
        assert_eq!(source.resolve("MISSING"), None);
    }

    #[tokio::test]
    async fn imap_and_smtp_adapters_are_not_implemented() {
        let req = ForwardRequest {
            method: "GET".to_string(),
            path: "inbox".to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
        };
        let err = ImapAdapter.forward("imap://x", req.clone()).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotImplemented));
        let err = SmtpAdapter.forward("smtp://x", req).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotImplemented));
    }
}
