//! Notifier fan-out (spec 4.5 contract, SPEC_FULL.md 4.9).
//!
//! Notifier wire formats (Slack Block Kit, generic webhook bodies) are
//! out of scope per spec 1; this module owns the dispatch contract only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// A fully-formed approval notification, ready for any channel to render.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub request_id: String,
    pub approve_url: String,
    pub deny_url: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub agent_id: String,
    pub summary: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, msg: &Notification) -> anyhow::Result<()>;
    fn kind(&self) -> &'static str;
}

/// POSTs the notification as JSON to a configured webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, msg: &Notification) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(msg)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "webhook"
    }
}

/// Posts a minimal text payload to a Slack-compatible incoming webhook.
/// Full Block Kit formatting is the out-of-scope wire format (spec 1).
pub struct SlackNotifier {
    client: reqwest::Client,
    url: String,
}

impl SlackNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, msg: &Notification) -> anyhow::Result<()> {
        let text = format!(
            "{}\napprove: {}\ndeny: {}",
            msg.summary, msg.approve_url, msg.deny_url
        );
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "slack"
    }
}

/// Discards every notification. Used by tests and by deployments with no
/// configured channels.
#[derive(Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _msg: &Notification) -> anyhow::Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "noop"
    }
}

/// Fans a notification out to every configured channel in parallel,
/// without waiting for completion (spec 4.5, 5).
#[derive(Clone, Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn notify_all(&self, msg: Notification) {
        let msg = Arc::new(msg);
        for notifier in &self.notifiers {
            let notifier = notifier.clone();
            let msg = msg.clone();
            tokio::spawn(async move {
                if let Err(err) = notifier.send(&msg).await {
                    tracing::warn!(
                        kind = notifier.kind(),
                        request_id = %msg.request_id,
                        error = %err,
                        "notifier failed"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier(Arc<AtomicUsize>);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send(&self, _msg: &Notification) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "counting"
        }
    }

    fn notification() -> Notification {
        Notification {
            request_id: "abc".to_string(),
            approve_url: "http://x/approve".to_string(),
            deny_url: "http://x/deny".to_string(),
            endpoint: "todoist".to_string(),
            method: "POST".to_string(),
            path: "tasks".to_string(),
            agent_id: "tessa".to_string(),
            summary: "Agent tessa wants to POST tasks on todoist".to_string(),
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_notifier() {
        let count = Arc::new(AtomicUsize::new(0));
        let set = NotifierSet::new(vec![
            Arc::new(CountingNotifier(count.clone())),
            Arc::new(CountingNotifier(count.clone())),
            Arc::new(NoopNotifier),
        ]);
        set.notify_all(notification());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
