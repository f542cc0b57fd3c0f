use tokio::sync::watch;

/// Broadcasts process shutdown to every long-lived task (conclave hub
/// heartbeats, approval timeout loops, the admin/agent HTTP servers).
/// A thin wrapper over `watch` rather than a cancellation-token crate --
/// every suspension point in the spec is already phrased as "select over
/// {result, timer, signal}", which a `watch<bool>` handles directly.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownWatcher {
    rx: watch::Receiver<bool>,
}

pub fn new() -> (ShutdownTrigger, ShutdownWatcher) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownWatcher { rx })
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownWatcher {
    /// Resolves once shutdown has been triggered. Safe to call from many
    /// tasks concurrently and to `select!` against.
    pub async fn signaled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Trigger was dropped; treat as shutdown.
                return;
            }
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signals_all_watchers() {
        let (trigger, mut a) = new();
        let mut b = a.clone();
        assert!(!a.is_signaled());
        trigger.shutdown();
        a.signaled().await;
        b.signaled().await;
        assert!(a.is_signaled());
        assert!(b.is_signaled());
    }
}
