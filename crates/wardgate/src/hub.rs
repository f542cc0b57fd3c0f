//! Conclave hub: WebSocket multiplexer for remote command executors
//! (spec 4.6).
//!
//! Each conclave holds exactly one live connection at a time, identified
//! by a shared secret bound to a name. The hub authenticates the upgrade,
//! runs a heartbeat to detect dead connections, and routes `exec`/`kill`
//! frames out and `stdout`/`stderr`/`exit`/`error` frames back to whichever
//! caller is waiting on that (conclave, request id) pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use wardgate_core::{version::BUILD, Clock};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_GRACE: Duration = Duration::from_secs(10);
/// Spec 4.6: "Per-request channels are bounded (default 64 frames)".
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("unknown conclave secret")]
    UnknownSecret,
    #[error("secret does not match claimed conclave name")]
    NameMismatch,
    #[error("conclave {0} already connected")]
    AlreadyConnected(String),
    #[error("conclave {0} is not connected")]
    NotConnected(String),
    #[error("failed to write frame: {0}")]
    Send(String),
}

/// Server -> client wire frames (spec 4.6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { version: String, name: String },
    Ping,
    Exec { request_id: String, command: String, args: Vec<String>, cwd: String },
    Kill { request_id: String },
}

/// Client -> server wire frames (spec 4.6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Pong,
    Stdout { request_id: String, data: String },
    Stderr { request_id: String, data: String },
    Exit { request_id: String, exit_code: i32, duration_ms: u64 },
    Error { request_id: String, message: String },
}

impl ClientFrame {
    fn request_id(&self) -> Option<&str> {
        match self {
            ClientFrame::Pong => None,
            ClientFrame::Stdout { request_id, .. }
            | ClientFrame::Stderr { request_id, .. }
            | ClientFrame::Exit { request_id, .. }
            | ClientFrame::Error { request_id, .. } => Some(request_id),
        }
    }
}

struct Connection {
    /// Outbound frames are serialized through this channel to the single
    /// writer task owning the socket's sink half (spec 5: "frames to one
    /// conclave are totally ordered by the per-connection write mutex" --
    /// a single-consumer channel gives the same guarantee without holding
    /// a lock across the actual socket write).
    outbound: mpsc::Sender<ServerFrame>,
    last_pong: Mutex<DateTime<Utc>>,
}

/// WebSocket multiplexer for remote command executors (spec 4.6).
pub struct Hub {
    /// secret -> bound conclave name.
    secrets: HashMap<String, String>,
    conns: RwLock<HashMap<String, Arc<Connection>>>,
    waiters: RwLock<HashMap<(String, String), mpsc::Sender<Value>>>,
    clock: Arc<dyn Clock>,
}

impl Hub {
    pub fn new(secrets: HashMap<String, String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            secrets,
            conns: RwLock::new(HashMap::new()),
            waiters: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// spec 4.6 "Authentication": binds the bearer secret to its
    /// registered name and checks the claimed `X-Conclave-Name` matches.
    pub fn authenticate(&self, secret: &str, claimed_name: &str) -> Result<String, HubError> {
        let name = self.secrets.get(secret).ok_or(HubError::UnknownSecret)?;
        if name != claimed_name {
            return Err(HubError::NameMismatch);
        }
        Ok(name.clone())
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.conns.read().contains_key(name)
    }

    pub fn connected_names(&self) -> Vec<String> {
        self.conns.read().keys().cloned().collect()
    }

    /// Runs the full lifecycle of one accepted upgrade: duplicate check,
    /// welcome frame, heartbeat, read loop, and routing. Returns once the
    /// socket closes or the heartbeat times out.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, name: String) -> Result<(), HubError> {
        {
            let mut conns = self.conns.write();
            if conns.contains_key(&name) {
                return Err(HubError::AlreadyConnected(name));
            }
            let (tx, rx) = mpsc::channel(256);
            conns.insert(
                name.clone(),
                Arc::new(Connection {
                    outbound: tx,
                    last_pong: Mutex::new(self.clock.now()),
                }),
            );
            drop(conns);
            self.run_connection(socket, name.clone(), rx).await;
        }
        self.disconnect(&name);
        Ok(())
    }

    async fn run_connection(
        &self,
        socket: WebSocket,
        name: String,
        mut outbound_rx: mpsc::Receiver<ServerFrame>,
    ) {
        use futures_util::{SinkExt, StreamExt};
        let (mut sink, mut stream) = socket.split();

        let welcome = ServerFrame::Welcome {
            version: BUILD.version.to_string(),
            name: name.clone(),
        };
        if send_frame(&mut sink, &welcome).await.is_err() {
            return;
        }

        let conn = self.conns.read().get(&name).cloned();
        let Some(conn) = conn else { return };

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    let last_pong = *conn.last_pong.lock();
                    let elapsed = (self.clock.now() - last_pong).to_std().unwrap_or(Duration::ZERO);
                    if elapsed > PING_INTERVAL + PONG_GRACE {
                        tracing::warn!(conclave = %name, "pong timeout, closing connection");
                        break;
                    }
                    if send_frame(&mut sink, &ServerFrame::Ping).await.is_err() {
                        break;
                    }
                }
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.route_client_frame(&name, &conn, &text.to_string()).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(conclave = %name, error = %err, "websocket read error");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn route_client_frame(&self, name: &str, conn: &Connection, text: &str) {
        let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
            tracing::warn!(conclave = %name, "received malformed frame");
            return;
        };
        if matches!(frame, ClientFrame::Pong) {
            *conn.last_pong.lock() = self.clock.now();
            return;
        }
        let Some(req_id) = frame.request_id() else { return };
        let key = (name.to_string(), req_id.to_string());
        let waiter = self.waiters.read().get(&key).cloned();
        let Some(waiter) = waiter else {
            // Unknown request id: dropped per spec 4.6.
            return;
        };
        let raw: Value = serde_json::from_str(text).unwrap_or(Value::Null);
        // A full per-request channel means the consumer isn't draining
        // promptly; spec 5 "Backpressure" wants that to stall this
        // conclave's entire read loop (ping included) rather than drop
        // frames, eventually tripping the pong timeout if it never drains.
        if waiter.send(raw).await.is_err() {
            tracing::warn!(conclave = %name, request_id = %req_id, "exec waiter channel closed");
        }
    }

    fn disconnect(&self, name: &str) {
        self.conns.write().remove(name);
        // Dropping the waiter senders (by removing their entries) closes
        // every in-flight exec's channel, surfacing a "disconnected"
        // error to its caller (spec 4.6 "Liveness").
        self.waiters.write().retain(|(conclave, _), _| conclave != name);
    }

    /// spec 4.6 `send_exec`: pre-registers a per-request channel, then
    /// writes the `exec` frame.
    pub async fn send_exec(
        &self,
        conclave: &str,
        request_id: &str,
        command: String,
        args: Vec<String>,
        cwd: String,
    ) -> Result<mpsc::Receiver<Value>, HubError> {
        let conn = self
            .conns
            .read()
            .get(conclave)
            .cloned()
            .ok_or_else(|| HubError::NotConnected(conclave.to_string()))?;

        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        self.waiters
            .write()
            .insert((conclave.to_string(), request_id.to_string()), tx);

        let frame = ServerFrame::Exec {
            request_id: request_id.to_string(),
            command,
            args,
            cwd,
        };
        conn.outbound
            .send(frame)
            .await
            .map_err(|e| HubError::Send(e.to_string()))?;
        Ok(rx)
    }

    /// spec 5 "Conclave exec ... on ceiling or cancellation, an explicit
    /// `kill` frame is sent to the conclave".
    pub async fn send_kill(&self, conclave: &str, request_id: &str) -> Result<(), HubError> {
        let conn = self
            .conns
            .read()
            .get(conclave)
            .cloned()
            .ok_or_else(|| HubError::NotConnected(conclave.to_string()))?;
        conn.outbound
            .send(ServerFrame::Kill { request_id: request_id.to_string() })
            .await
            .map_err(|e| HubError::Send(e.to_string()))
    }

    /// spec 4.6 `cleanup_exec`: must be called regardless of exit path
    /// (the caller is expected to use a deferred-release guard, e.g.
    /// [`ExecGuard`]).
    pub fn cleanup_exec(&self, conclave: &str, request_id: &str) {
        self.waiters
            .write()
            .remove(&(conclave.to_string(), request_id.to_string()));
    }
}

/// Enforces `cleanup_exec` "with a deferred release regardless of exit
/// path" (spec 4.6) the way Rust expresses a Go `defer`: via `Drop`.
pub struct ExecGuard {
    hub: Arc<Hub>,
    conclave: String,
    request_id: String,
}

impl ExecGuard {
    pub fn new(hub: Arc<Hub>, conclave: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            hub,
            conclave: conclave.into(),
            request_id: request_id.into(),
        }
    }
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        self.hub.cleanup_exec(&self.conclave, &self.request_id);
    }
}

async fn send_frame(
    sink: &mut (impl futures_util::Sink<WsMessage, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    use futures_util::SinkExt;
    let text = serde_json::to_string(frame).unwrap_or_default();
    sink.send(WsMessage::Text(text.into())).await
}
