//! Worker relay: the back-channel that turns worker-initiated sockets into
//! addressable inference endpoints.
//!
//! A worker behind NAT opens a WebSocket to the gateway, authenticates with
//! a signed frame, and from then on the gateway can dispatch requests to it
//! by wallet address. The relay owns two maps: address to connection and
//! request id to pending completion. Either the worker's reply resolves a
//! pending, or its disconnect does, never both.

pub mod auth;
pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::RelayError;
use crate::relay::auth::verify_auth;
use crate::relay::protocol::{
    GatewayFrame, RelayUsage, WorkerFrame, CLOSE_AUTH_TIMEOUT, CLOSE_EXPECTED_AUTH, CLOSE_REPLACED,
};
use crate::types::{ChatMessage, CompletionRequest};

/// Well-known path workers connect to.
pub const RELAY_PATH: &str = "/ws/agent-relay";

/// An authenticated back-channel session, as exposed to the selector and
/// the status API.
#[derive(Debug, Clone)]
pub struct ConnectedWorker {
    pub address: String,
    pub model: String,
    pub connected_at: DateTime<Utc>,
}

/// A worker's unary reply.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub content: String,
}

/// Events on a relayed stream.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(String),
    Done(Option<RelayUsage>),
    Failed(RelayError),
}

enum Outbound {
    Frame(GatewayFrame),
    Ping,
    Close { code: u16, reason: &'static str },
}

#[derive(Clone)]
struct WorkerHandle {
    info: ConnectedWorker,
    conn_id: Uuid,
    tx: mpsc::Sender<Outbound>,
}

enum Pending {
    Unary {
        address: String,
        tx: oneshot::Sender<Result<RelayResponse, RelayError>>,
    },
    Stream {
        address: String,
        tx: mpsc::Sender<StreamEvent>,
        /// Bumped on every chunk; the watchdog watches this for inactivity.
        activity: watch::Sender<Instant>,
    },
}

impl Pending {
    fn address(&self) -> &str {
        match self {
            Pending::Unary { address, .. } | Pending::Stream { address, .. } => address,
        }
    }

    async fn fail(self, err: RelayError) {
        match self {
            Pending::Unary { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Pending::Stream { tx, .. } => {
                let _ = tx.send(StreamEvent::Failed(err)).await;
            }
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

/// The worker relay service.
pub struct WorkerRelay {
    connections: Mutex<HashMap<String, WorkerHandle>>,
    pending: PendingMap,
    attempt_timeout: Duration,
    stream_inactivity: Duration,
    auth_deadline: Duration,
    shutting_down: AtomicBool,
}

impl WorkerRelay {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            attempt_timeout: timeouts.attempt,
            stream_inactivity: timeouts.stream_inactivity,
            auth_deadline: timeouts.auth_handshake,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub async fn connected_workers(&self) -> Vec<ConnectedWorker> {
        self.connections
            .lock()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    pub async fn worker_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_connected(&self, address: &str) -> bool {
        self.connections
            .lock()
            .await
            .contains_key(&address.to_lowercase())
    }

    // ---- Dispatch ----

    /// Send a unary request to the worker for `address` and wait for its
    /// reply, bounded by the attempt timeout.
    pub async fn send_request(
        &self,
        address: &str,
        request: &CompletionRequest,
    ) -> Result<RelayResponse, RelayError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown);
        }
        let handle = self.handle_for(address).await?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id.clone(),
            Pending::Unary {
                address: handle.info.address.clone(),
                tx,
            },
        );

        if let Err(e) = handle
            .tx
            .send(Outbound::Frame(request_frame(&id, request, false)))
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(RelayError::Send {
                address: handle.info.address,
                reason: e.to_string(),
            });
        }

        match tokio::time::timeout(self.attempt_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolving; treat as disconnect.
            Ok(Err(_)) => Err(RelayError::Disconnected {
                address: handle.info.address,
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RelayError::Timeout {
                    seconds: self.attempt_timeout.as_secs(),
                })
            }
        }
    }

    /// Start a streaming request to the worker for `address`. Chunks arrive
    /// on the returned receiver in worker order; the pending carries an
    /// inactivity watchdog reset on every chunk.
    pub async fn send_stream_request(
        &self,
        address: &str,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RelayError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown);
        }
        let handle = self.handle_for(address).await?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(64);
        let (activity, activity_rx) = watch::channel(Instant::now());
        self.pending.lock().await.insert(
            id.clone(),
            Pending::Stream {
                address: handle.info.address.clone(),
                tx,
                activity,
            },
        );

        if let Err(e) = handle
            .tx
            .send(Outbound::Frame(request_frame(&id, request, true)))
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(RelayError::Send {
                address: handle.info.address,
                reason: e.to_string(),
            });
        }

        spawn_stream_watchdog(
            Arc::clone(&self.pending),
            id,
            activity_rx,
            self.stream_inactivity,
        );
        Ok(rx)
    }

    async fn handle_for(&self, address: &str) -> Result<WorkerHandle, RelayError> {
        self.connections
            .lock()
            .await
            .get(&address.to_lowercase())
            .cloned()
            .ok_or_else(|| RelayError::NotConnected {
                address: address.to_lowercase(),
            })
    }

    // ---- Pending resolution ----

    async fn take_pending(&self, id: &str) -> Option<Pending> {
        self.pending.lock().await.remove(id)
    }

    async fn resolve_unary(&self, id: &str, response: RelayResponse) {
        match self.take_pending(id).await {
            Some(Pending::Unary { tx, .. }) => {
                let _ = tx.send(Ok(response));
            }
            Some(pending) => {
                pending
                    .fail(RelayError::Worker {
                        message: "worker sent a unary response to a stream request".to_string(),
                    })
                    .await;
            }
            None => tracing::debug!(id = %id, "Response for unknown request id"),
        }
    }

    async fn stream_chunk(&self, id: &str, content: String) {
        let tx = {
            let pending = self.pending.lock().await;
            match pending.get(id) {
                Some(Pending::Stream { tx, activity, .. }) => {
                    let _ = activity.send(Instant::now());
                    tx.clone()
                }
                Some(_) => {
                    tracing::debug!(id = %id, "Chunk for a unary request, dropping");
                    return;
                }
                None => return,
            }
        };
        // Consumer gone means the client went away: drop the pending so the
        // worker-side state is cleaned up too.
        if tx.send(StreamEvent::Chunk(content)).await.is_err() {
            self.take_pending(id).await;
        }
    }

    async fn stream_done(&self, id: &str, usage: Option<RelayUsage>) {
        match self.take_pending(id).await {
            Some(Pending::Stream { tx, .. }) => {
                let _ = tx.send(StreamEvent::Done(usage)).await;
            }
            Some(pending) => {
                pending
                    .fail(RelayError::Worker {
                        message: "worker sent done for a unary request".to_string(),
                    })
                    .await;
            }
            None => {}
        }
    }

    async fn fail_pending(&self, id: &str, err: RelayError) {
        if let Some(pending) = self.take_pending(id).await {
            pending.fail(err).await;
        }
    }

    /// Fail every pending attributed to `address`. Runs under the pending
    /// lock's removal so a concurrent reply cannot complete the same entry.
    async fn fail_pending_for_address(&self, address: &str, make_err: impl Fn() -> RelayError) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.address() == address)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in drained {
            entry.fail(make_err()).await;
        }
    }

    // ---- Connection lifecycle ----

    /// Register an authenticated connection, replacing (and failing the
    /// pendings of) any prior connection for the same address.
    async fn register(&self, handle: WorkerHandle) {
        let address = handle.info.address.clone();
        let previous = {
            let mut connections = self.connections.lock().await;
            connections.insert(address.clone(), handle)
        };
        if let Some(previous) = previous {
            tracing::info!(address = %address, "Replacing existing worker connection");
            let _ = previous
                .tx
                .send(Outbound::Close {
                    code: CLOSE_REPLACED,
                    reason: "replaced by a new connection",
                })
                .await;
            self.fail_pending_for_address(&address, || RelayError::Disconnected {
                address: address.clone(),
            })
            .await;
        } else {
            tracing::info!(address = %address, "Worker connected");
        }
    }

    /// Drop a connection if it is still the registered one, failing all of
    /// its pendings. A replaced connection's cleanup is a no-op here.
    async fn deregister(&self, address: &str, conn_id: Uuid) {
        let removed = {
            let mut connections = self.connections.lock().await;
            match connections.get(address) {
                Some(current) if current.conn_id == conn_id => {
                    connections.remove(address);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::info!(address = %address, "Worker disconnected");
            self.fail_pending_for_address(address, || RelayError::Disconnected {
                address: address.to_string(),
            })
            .await;
        }
    }

    /// Ping every worker on an interval; drop those whose channel is gone.
    pub async fn run_ping_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let handles: Vec<WorkerHandle> = {
                        self.connections.lock().await.values().cloned().collect()
                    };
                    for handle in handles {
                        if handle.tx.send(Outbound::Ping).await.is_err() {
                            tracing::warn!(
                                address = %handle.info.address,
                                "Worker unresponsive to ping, dropping"
                            );
                            self.deregister(&handle.info.address, handle.conn_id).await;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Fail every pending with the shutdown error and close every socket.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, p)| p).collect()
        };
        for entry in drained {
            entry.fail(RelayError::Shutdown).await;
        }

        let handles: Vec<WorkerHandle> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle
                .tx
                .send(Outbound::Close {
                    code: 1001,
                    reason: "gateway shutting down",
                })
                .await;
        }
    }

    /// Register a fake worker without a socket, for selector/router tests.
    #[cfg(test)]
    pub(crate) async fn register_for_test(&self, address: &str, model: &str) {
        let (tx, _rx) = mpsc::channel(8);
        self.register(WorkerHandle {
            info: ConnectedWorker {
                address: address.to_lowercase(),
                model: model.to_string(),
                connected_at: Utc::now(),
            },
            conn_id: Uuid::new_v4(),
            tx,
        })
        .await;
    }

    // ---- Socket handling ----

    /// Drive one worker socket: auth handshake, then the frame loop.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket) {
        let auth = match tokio::time::timeout(self.auth_deadline, socket.recv()).await {
            Err(_) => {
                close_socket(socket, CLOSE_AUTH_TIMEOUT, "auth timeout").await;
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(msg))) => msg,
        };

        let frame = match &auth {
            Message::Text(raw) => serde_json::from_str::<WorkerFrame>(raw).ok(),
            _ => None,
        };
        let (address, model, timestamp, signature) = match frame {
            Some(WorkerFrame::Auth {
                address,
                model,
                timestamp,
                signature,
            }) => (address, model, timestamp, signature),
            _ => {
                close_socket(socket, CLOSE_EXPECTED_AUTH, "expected auth frame").await;
                return;
            }
        };

        let verified = verify_auth(
            address.as_deref(),
            model.as_deref(),
            timestamp,
            signature.as_deref(),
            Utc::now().timestamp_millis(),
        );
        let (address, model) = match verified {
            Ok(ok) => ok,
            Err(rejection) => {
                tracing::warn!("Worker auth rejected: {}", rejection.message());
                let frame = GatewayFrame::AuthError {
                    message: rejection.message().to_string(),
                };
                if let Ok(raw) = serde_json::to_string(&frame) {
                    let _ = socket.send(Message::Text(raw.into())).await;
                }
                close_socket(socket, rejection.close_code(), rejection.message()).await;
                return;
            }
        };

        // Register before confirming, so a dispatch racing the handshake
        // finds the connection.
        let conn_id = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(32);
        self.register(WorkerHandle {
            info: ConnectedWorker {
                address: address.clone(),
                model,
                connected_at: Utc::now(),
            },
            conn_id,
            tx: out_tx.clone(),
        })
        .await;

        if let Ok(raw) = serde_json::to_string(&GatewayFrame::AuthOk) {
            if socket.send(Message::Text(raw.into())).await.is_err() {
                self.deregister(&address, conn_id).await;
                return;
            }
        }

        let (mut ws_tx, mut ws_rx) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let sent = match out {
                    Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                        Ok(raw) => ws_tx.send(Message::Text(raw.into())).await,
                        Err(_) => continue,
                    },
                    Outbound::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
                    Outbound::Close { code, reason } => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                };
                if sent.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(raw) => self.handle_worker_frame(&address, &out_tx, &raw).await,
                Message::Close(_) => break,
                // Ping/Pong control frames are handled by the transport.
                _ => {}
            }
        }

        writer.abort();
        self.deregister(&address, conn_id).await;
    }

    async fn handle_worker_frame(&self, address: &str, out_tx: &mpsc::Sender<Outbound>, raw: &str) {
        let frame = match serde_json::from_str::<WorkerFrame>(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(address = %address, "Unparseable worker frame: {e}");
                return;
            }
        };
        match frame {
            WorkerFrame::Response { id, choices } => {
                let content = choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                self.resolve_unary(&id, RelayResponse { content }).await;
            }
            WorkerFrame::Chunk { id, content } => self.stream_chunk(&id, content).await,
            WorkerFrame::Done { id, usage } => self.stream_done(&id, usage).await,
            WorkerFrame::Error { id, message } => {
                self.fail_pending(&id, RelayError::Worker { message }).await;
            }
            WorkerFrame::Ping => {
                let _ = out_tx.send(Outbound::Frame(GatewayFrame::Pong)).await;
            }
            WorkerFrame::Auth { .. } => {
                tracing::debug!(address = %address, "Duplicate auth frame ignored");
            }
            WorkerFrame::Unknown => {
                tracing::debug!(address = %address, "Unknown worker frame type ignored");
            }
        }
    }
}

/// Axum handler for the relay endpoint.
pub async fn ws_handler(
    State(relay): State<Arc<WorkerRelay>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay.handle_socket(socket))
}

fn request_frame(id: &str, request: &CompletionRequest, stream: bool) -> GatewayFrame {
    let messages = if request.messages.is_empty() {
        match &request.prompt {
            Some(prompt) => vec![ChatMessage::new("user", prompt.clone())],
            None => Vec::new(),
        }
    } else {
        request.messages.clone()
    };
    GatewayFrame::Request {
        id: id.to_string(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream,
    }
}

/// Watch a stream pending for inactivity. The pending's activity sender is
/// bumped on each chunk; once the pending resolves and the sender drops,
/// the watchdog exits.
fn spawn_stream_watchdog(
    pending: PendingMap,
    id: String,
    mut activity: watch::Receiver<Instant>,
    inactivity: Duration,
) {
    tokio::spawn(async move {
        loop {
            let last = *activity.borrow();
            tokio::select! {
                _ = tokio::time::sleep_until(last + inactivity) => {
                    if *activity.borrow() == last {
                        if let Some(entry) = pending.lock().await.remove(&id) {
                            entry
                                .fail(RelayError::Timeout { seconds: inactivity.as_secs() })
                                .await;
                        }
                        break;
                    }
                }
                changed = activity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::auth::{canonical_message, personal_sign_digest};
    use crate::relay::protocol::CLOSE_INVALID_SIGNATURE;
    use axum::routing::any;
    use axum::Router;
    use k256::ecdsa::SigningKey;
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use sha3::{Digest, Keccak256};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_relay() -> Arc<WorkerRelay> {
        let mut timeouts = TimeoutConfig::default();
        timeouts.attempt = Duration::from_secs(5);
        timeouts.stream_inactivity = Duration::from_secs(5);
        timeouts.auth_handshake = Duration::from_secs(2);
        Arc::new(WorkerRelay::new(&timeouts))
    }

    async fn spawn_relay_server(relay: Arc<WorkerRelay>) -> String {
        let router = Router::new()
            .route(RELAY_PATH, any(ws_handler))
            .with_state(relay);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("ws://{addr}{RELAY_PATH}")
    }

    fn worker_key() -> (SigningKey, String) {
        let key = SigningKey::random(&mut rand::thread_rng());
        let point = key.verifying_key().to_encoded_point(false);
        let mut hasher = Keccak256::new();
        hasher.update(&point.as_bytes()[1..]);
        let hash = hasher.finalize();
        let address = format!("0x{}", hex::encode(&hash[12..]));
        (key, address)
    }

    fn auth_frame(key: &SigningKey, address: &str, model: &str) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let digest = personal_sign_digest(&canonical_message(address, model, timestamp));
        let (sig, recovery) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut bytes = sig.to_bytes().to_vec();
        bytes.push(recovery.to_byte() + 27);
        serde_json::json!({
            "type": "auth",
            "address": address,
            "model": model,
            "timestamp": timestamp,
            "signature": format!("0x{}", hex::encode(bytes)),
        })
        .to_string()
    }

    /// Connect and authenticate a fake worker; panics unless `auth_ok`.
    async fn connect_worker(url: &str, key: &SigningKey, address: &str) -> WsClient {
        let (mut ws, _) = connect_async(url).await.unwrap();
        ws.send(WsMessage::text(auth_frame(key, address, "llama")))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let raw = reply.into_text().unwrap();
        assert!(raw.contains("auth_ok"), "expected auth_ok, got {raw}");
        ws
    }

    async fn next_text(ws: &mut WsClient) -> serde_json::Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(raw) => return serde_json::from_str(&raw).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_auth_and_registration() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;
        let (key, address) = worker_key();

        let _ws = connect_worker(&url, &key, &address).await;

        assert!(relay.is_connected(&address).await);
        let workers = relay.connected_workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].address, address.to_lowercase());
        assert_eq!(workers[0].model, "llama");
    }

    #[tokio::test]
    async fn test_rejects_bad_signature() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;
        let (key, _) = worker_key();
        let (_, other_address) = worker_key();

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(WsMessage::text(auth_frame(&key, &other_address, "llama")))
            .await
            .unwrap();

        // auth_error frame, then a close with the invalid-signature code.
        let reply = next_text(&mut ws).await;
        assert_eq!(reply["type"], "auth_error");
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), CLOSE_INVALID_SIGNATURE);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
        assert!(!relay.is_connected(&other_address).await);
    }

    #[tokio::test]
    async fn test_rejects_non_auth_first_frame() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(WsMessage::text(r#"{"type":"ping"}"#.to_string()))
            .await
            .unwrap();

        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), CLOSE_EXPECTED_AUTH);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;
        let (key, address) = worker_key();
        let mut ws = connect_worker(&url, &key, &address).await;

        let request = CompletionRequest {
            model: "llama".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            prompt: None,
            max_tokens: Some(16),
            temperature: None,
            top_p: None,
        };

        let relay_clone = relay.clone();
        let addr_clone = address.clone();
        let dispatch =
            tokio::spawn(
                async move { relay_clone.send_request(&addr_clone, &request).await },
            );

        let frame = next_text(&mut ws).await;
        assert_eq!(frame["type"], "request");
        assert_eq!(frame["stream"], false);
        let id = frame["id"].as_str().unwrap();

        ws.send(WsMessage::text(
            serde_json::json!({
                "type": "response",
                "id": id,
                "choices": [{"message": {"role": "assistant", "content": "hello back"}}],
            })
            .to_string(),
        ))
        .await
        .unwrap();

        let response = dispatch.await.unwrap().unwrap();
        assert_eq!(response.content, "hello back");
    }

    #[tokio::test]
    async fn test_stream_chunks_then_done() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;
        let (key, address) = worker_key();
        let mut ws = connect_worker(&url, &key, &address).await;

        let request = CompletionRequest {
            model: "llama".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            prompt: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        let mut rx = relay.send_stream_request(&address, &request).await.unwrap();

        let frame = next_text(&mut ws).await;
        assert_eq!(frame["type"], "request");
        assert_eq!(frame["stream"], true);
        let id = frame["id"].as_str().unwrap().to_string();

        for content in ["Hello ", "world"] {
            ws.send(WsMessage::text(
                serde_json::json!({"type": "chunk", "id": id, "content": content}).to_string(),
            ))
            .await
            .unwrap();
        }
        ws.send(WsMessage::text(
            serde_json::json!({"type": "done", "id": id, "usage": {"totalTokens": 2}}).to_string(),
        ))
        .await
        .unwrap();

        let mut collected = String::new();
        loop {
            match rx.recv().await.unwrap() {
                StreamEvent::Chunk(c) => collected.push_str(&c),
                StreamEvent::Done(usage) => {
                    assert_eq!(usage.unwrap().total_tokens, Some(2));
                    break;
                }
                StreamEvent::Failed(e) => panic!("stream failed: {e}"),
            }
        }
        assert_eq!(collected, "Hello world");
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_stream() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;
        let (key, address) = worker_key();
        let mut ws = connect_worker(&url, &key, &address).await;

        let request = CompletionRequest {
            model: "llama".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            prompt: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        let mut rx = relay.send_stream_request(&address, &request).await.unwrap();
        let _ = next_text(&mut ws).await;

        ws.close(None).await.unwrap();

        match rx.recv().await.unwrap() {
            StreamEvent::Failed(RelayError::Disconnected { address: a }) => {
                assert_eq!(a, address.to_lowercase());
            }
            other => panic!("expected disconnect failure, got {other:?}"),
        }
        assert!(!relay.is_connected(&address).await);
    }

    #[tokio::test]
    async fn test_new_connection_replaces_old() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;
        let (key, address) = worker_key();

        let mut first = connect_worker(&url, &key, &address).await;
        let _second = connect_worker(&url, &key, &address).await;

        loop {
            match first.next().await {
                Some(Ok(WsMessage::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), CLOSE_REPLACED);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected replacement close, got {other:?}"),
            }
        }
        assert_eq!(relay.worker_count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pendings() {
        let relay = test_relay();
        let url = spawn_relay_server(relay.clone()).await;
        let (key, address) = worker_key();
        let mut ws = connect_worker(&url, &key, &address).await;

        let request = CompletionRequest {
            model: "llama".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            prompt: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        let mut rx = relay.send_stream_request(&address, &request).await.unwrap();
        let _ = next_text(&mut ws).await;

        relay.shutdown().await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::Failed(RelayError::Shutdown)
        ));
        assert!(
            matches!(
                relay.send_request(&address, &request).await,
                Err(RelayError::Shutdown)
            ),
            "dispatch after shutdown must fail"
        );
    }
}
