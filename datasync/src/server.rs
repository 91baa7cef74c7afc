//! WebSocket sync server with key-scoped document routing.
//!
//! Architecture:
//! ```text
//!              upgrade (x-vulppi-client header, validation hook)
//! Client A ──┐
//!            ├── reader ─► worker ─► Provider::concurrency_set(key, ops)
//! Client B ──┘                │              │
//!                             │              ▼
//!                             │       KeyLocks (FIFO per key)
//!                             ▼
//!                    SubscriberRegistry ─► writer A / writer B / ...
//! ```
//!
//! Each connection runs three tasks:
//! - a reader that decodes frames, checks heartbeat pongs and hands
//!   commands to the worker,
//! - a worker that processes commands strictly in arrival order,
//! - a writer that drains the connection's outbound channel.
//!
//! The heartbeat loop pings every connection through its writer, so a
//! mutation waiting on a key lock never delays liveness checks.
//!
//! Reference: Kleppmann: Designing Data-Intensive Applications, Chapter 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use uuid::Uuid;

use crate::auth::{ValidationData, ValidationError, Validator};
use crate::broadcast::{Outgoing, PeerHandle, SubscriberRegistry};
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::protocol::{
    generate_id, Command, CommandMessage, DataKey, ProtocolError, UserContext, HEADER_KEY,
    HEADER_VALUE, SUBPROTOCOL,
};
use crate::provider::{Provider, SyncStorage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address used by [`SyncServer::run`]
    pub bind_addr: String,
    /// Time between heartbeat rounds
    pub heartbeat_interval: Duration,
    /// Bound on how long a mutation waits for its key lock
    pub lock_timeout: Duration,
    /// Frames buffered per connection before a slow peer starts dropping
    pub outbound_capacity: usize,
    /// Decoded commands buffered per connection ahead of the worker
    pub command_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3333".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            outbound_capacity: 256,
            command_capacity: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub mutations: u64,
    pub rejected_mutations: u64,
    pub broadcasts: u64,
    pub heartbeat_terminations: u64,
    pub active_keys: usize,
    pub subscriptions: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    mutations: AtomicU64,
    rejected_mutations: AtomicU64,
    broadcasts: AtomicU64,
    heartbeat_terminations: AtomicU64,
}

type ErrorListener = Arc<dyn Fn(&ServerError) + Send + Sync>;
type CloseListener = Arc<dyn Fn() + Send + Sync>;

struct ServerShared {
    config: ServerConfig,
    provider: StdRwLock<Arc<Provider>>,
    validator: StdRwLock<Option<Validator>>,
    heartbeat_ms: AtomicU64,
    heartbeat_started: AtomicBool,
    registry: SubscriberRegistry,
    /// Live connections, swept by the heartbeat.
    peers: RwLock<HashMap<Uuid, Arc<PeerHandle>>>,
    error_listeners: StdRwLock<Vec<ErrorListener>>,
    close_listeners: StdRwLock<Vec<CloseListener>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    stats: AtomicServerStats,
}

/// The sync server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<ServerShared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let provider = Provider::with_lock_timeout(
            Arc::new(crate::provider::MemoryStorage::new()),
            config.lock_timeout,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(ServerShared {
                heartbeat_ms: AtomicU64::new(duration_ms(config.heartbeat_interval)),
                config,
                provider: StdRwLock::new(Arc::new(provider)),
                validator: StdRwLock::new(None),
                heartbeat_started: AtomicBool::new(false),
                registry: SubscriberRegistry::new(),
                peers: RwLock::new(HashMap::new()),
                error_listeners: StdRwLock::new(Vec::new()),
                close_listeners: StdRwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                shutdown,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Server whose provider persists through `storage`.
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn SyncStorage>) -> Self {
        let server = Self::new(config);
        server.set_provider(Provider::with_lock_timeout(storage, server.shared.config.lock_timeout));
        server
    }

    /// Install the connection validation hook.
    pub fn set_validation(&self, validator: Validator) {
        *self.shared.validator.write().unwrap_or_else(PoisonError::into_inner) = Some(validator);
    }

    /// Replace the storage provider. Connections already open keep using
    /// the provider they were accepted with only for in-flight calls.
    pub fn set_provider(&self, provider: Provider) {
        *self.shared.provider.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(provider);
    }

    /// Takes effect from the next heartbeat round.
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.shared
            .heartbeat_ms
            .store(duration_ms(interval), Ordering::Relaxed);
    }

    pub fn on_error(&self, listener: impl Fn(&ServerError) + Send + Sync + 'static) {
        self.shared
            .error_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Called once when the server shuts down.
    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.shared
            .close_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub fn provider(&self) -> Arc<Provider> {
        self.shared.provider()
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.shared.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Listen on the configured address until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.shared.config.bind_addr.clone();
        self.listen(addr).await
    }

    /// Bind `addr` and serve until [`shutdown`](Self::shutdown).
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        self.attach(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn attach(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        log::info!("Sync server listening on {local:?}");
        self.start_heartbeat();

        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            self.shared.emit_error(&ServerError::Io(e));
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_stream(stream).await {
                            log::debug!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        log::info!("Sync server on {local:?} stopped accepting");
        Ok(())
    }

    /// Run the handshake and session on a stream accepted elsewhere.
    pub async fn serve_stream<S>(&self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.start_heartbeat();
        self.shared.clone().serve(stream).await
    }

    /// Stop accepting, close every connection and notify close listeners.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Sync server shutting down");
        let listeners = self
            .shared
            .close_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener();
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.peers.read().await.len()
    }

    pub async fn stats(&self) -> ServerStats {
        let stats = &self.shared.stats;
        let broadcast = self.shared.registry.stats().await;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            mutations: stats.mutations.load(Ordering::Relaxed),
            rejected_mutations: stats.rejected_mutations.load(Ordering::Relaxed),
            broadcasts: stats.broadcasts.load(Ordering::Relaxed),
            heartbeat_terminations: stats.heartbeat_terminations.load(Ordering::Relaxed),
            active_keys: broadcast.active_keys,
            subscriptions: broadcast.subscriptions,
        }
    }

    fn start_heartbeat(&self) {
        if self.shared.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(heartbeat_loop(weak, shutdown));
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

async fn heartbeat_loop(weak: Weak<ServerShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let interval = match weak.upgrade() {
            Some(shared) => Duration::from_millis(shared.heartbeat_ms.load(Ordering::Relaxed)),
            None => return,
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        match weak.upgrade() {
            Some(shared) => shared.heartbeat_tick().await,
            None => return,
        }
    }
}

/// Pass the header check and echo the subprotocol when the client asked for it.
fn check_handshake(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let client = request
        .headers()
        .get(HEADER_KEY)
        .and_then(|value| value.to_str().ok());
    if client != Some(HEADER_VALUE) {
        let mut rejection = ErrorResponse::new(Some(format!("missing {HEADER_KEY} header")));
        *rejection.status_mut() = StatusCode::BAD_REQUEST;
        return Err(rejection);
    }

    let wants_protocol = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == SUBPROTOCOL);
    if wants_protocol {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    }
    Ok(response)
}

impl ServerShared {
    fn provider(&self) -> Arc<Provider> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn validator(&self) -> Option<Validator> {
        self.validator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit_error(&self, error: &ServerError) {
        let listeners = self
            .error_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(error);
        }
    }

    async fn serve<S>(self: Arc<Self>, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut validation = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let response = check_handshake(request, response)?;
            validation = Some(ValidationData::from_request(request));
            Ok(response)
        };
        let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;
        let ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::info!("Handshake refused: {e}");
                return Err(e.into());
            }
        };

        let context = match (self.validator(), validation) {
            (Some(validator), Some(data)) => match validator(data).await {
                Ok(context) => context,
                Err(e) => {
                    log::warn!("Validation hook failed: {e}");
                    self.emit_error(&ServerError::Validation(e));
                    None
                }
            },
            _ => Some(UserContext::default()),
        };
        let Some(context) = context else {
            self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            log::info!("Connection rejected by validation");
            return Ok(());
        };
        let context = context.ensure_id();

        self.run_session(ws, context).await;
        Ok(())
    }

    async fn run_session<S>(self: Arc<Self>, ws: tokio_tungstenite::WebSocketStream<S>, context: UserContext)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(self.config.outbound_capacity.max(1));
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<CommandMessage>(self.config.command_capacity.max(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let peer = Arc::new(PeerHandle::new(out_tx));

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        self.peers.write().await.insert(peer.id(), peer.clone());
        log::info!("Connection {} established for user {}", peer.id(), context.id);

        // Writer: outbound channel → socket.
        let writer = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = out_rx.recv() => item,
                    _ = &mut stop_rx => None,
                };
                let Some(item) = item else { break };
                let message = match item {
                    Outgoing::Frame(bytes) => Message::Binary(bytes),
                    Outgoing::Ping(nonce) => Message::Ping(nonce),
                };
                if let Err(e) = sink.send(message).await {
                    log::debug!("Write failed: {e}");
                    break;
                }
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        });

        if let Err(e) = peer.send_message(&CommandMessage::init(&context)) {
            log::error!("Failed to encode init for {}: {e}", peer.id());
        }

        // Worker: commands run one at a time, in arrival order.
        let worker = {
            let shared = self.clone();
            let peer = peer.clone();
            let context = context.clone();
            tokio::spawn(async move {
                while let Some(msg) = cmd_rx.recv().await {
                    shared.dispatch(&peer, &context, msg).await;
                }
            })
        };

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = peer.terminated() => {
                    log::info!("Terminating connection {}", peer.id());
                    break;
                }
                _ = shutdown.changed() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        self.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match CommandMessage::decode(&data) {
                            Ok(msg) => {
                                if cmd_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode message from {}: {e}", peer.id()),
                        }
                    }
                    Some(Ok(Message::Pong(payload))) => {
                        if !peer.accept_pong(&payload) {
                            log::warn!("Heartbeat nonce mismatch from {}", peer.id());
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Connection {} closed by peer: {frame:?}", peer.id());
                        break;
                    }
                    Some(Ok(Message::Text(_))) => log::trace!("Ignoring text frame from {}", peer.id()),
                    // Pings are answered by the protocol layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket error on {}: {e}", peer.id());
                        break;
                    }
                    None => break,
                },
            }
        }

        peer.mark_closed();
        drop(cmd_tx);
        let _ = stop_tx.send(());
        self.peers.write().await.remove(&peer.id());
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        if let Err(e) = self.provider().clear_all(&context).await {
            log::warn!("clear_all failed for {}: {e}", context.id);
        }
        let _ = writer.await;
        // In-flight mutations are allowed to finish; the worker exits once
        // its queue drains.
        drop(worker);
        log::info!("Connection {} closed", peer.id());
    }

    async fn dispatch(&self, peer: &Arc<PeerHandle>, context: &UserContext, msg: CommandMessage) {
        let Some(key) = msg.key.clone() else {
            log::debug!("Ignoring '{}' without key", msg.command.as_str());
            return;
        };
        match msg.command {
            Command::Get | Command::Bind => self.handle_get(peer, context, key).await,
            Command::Set | Command::Update => self.handle_set(peer, context, key, &msg).await,
            Command::Leave | Command::Unbind => self.handle_unbind(peer, context, key).await,
            other => log::trace!("Ignoring command '{}'", other.as_str()),
        }
    }

    async fn handle_get(&self, peer: &Arc<PeerHandle>, context: &UserContext, key: DataKey) {
        self.registry.subscribe(&key, peer).await;
        // `error` means a rejected mutation to clients; a load failure is only logged.
        match self.provider().get(&key, context).await {
            Ok(document) => reply_to(peer, &CommandMessage::document(key, document)),
            Err(e) => log::warn!("Failed to load {key} for {}: {e}", context.id),
        }
    }

    async fn handle_set(&self, peer: &Arc<PeerHandle>, context: &UserContext, key: DataKey, msg: &CommandMessage) {
        if !self.registry.has_subscribers(&key).await {
            log::debug!("Dropping mutation of {key}: no subscribers");
            return;
        }
        let ops = match msg.ops() {
            Ok(ops) => ops,
            Err(e) => {
                reply_to(peer, &CommandMessage::error(key, e.to_string()));
                return;
            }
        };

        let provider = self.provider();
        match provider.concurrency_set(&key, &ops, context).await {
            Ok(guard) => {
                self.stats.mutations.fetch_add(1, Ordering::Relaxed);
                match provider.get(&key, context).await {
                    Ok(document) => {
                        let update = CommandMessage::document(key.clone(), document);
                        match self.registry.broadcast(&key, &update).await {
                            Ok(count) => {
                                self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
                                log::trace!("Broadcast {key} to {count} subscribers");
                            }
                            Err(e) => log::error!("Failed to encode update for {key}: {e}"),
                        }
                    }
                    Err(e) => log::warn!("Committed {key} but failed to reload it: {e}"),
                }
                guard.release();
            }
            Err(e) => {
                self.stats.rejected_mutations.fetch_add(1, Ordering::Relaxed);
                log::warn!("Mutation of {key} by {} rejected: {e}", context.id);
                reply_to(peer, &CommandMessage::error(key, e.to_string()));
            }
        }
    }

    async fn handle_unbind(&self, peer: &Arc<PeerHandle>, context: &UserContext, key: DataKey) {
        if self.registry.unsubscribe(&key, peer.id()).await == Some(true) {
            log::debug!("Last subscriber left {key}; clearing");
            if let Err(e) = self.provider().clear(&key, context).await {
                log::warn!("Failed to clear {key}: {e}");
            }
        }
    }

    async fn heartbeat_tick(&self) {
        let peers: Vec<Arc<PeerHandle>> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            if !peer.is_open() {
                peer.terminate();
                continue;
            }
            let nonce = generate_id();
            if !peer.begin_ping(&nonce) {
                log::info!("Connection {} missed a heartbeat; terminating", peer.id());
                self.stats.heartbeat_terminations.fetch_add(1, Ordering::Relaxed);
                peer.terminate();
                continue;
            }
            peer.send(Outgoing::Ping(Bytes::from(nonce.into_bytes())));
        }
    }
}

fn reply_to(peer: &PeerHandle, msg: &CommandMessage) {
    match peer.send_message(msg) {
        Ok(true) => {}
        Ok(false) => log::debug!("Reply to {} dropped", peer.id()),
        Err(e) => log::error!("Failed to encode reply: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3333");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.lock_timeout, Duration::from_secs(20));
        assert_eq!(config.outbound_capacity, 256);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:3333");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.connection_count().await, 0);
    }

    #[test]
    fn test_handshake_requires_client_header() {
        let request = "ws://localhost/".into_client_request().unwrap();
        let rejected = check_handshake(&request, Response::new(()));
        assert_eq!(rejected.unwrap_err().status(), StatusCode::BAD_REQUEST);

        let mut request = "ws://localhost/".into_client_request().unwrap();
        request
            .headers_mut()
            .insert(HEADER_KEY, HeaderValue::from_static("someone-else"));
        assert!(check_handshake(&request, Response::new(())).is_err());
    }

    #[test]
    fn test_handshake_echoes_subprotocol() {
        let mut request = "ws://localhost/".into_client_request().unwrap();
        request
            .headers_mut()
            .insert(HEADER_KEY, HeaderValue::from_static(HEADER_VALUE));
        let response = check_handshake(&request, Response::new(())).unwrap();
        assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());

        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        let response = check_handshake(&request, Response::new(())).unwrap();
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            SUBPROTOCOL
        );
    }

    #[test]
    fn test_on_close_runs_once() {
        let server = SyncServer::with_defaults();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        server.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        server.shutdown();
        server.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attach_returns_after_shutdown() {
        let server = SyncServer::with_defaults();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = server.clone();
        let handle = tokio::spawn(async move { running.attach(listener).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
