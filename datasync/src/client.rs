//! WebSocket sync client for bound documents.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Key bindings with an optimistic local copy per document
//! - Echo suppression of server-originated changes
//! - Rollback of rejected mutations and per-binding undo/redo
//! - Outbound queue for commands issued while not connected
//!
//! ```text
//!  DocumentHandle::set/delete/update ─┐
//!                                     ├─► commit ─► observer ─► set {ops} ─► socket
//!  server `set` ─► diff ─► pending ───┘                 │
//!                                          (equal to pending? suppressed)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};

use crate::ops::{self, OpsError, Operation, PathSegment};
use crate::protocol::{
    Command, CommandMessage, DataKey, ProtocolError, UserContext, HEADER_KEY, HEADER_VALUE,
    SUBPROTOCOL,
};
use crate::timer::TimeoutHandle;

/// Shortest idle period accepted for auto-unbind.
pub const MIN_AUTO_UNBIND: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Apply(#[from] OpsError),
    #[error("Key {0} is not bound")]
    NotBound(DataKey),
    #[error("Client has been dropped")]
    Closed,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Lost the connection; waiting out the backoff.
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Server greeting with the session context
    Initialized(UserContext),
    /// Server document received and applied
    DocumentSynced(DataKey),
    /// A mutation was refused and rolled back
    Rejected { key: DataKey, reason: String },
    /// Socket or handshake failure
    Error(String),
    /// Key released by its idle timer
    AutoUnbound(DataKey),
}

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
    Rollback,
    Undo,
    Redo,
}

/// Notification delivered to [`DocumentHandle::subscribe`] receivers.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub ops: Vec<Operation>,
    pub origin: Origin,
    /// Document after the change
    pub document: Value,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Subprotocols requested in addition to the sync protocol
    pub protocols: Vec<String>,
    /// Extra headers sent with every upgrade request
    pub headers: Vec<(String, String)>,
    pub reconnect_delay: Duration,
    /// Reconnect after an abnormal close
    pub auto_reconnect: bool,
    pub event_capacity: usize,
    /// Undo entries kept per binding
    pub history_limit: usize,
    /// Commands held while disconnected
    pub max_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3333".to_string(),
            protocols: Vec::new(),
            headers: Vec::new(),
            reconnect_delay: Duration::from_secs(1),
            auto_reconnect: true,
            event_capacity: 256,
            history_limit: 100,
            max_queue: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Options for [`SyncClient::bind`].
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    /// Namespace prefixed to the short key; `default` when unset.
    pub namespace: Option<String>,
    /// Unbind after this long without a server message for the key.
    pub auto_unbind: Option<Duration>,
}

/// Commands issued while the socket is not open.
///
/// Flushed in insertion order once the connection opens.
pub struct OutboundQueue {
    queue: VecDeque<CommandMessage>,
    max_size: usize,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, msg: CommandMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(msg);
        true
    }

    pub fn drain(&mut self) -> Vec<CommandMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ─── Client state ────────────────────────────────────────────────────

struct Binding {
    document: Value,
    /// Ops of the server change currently being applied.
    pending_server_ops: Option<Vec<Operation>>,
    /// Inverses of local changes the server has not answered yet.
    in_flight: VecDeque<Vec<Operation>>,
    undo: VecDeque<Vec<Operation>>,
    redo: Vec<Vec<Operation>>,
    changes: broadcast::Sender<DocumentChange>,
    auto_unbind: Option<TimeoutHandle>,
    synced: bool,
}

impl Binding {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            document: Value::Object(Default::default()),
            pending_server_ops: None,
            in_flight: VecDeque::new(),
            undo: VecDeque::new(),
            redo: Vec::new(),
            changes,
            auto_unbind: None,
            synced: false,
        }
    }
}

struct ClientState {
    connection: ConnectionState,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    queue: OutboundQueue,
    bindings: HashMap<DataKey, Binding>,
    context: Option<UserContext>,
    started: bool,
    user_closed: bool,
    history_limit: usize,
    wake: Arc<Notify>,
}

impl ClientState {
    /// Send now when open, queue otherwise. Sending while fully closed
    /// also asks the connection task for a new connection.
    fn send(&mut self, msg: CommandMessage) {
        if self.connection == ConnectionState::Connected {
            if let Some(tx) = &self.outgoing {
                match msg.encode() {
                    Ok(bytes) => {
                        if tx.send(Message::Binary(bytes.into())).is_ok() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to encode '{}': {e}", msg.command.as_str());
                        return;
                    }
                }
            }
        }

        if !self.queue.enqueue(msg) {
            log::warn!("Outbound queue full; dropping command");
        }
        if self.connection == ConnectionState::Disconnected && self.started {
            self.user_closed = false;
            self.wake.notify_one();
        }
    }

    fn binding(&self, key: &DataKey) -> Result<&Binding, ClientError> {
        self.bindings
            .get(key)
            .ok_or_else(|| ClientError::NotBound(key.clone()))
    }

    /// Apply `ops` to the local copy and run the change observer.
    fn commit(&mut self, key: &DataKey, ops: Vec<Operation>, origin: Origin) -> Result<(), ClientError> {
        if ops.is_empty() {
            return Ok(());
        }
        let history_limit = self.history_limit;
        let binding = self
            .bindings
            .get_mut(key)
            .ok_or_else(|| ClientError::NotBound(key.clone()))?;

        let mut next = binding.document.clone();
        ops::apply(&mut next, &ops)?;
        binding.document = next;

        let echo = binding
            .pending_server_ops
            .as_deref()
            .is_some_and(|pending| ops::equal(pending, &ops));
        let outbound = if echo {
            None
        } else {
            binding.in_flight.push_back(ops::invert(&ops));
            if origin == Origin::Local {
                binding.undo.push_back(ops.clone());
                if binding.undo.len() > history_limit {
                    binding.undo.pop_front();
                }
                binding.redo.clear();
            }
            Some(CommandMessage::set_ops(key.clone(), &ops))
        };

        // No receivers is fine.
        let _ = binding.changes.send(DocumentChange {
            ops,
            origin,
            document: binding.document.clone(),
        });

        if let Some(msg) = outbound {
            self.send(msg);
        }
        Ok(())
    }

    /// Replace the local copy with the server's document.
    fn apply_remote(&mut self, key: &DataKey, document: Value) {
        let Some(binding) = self.bindings.get_mut(key) else {
            log::trace!("Ignoring update for unbound key {key}");
            return;
        };
        let ops = ops::diff(&binding.document, &document);
        binding.in_flight.clear();
        binding.synced = true;
        if let Some(timer) = &binding.auto_unbind {
            timer.restart();
        }
        binding.pending_server_ops = Some(ops.clone());

        let result = self.commit(key, ops, Origin::Remote);
        if let Some(binding) = self.bindings.get_mut(key) {
            binding.pending_server_ops = None;
            if let Err(e) = result {
                log::error!("Failed to apply server document for {key}: {e}");
                binding.document = document;
            }
        }
    }

    /// Undo every unanswered local change, newest first.
    fn rollback(&mut self, key: &DataKey) {
        let Some(binding) = self.bindings.get_mut(key) else {
            return;
        };
        if let Some(timer) = &binding.auto_unbind {
            timer.restart();
        }
        let ops: Vec<Operation> = binding.in_flight.drain(..).rev().flatten().collect();
        if ops.is_empty() {
            return;
        }
        log::debug!("Rolling back {} ops on {key}", ops.len());
        binding.pending_server_ops = Some(ops.clone());
        let result = self.commit(key, ops, Origin::Rollback);
        if let Some(binding) = self.bindings.get_mut(key) {
            binding.pending_server_ops = None;
        }
        if let Err(e) = result {
            log::error!("Rollback of {key} failed: {e}");
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    state: Mutex<ClientState>,
    events: mpsc::Sender<SyncEvent>,
    connection: watch::Sender<ConnectionState>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
}

enum Outcome {
    /// Closed normally or by `disconnect`; wait to be woken.
    Closed,
    /// Failed or dropped; back off and retry.
    Lost,
    /// `reconnect` was requested.
    Restart,
    Shutdown,
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::trace!("Dropping client event: {e}");
        }
    }

    fn transition(&self, state: &mut ClientState, next: ConnectionState) {
        state.connection = next;
        self.connection.send_replace(next);
    }

    fn unbind_key(&self, key: &DataKey) -> bool {
        let mut state = self.lock_state();
        if state.bindings.remove(key).is_none() {
            return false;
        }
        log::debug!("Unbinding {key}");
        state.send(CommandMessage::unbind(key.clone()));
        true
    }

    fn handle_message(&self, msg: CommandMessage) {
        match msg.command {
            Command::Init => match msg.context() {
                Ok(context) => {
                    log::info!("Session initialized as {}", context.id);
                    self.lock_state().context = Some(context.clone());
                    self.emit(SyncEvent::Initialized(context));
                }
                Err(e) => log::warn!("Malformed init: {e}"),
            },
            Command::Set | Command::Update => {
                let Some(key) = msg.key else {
                    log::debug!("Ignoring set without key");
                    return;
                };
                let document = msg.data.unwrap_or(Value::Object(Default::default()));
                let bound = {
                    let mut state = self.lock_state();
                    state.apply_remote(&key, document);
                    state.bindings.contains_key(&key)
                };
                if bound {
                    self.emit(SyncEvent::DocumentSynced(key));
                }
            }
            Command::Error => {
                let reason = msg.reason();
                let Some(key) = msg.key else {
                    log::warn!("Server error: {reason}");
                    self.emit(SyncEvent::Error(reason));
                    return;
                };
                log::warn!("Server rejected change to {key}: {reason}");
                self.lock_state().rollback(&key);
                self.emit(SyncEvent::Rejected { key, reason });
            }
            other => log::trace!("Ignoring command '{}'", other.as_str()),
        }
    }

    fn build_request(&self) -> Result<Request, ClientError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(HEADER_KEY, HeaderValue::from_static(HEADER_VALUE));

        let mut protocols = vec![SUBPROTOCOL.to_string()];
        protocols.extend(
            self.config
                .protocols
                .iter()
                .filter(|protocol| protocol.as_str() != SUBPROTOCOL)
                .cloned(),
        );
        let protocols = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocols);

        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
            headers.append(name, value);
        }
        Ok(request)
    }

    async fn run_connection(&self, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => {
                log::error!("Cannot build request for {}: {e}", self.config.url);
                self.emit(SyncEvent::Error(e.to_string()));
                return Outcome::Closed;
            }
        };

        let ws = tokio::select! {
            result = tokio_tungstenite::connect_async(request) => match result {
                Ok((ws, _)) => ws,
                Err(e) => {
                    if is_refused(&e) {
                        log::warn!("Connection refused by {}", self.config.url);
                    } else {
                        log::error!("Connection to {} failed: {e}", self.config.url);
                    }
                    self.emit(SyncEvent::Error(e.to_string()));
                    return Outcome::Lost;
                }
            },
            _ = shutdown.changed() => return Outcome::Shutdown,
        };
        log::info!("Connected to {}", self.config.url);

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    log::debug!("Write failed: {e}");
                    break;
                }
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        });

        let abandoned = {
            let mut state = self.lock_state();
            if state.user_closed {
                drop(tx);
                true
            } else {
                state.outgoing = Some(tx);
                self.transition(&mut state, ConnectionState::Connected);
                let queued = state.queue.drain();
                if !queued.is_empty() {
                    log::info!("Replaying {} queued commands", queued.len());
                }
                let keys: Vec<DataKey> = state.bindings.keys().cloned().collect();
                for msg in queued.into_iter().chain(keys.into_iter().map(CommandMessage::get)) {
                    state.send(msg);
                }
                false
            }
        };
        if abandoned {
            // Disconnected while the handshake was in flight.
            let _ = writer.await;
            return Outcome::Closed;
        }
        self.emit(SyncEvent::Connected);

        let outcome = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => match CommandMessage::decode(&data) {
                        Ok(msg) => self.handle_message(msg),
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed the connection: {frame:?}");
                        let normal = frame.is_some_and(|frame| frame.code == CloseCode::Normal);
                        break if normal { Outcome::Closed } else { Outcome::Lost };
                    }
                    Some(Ok(Message::Text(_))) => log::trace!("Ignoring text frame"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket error: {e}");
                        self.emit(SyncEvent::Error(e.to_string()));
                        break Outcome::Lost;
                    }
                    None => break Outcome::Lost,
                },
                _ = self.wake.notified() => {
                    log::info!("Reconnect requested");
                    break Outcome::Restart;
                }
                _ = shutdown.changed() => break Outcome::Shutdown,
            }
        };

        let outcome = {
            let mut state = self.lock_state();
            state.outgoing = None;
            let outcome = match outcome {
                Outcome::Lost if state.user_closed => Outcome::Closed,
                other => other,
            };
            let next = match outcome {
                Outcome::Lost if self.config.auto_reconnect => ConnectionState::Reconnecting,
                Outcome::Restart => ConnectionState::Reconnecting,
                _ => ConnectionState::Disconnected,
            };
            self.transition(&mut state, next);
            outcome
        };
        let _ = writer.await;
        self.emit(SyncEvent::Disconnected);
        outcome
    }
}

fn is_refused(error: &tungstenite::Error) -> bool {
    matches!(error, tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused)
}

async fn connection_loop(weak: Weak<ClientInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        if *shutdown.borrow() {
            return;
        }
        {
            let mut state = inner.lock_state();
            inner.transition(&mut state, ConnectionState::Connecting);
        }

        let outcome = inner.run_connection(&mut shutdown).await;
        let wake = inner.wake.clone();
        let retry = match outcome {
            Outcome::Shutdown => return,
            Outcome::Restart => Some(Duration::ZERO),
            Outcome::Lost if inner.config.auto_reconnect => Some(inner.config.reconnect_delay),
            Outcome::Lost | Outcome::Closed => None,
        };
        {
            let mut state = inner.lock_state();
            let next = match retry {
                Some(_) => ConnectionState::Reconnecting,
                None => ConnectionState::Disconnected,
            };
            inner.transition(&mut state, next);
        }
        drop(inner);

        match retry {
            Some(delay) => {
                log::debug!("Reconnecting in {delay:?}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => {}
                    _ = shutdown.changed() => return,
                }
                // A disconnect during the backoff stops the retry.
                let stopped = match weak.upgrade() {
                    Some(inner) => {
                        let mut state = inner.lock_state();
                        let stopped = state.user_closed;
                        if stopped {
                            inner.transition(&mut state, ConnectionState::Disconnected);
                        }
                        stopped
                    }
                    None => return,
                };
                if stopped {
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

// ─── Handles ─────────────────────────────────────────────────────────

/// Access to one bound document.
///
/// Every mutation goes through the same change observer as server updates,
/// so local changes are sent exactly once and server echoes are not resent.
#[derive(Clone)]
pub struct DocumentHandle {
    key: DataKey,
    inner: Weak<ClientInner>,
}

impl DocumentHandle {
    pub fn key(&self) -> &DataKey {
        &self.key
    }

    fn upgrade(&self) -> Result<Arc<ClientInner>, ClientError> {
        self.inner.upgrade().ok_or(ClientError::Closed)
    }

    pub fn is_bound(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.lock_state().bindings.contains_key(&self.key))
    }

    /// Whether a server document has been received since binding.
    pub fn is_synced(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            inner
                .lock_state()
                .bindings
                .get(&self.key)
                .is_some_and(|binding| binding.synced)
        })
    }

    pub fn snapshot(&self) -> Result<Value, ClientError> {
        let inner = self.upgrade()?;
        let state = inner.lock_state();
        let document = state.binding(&self.key)?.document.clone();
        Ok(document)
    }

    pub fn get(&self, path: &[PathSegment]) -> Result<Option<Value>, ClientError> {
        let inner = self.upgrade()?;
        let state = inner.lock_state();
        let value = ops::lookup(&state.binding(&self.key)?.document, path).cloned();
        Ok(value)
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<DocumentChange>, ClientError> {
        let inner = self.upgrade()?;
        let state = inner.lock_state();
        let receiver = state.binding(&self.key)?.changes.subscribe();
        Ok(receiver)
    }

    /// Write `value` at `path`. An index equal to the array length appends.
    pub fn set(&self, path: &[PathSegment], value: impl Into<Value>) -> Result<(), ClientError> {
        let inner = self.upgrade()?;
        let mut state = inner.lock_state();
        let before = ops::lookup(&state.binding(&self.key)?.document, path).cloned();
        let op = Operation::Set {
            path: path.to_vec(),
            before,
            after: value.into(),
        };
        state.commit(&self.key, vec![op], Origin::Local)
    }

    /// Remove the value at `path`; a missing path is a no-op.
    pub fn delete(&self, path: &[PathSegment]) -> Result<(), ClientError> {
        let inner = self.upgrade()?;
        let mut state = inner.lock_state();
        let Some(removed) = ops::lookup(&state.binding(&self.key)?.document, path).cloned() else {
            return Ok(());
        };
        let op = Operation::Delete {
            path: path.to_vec(),
            after: removed,
        };
        state.commit(&self.key, vec![op], Origin::Local)
    }

    /// Edit a copy of the document and commit the difference.
    pub fn update(&self, edit: impl FnOnce(&mut Value)) -> Result<(), ClientError> {
        let inner = self.upgrade()?;
        let before = inner.lock_state().binding(&self.key)?.document.clone();
        let mut after = before.clone();
        edit(&mut after);
        let ops = ops::diff(&before, &after);
        let result = inner.lock_state().commit(&self.key, ops, Origin::Local);
        result
    }

    /// Revert the latest local change. Returns false when there is none.
    pub fn undo(&self) -> Result<bool, ClientError> {
        let inner = self.upgrade()?;
        let mut state = inner.lock_state();
        let Some(ops) = state
            .bindings
            .get_mut(&self.key)
            .ok_or_else(|| ClientError::NotBound(self.key.clone()))?
            .undo
            .pop_back()
        else {
            return Ok(false);
        };
        state.commit(&self.key, ops::invert(&ops), Origin::Undo)?;
        if let Some(binding) = state.bindings.get_mut(&self.key) {
            binding.redo.push(ops);
        }
        Ok(true)
    }

    /// Reapply the latest undone change. Returns false when there is none.
    pub fn redo(&self) -> Result<bool, ClientError> {
        let inner = self.upgrade()?;
        let mut state = inner.lock_state();
        let Some(ops) = state
            .bindings
            .get_mut(&self.key)
            .ok_or_else(|| ClientError::NotBound(self.key.clone()))?
            .redo
            .pop()
        else {
            return Ok(false);
        };
        state.commit(&self.key, ops.clone(), Origin::Redo)?;
        if let Some(binding) = state.bindings.get_mut(&self.key) {
            binding.undo.push_back(ops);
        }
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        self.history_len(|binding| binding.undo.len()) > 0
    }

    pub fn can_redo(&self) -> bool {
        self.history_len(|binding| binding.redo.len()) > 0
    }

    fn history_len(&self, f: impl Fn(&Binding) -> usize) -> usize {
        self.inner.upgrade().map_or(0, |inner| {
            inner.lock_state().bindings.get(&self.key).map_or(0, f)
        })
    }
}

/// Releases a binding created by [`SyncClient::bind`].
pub struct Unbind {
    key: DataKey,
    inner: Weak<ClientInner>,
}

impl Unbind {
    /// Returns false when the key was already unbound.
    pub fn unbind(self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.unbind_key(&self.key))
    }
}

// ─── SyncClient ──────────────────────────────────────────────────────

/// The sync client.
///
/// Owns one background connection task once [`connect`](Self::connect) is
/// called. Dropping the client stops it.
pub struct SyncClient {
    inner: Arc<ClientInner>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let state = ClientState {
            connection: ConnectionState::Disconnected,
            outgoing: None,
            queue: OutboundQueue::new(config.max_queue),
            bindings: HashMap::new(),
            context: None,
            started: false,
            user_closed: false,
            history_limit: config.history_limit,
            wake: wake.clone(),
        };
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: Mutex::new(state),
                events,
                connection,
                wake,
                shutdown,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Start the connection task. Calling it again is a no-op.
    pub fn connect(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.started {
                return;
            }
            state.started = true;
            state.user_closed = false;
        }
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(connection_loop(weak, shutdown));
    }

    /// Wait until the socket is open. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.connection.subscribe();
        let opened = rx.wait_for(|state| *state == ConnectionState::Connected);
        let connected = matches!(tokio::time::timeout(timeout, opened).await, Ok(Ok(_)));
        connected
    }

    /// Bind `key` (`collection:id`) and request its document.
    ///
    /// Binding a key that is already bound returns handles to the existing
    /// binding.
    pub fn bind(&self, key: &str, options: BindOptions) -> Result<(DocumentHandle, Unbind), ClientError> {
        let key = DataKey::namespaced(key, options.namespace.as_deref())?;
        let mut state = self.inner.lock_state();
        if !state.bindings.contains_key(&key) {
            let mut binding = Binding::new();
            if let Some(idle) = options.auto_unbind {
                let timer = self.idle_timer(&key, idle);
                timer.restart();
                binding.auto_unbind = Some(timer);
            }
            state.bindings.insert(key.clone(), binding);
            log::debug!("Bound {key}");
        }
        state.send(CommandMessage::get(key.clone()));
        drop(state);

        let inner = Arc::downgrade(&self.inner);
        Ok((
            DocumentHandle {
                key: key.clone(),
                inner: inner.clone(),
            },
            Unbind { key, inner },
        ))
    }

    /// Unbind by short key. Returns false when it was not bound.
    pub fn leave(&self, key: &str, namespace: Option<&str>) -> Result<bool, ClientError> {
        let key = DataKey::namespaced(key, namespace)?;
        Ok(self.inner.unbind_key(&key))
    }

    /// Unbind `key` once no server message arrives for `idle`.
    ///
    /// Replaces any timer already set; `idle` is raised to
    /// [`MIN_AUTO_UNBIND`].
    pub fn auto_unbind(&self, key: &str, idle: Duration, namespace: Option<&str>) -> Result<(), ClientError> {
        let key = DataKey::namespaced(key, namespace)?;
        let timer = self.idle_timer(&key, idle);
        let mut state = self.inner.lock_state();
        let binding = state
            .bindings
            .get_mut(&key)
            .ok_or_else(|| ClientError::NotBound(key.clone()))?;
        timer.restart();
        binding.auto_unbind = Some(timer);
        Ok(())
    }

    fn idle_timer(&self, key: &DataKey, idle: Duration) -> TimeoutHandle {
        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        TimeoutHandle::new(idle.max(MIN_AUTO_UNBIND), move || {
            let Some(inner) = weak.upgrade() else { return };
            if inner.unbind_key(&key) {
                log::info!("Auto-unbound idle key {key}");
                inner.emit(SyncEvent::AutoUnbound(key.clone()));
            }
        })
    }

    /// Close with a normal close code and stop reconnecting.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock_state();
        state.user_closed = true;
        if let Some(tx) = &state.outgoing {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("client disconnect"),
            };
            let _ = tx.send(Message::Close(Some(frame)));
        }
    }

    /// Drop the current connection, if any, and connect again.
    pub fn reconnect(&self) {
        let started = {
            let mut state = self.inner.lock_state();
            state.user_closed = false;
            state.started
        };
        if started {
            self.inner.wake.notify_one();
        } else {
            self.connect();
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    /// Context from the server's `init` greeting.
    pub fn context(&self) -> Option<UserContext> {
        self.inner.lock_state().context.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn bound_keys(&self) -> Vec<DataKey> {
        self.inner.lock_state().bindings.keys().cloned().collect()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}
