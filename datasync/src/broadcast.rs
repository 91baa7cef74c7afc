//! Key-scoped fan-out to subscribed connections.
//!
//! Each connection owns a bounded outbound channel drained by its writer
//! task. A broadcast encodes once and clones the shared frame into every
//! subscriber's channel, so a slow peer can never stall the others: when its
//! channel is full the frame is dropped for that peer and counted.
//!
//! ```text
//!  SubscriberRegistry
//!    "ns:users:1" ──► { conn A ─► PeerHandle(tx) ─► writer A ─► socket A
//!                       conn B ─► PeerHandle(tx) ─► writer B ─► socket B }
//!    "ns:users:2" ──► { conn B }
//! ```
//!
//! Reference: Patterson & Hennessy, Section 6.4: Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::Bytes;
use uuid::Uuid;

use crate::protocol::{CommandMessage, DataKey, ProtocolError};

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Encoded [`CommandMessage`].
    Frame(Bytes),
    /// Heartbeat ping carrying a nonce.
    Ping(Bytes),
}

/// Server-side handle on one live connection.
pub struct PeerHandle {
    id: Uuid,
    tx: mpsc::Sender<Outgoing>,
    open: AtomicBool,
    /// Nonce of the last heartbeat ping that has not been answered yet.
    awaiting_pong: Mutex<Option<String>>,
    kill: Notify,
}

impl PeerHandle {
    pub fn new(tx: mpsc::Sender<Outgoing>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            open: AtomicBool::new(true),
            awaiting_pong: Mutex::new(None),
            kill: Notify::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue a frame without waiting. Returns `false` when the peer is closed
    /// or its outbound buffer is full.
    pub fn send(&self, item: Outgoing) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Peer {} lagging, outbound buffer full", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn send_message(&self, msg: &CommandMessage) -> Result<bool, ProtocolError> {
        Ok(self.send(Outgoing::Frame(Bytes::from(msg.encode()?))))
    }

    /// Mark closed and wake the connection task so it tears the socket down.
    pub fn terminate(&self) {
        self.open.store(false, Ordering::Release);
        self.kill.notify_one();
    }

    /// Resolves once [`terminate`](Self::terminate) has been called.
    pub async fn terminated(&self) {
        self.kill.notified().await;
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Start a heartbeat round. Returns `false` when the previous ping was
    /// never answered.
    pub(crate) fn begin_ping(&self, nonce: &str) -> bool {
        let mut slot = self.awaiting_pong.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(nonce.to_string());
        true
    }

    /// Match a pong against the outstanding nonce. Only a mismatch is
    /// reported as `false`; unsolicited pongs are accepted.
    pub(crate) fn accept_pong(&self, payload: &[u8]) -> bool {
        let mut slot = self.awaiting_pong.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_deref() {
            Some(nonce) if nonce.as_bytes() == payload => {
                *slot = None;
                true
            }
            Some(_) => false,
            None => true,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_keys: usize,
    pub subscriptions: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Maps document keys to the connections bound to them.
#[derive(Default)]
pub struct SubscriberRegistry {
    rooms: RwLock<HashMap<DataKey, HashMap<Uuid, Arc<PeerHandle>>>>,
    stats: AtomicBroadcastStats,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `peer` to `key`. Returns `false` when it was already bound.
    pub async fn subscribe(&self, key: &DataKey, peer: &Arc<PeerHandle>) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(key.clone())
            .or_default()
            .insert(peer.id(), peer.clone())
            .is_none()
    }

    /// Unbind `peer_id` from `key`.
    ///
    /// `None` when it was not bound; `Some(true)` when this emptied the key.
    pub async fn unsubscribe(&self, key: &DataKey, peer_id: Uuid) -> Option<bool> {
        let mut rooms = self.rooms.write().await;
        let subscribers = rooms.get_mut(key)?;
        subscribers.remove(&peer_id)?;
        if subscribers.is_empty() {
            rooms.remove(key);
            return Some(true);
        }
        Some(false)
    }

    pub async fn has_subscribers(&self, key: &DataKey) -> bool {
        self.rooms
            .read()
            .await
            .get(key)
            .is_some_and(|subscribers| !subscribers.is_empty())
    }

    pub async fn subscriber_count(&self, key: &DataKey) -> usize {
        self.rooms.read().await.get(key).map_or(0, HashMap::len)
    }

    pub async fn is_subscribed(&self, key: &DataKey, peer_id: Uuid) -> bool {
        self.rooms
            .read()
            .await
            .get(key)
            .is_some_and(|subscribers| subscribers.contains_key(&peer_id))
    }

    /// Every key with at least one subscriber.
    pub async fn active_keys(&self) -> Vec<DataKey> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Encode `msg` once and queue it for every open subscriber of `key`.
    ///
    /// Subscribers whose connection has closed are pruned. Returns the
    /// number of peers the frame was queued for.
    pub async fn broadcast(&self, key: &DataKey, msg: &CommandMessage) -> Result<usize, ProtocolError> {
        let frame = Bytes::from(msg.encode()?);
        Ok(self.broadcast_raw(key, frame).await)
    }

    pub async fn broadcast_raw(&self, key: &DataKey, frame: Bytes) -> usize {
        let peers: Vec<Arc<PeerHandle>> = match self.rooms.read().await.get(key) {
            Some(subscribers) => subscribers.values().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for peer in &peers {
            if !peer.is_open() {
                closed.push(peer.id());
                continue;
            }
            if peer.send(Outgoing::Frame(frame.clone())) {
                delivered += 1;
            } else {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        if !closed.is_empty() {
            self.prune(key, &closed).await;
        }
        delivered
    }

    async fn prune(&self, key: &DataKey, closed: &[Uuid]) {
        let mut rooms = self.rooms.write().await;
        if let Some(subscribers) = rooms.get_mut(key) {
            for id in closed {
                subscribers.remove(id);
            }
            log::debug!("Pruned {} closed subscribers from {key}", closed.len());
            if subscribers.is_empty() {
                rooms.remove(key);
            }
        }
    }

    pub async fn stats(&self) -> BroadcastStats {
        let rooms = self.rooms.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_keys: rooms.len(),
            subscriptions: rooms.values().map(HashMap::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(id: &str) -> DataKey {
        DataKey::new("default", "doc", id).unwrap()
    }

    fn peer(capacity: usize) -> (Arc<PeerHandle>, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(PeerHandle::new(tx)), rx)
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let registry = SubscriberRegistry::new();
        let (alice, _rx_a) = peer(4);
        let (bob, _rx_b) = peer(4);

        assert!(registry.subscribe(&key("1"), &alice).await);
        assert!(!registry.subscribe(&key("1"), &alice).await);
        assert!(registry.subscribe(&key("1"), &bob).await);
        assert_eq!(registry.subscriber_count(&key("1")).await, 2);

        assert_eq!(registry.unsubscribe(&key("1"), alice.id()).await, Some(false));
        assert_eq!(registry.unsubscribe(&key("1"), alice.id()).await, None);
        assert_eq!(registry.unsubscribe(&key("1"), bob.id()).await, Some(true));
        assert!(!registry.has_subscribers(&key("1")).await);
        assert!(registry.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_includes_sender() {
        let registry = SubscriberRegistry::new();
        let (alice, mut rx_a) = peer(4);
        let (bob, mut rx_b) = peer(4);
        registry.subscribe(&key("1"), &alice).await;
        registry.subscribe(&key("1"), &bob).await;

        let msg = CommandMessage::document(key("1"), json!({"count": 1}));
        assert_eq!(registry.broadcast(&key("1"), &msg).await.unwrap(), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                Outgoing::Frame(bytes) => assert_eq!(CommandMessage::decode(&bytes).unwrap(), msg),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_isolated_per_key() {
        let registry = SubscriberRegistry::new();
        let (alice, mut rx_a) = peer(4);
        let (bob, mut rx_b) = peer(4);
        registry.subscribe(&key("1"), &alice).await;
        registry.subscribe(&key("2"), &bob).await;

        registry.broadcast_raw(&key("1"), Bytes::from_static(b"x")).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_peers() {
        let registry = SubscriberRegistry::new();
        let (alice, _rx_a) = peer(4);
        let (bob, rx_b) = peer(4);
        registry.subscribe(&key("1"), &alice).await;
        registry.subscribe(&key("1"), &bob).await;

        drop(rx_b);
        assert_eq!(registry.broadcast_raw(&key("1"), Bytes::from_static(b"x")).await, 1);
        assert_eq!(registry.subscriber_count(&key("1")).await, 1);

        alice.terminate();
        assert_eq!(registry.broadcast_raw(&key("1"), Bytes::from_static(b"x")).await, 0);
        assert!(!registry.has_subscribers(&key("1")).await);
    }

    #[tokio::test]
    async fn test_full_buffer_counts_drop() {
        let registry = SubscriberRegistry::new();
        let (alice, _rx) = peer(1);
        registry.subscribe(&key("1"), &alice).await;

        registry.broadcast_raw(&key("1"), Bytes::from_static(b"a")).await;
        registry.broadcast_raw(&key("1"), Bytes::from_static(b"b")).await;

        let stats = registry.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_keys, 1);
        assert_eq!(stats.subscriptions, 1);
        // Still subscribed: lagging is not closing.
        assert!(registry.is_subscribed(&key("1"), alice.id()).await);
    }

    #[tokio::test]
    async fn test_ping_pong_nonce() {
        let (alice, _rx) = peer(1);
        assert!(alice.begin_ping("n1"));
        assert!(!alice.begin_ping("n2"));
        assert!(!alice.accept_pong(b"other"));
        assert!(alice.accept_pong(b"n1"));
        assert!(alice.begin_ping("n3"));
    }

    #[tokio::test]
    async fn test_terminate_wakes_connection() {
        let (alice, _rx) = peer(1);
        let waiter = alice.clone();
        let task = tokio::spawn(async move { waiter.terminated().await });
        alice.terminate();
        task.await.unwrap();
        assert!(!alice.is_open());
    }
}
