//! # datasync: Key-scoped real-time JSON document synchronization
//!
//! Clients bind to document keys, edit an optimistic local copy, and the
//! server serializes every mutation per key before fanning the result out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   zlib(JSON) msgs   │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ local copy  │                     │ Provider    │──► KeyLocks (FIFO)
//! │ + history   │                     │ (authority) │──► SyncStorage
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                 ┌──────────┴─────────┐
//!                                 │ SubscriberRegistry │
//!                                 │ (fan-out per key)  │
//!                                 └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire messages and document keys
//! - [`ops`]: Diff, apply and invert JSON operations
//! - [`lock`]: Per-key FIFO locks with bounded wait
//! - [`provider`]: Authoritative documents over a pluggable backend
//! - [`storage`]: RocksDB-backed persistence
//! - [`broadcast`]: Key-scoped fan-out with backpressure
//! - [`auth`]: Connection validation input
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with outbound queue
//! - [`timer`]: Restartable idle timer

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod lock;
pub mod ops;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod storage;
pub mod timer;

// Re-exports for convenience
pub use auth::{validator, ValidationData, ValidationError, Validator};
pub use broadcast::{BroadcastStats, PeerHandle, SubscriberRegistry};
pub use client::{
    BindOptions, ClientConfig, ClientError, ConnectionState, DocumentChange, DocumentHandle,
    Origin, OutboundQueue, SyncClient, SyncEvent, Unbind,
};
pub use lock::{KeyGuard, KeyLocks, LockError, DEFAULT_LOCK_TIMEOUT};
pub use ops::{apply, diff, equal, invert, path, OpsError, Operation, PathSegment};
pub use protocol::{Agent, Command, CommandMessage, DataKey, ProtocolError, UserContext};
pub use provider::{MemoryStorage, MutationGuard, Provider, ProviderError, StorageError, SyncStorage};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{DocumentMetadata, DocumentStore, RocksStorage, StoreConfig, StoreError};
