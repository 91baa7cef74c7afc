//! Authoritative document state and serialized mutation.
//!
//! ```text
//!  concurrency_set(key, ops, ctx)
//!        │
//!        ▼
//!  KeyLocks::acquire(key) ── FIFO, bounded wait
//!        │
//!        ▼
//!  committed ──clone──► working copy ──apply(ops)──► storage.set() ──► extra ops
//!                                                                        │
//!  committed ◄──────────────── swap (write lock) ◄── apply(extra ops) ◄──┘
//! ```
//!
//! Readers only ever observe committed documents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::lock::{KeyGuard, KeyLocks, LockError, DEFAULT_LOCK_TIMEOUT};
use crate::ops::{self, Operation, OpsError};
use crate::protocol::{DataKey, UserContext};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    LockTimeout(#[from] LockError),
    #[error("failed to apply operations: {0}")]
    Apply(#[from] OpsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Pluggable persistence backend.
///
/// `set` is both the persistence point and a hook: the operations it returns
/// are applied on top of the committed document (e.g. server timestamps).
pub trait SyncStorage: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a DataKey,
        ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<Value>, StorageError>>;

    fn set<'a>(
        &'a self,
        key: &'a DataKey,
        value: &'a Value,
        ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<Vec<Operation>, StorageError>>;

    fn clear<'a>(
        &'a self,
        key: &'a DataKey,
        ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    fn clear_all<'a>(&'a self, ctx: &'a UserContext) -> BoxFuture<'a, Result<(), StorageError>>;
}

/// In-process backend. Forgets a document once it is cleared.
#[derive(Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<DataKey, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStorage for MemoryStorage {
    fn get<'a>(
        &'a self,
        key: &'a DataKey,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        async move { Ok(self.documents.read().await.get(key).cloned()) }.boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a DataKey,
        value: &'a Value,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<Vec<Operation>, StorageError>> {
        async move {
            self.documents.write().await.insert(key.clone(), value.clone());
            Ok(Vec::new())
        }
        .boxed()
    }

    fn clear<'a>(
        &'a self,
        key: &'a DataKey,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move { Ok(self.documents.write().await.remove(key).is_some()) }.boxed()
    }

    fn clear_all<'a>(&'a self, _ctx: &'a UserContext) -> BoxFuture<'a, Result<(), StorageError>> {
        // Connection-scoped cleanup; documents are shared across connections.
        async move { Ok(()) }.boxed()
    }
}

/// Handle on a committed mutation. The key stays locked until it is
/// released or dropped.
pub struct MutationGuard {
    guard: Option<KeyGuard>,
}

impl MutationGuard {
    fn noop() -> Self {
        Self { guard: None }
    }

    /// Admit the next queued mutation on this key.
    pub fn release(mut self) {
        self.guard.take();
    }

    /// `false` for the guard returned by an empty operation list.
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

/// Owns the authoritative documents and serializes mutations per key.
pub struct Provider {
    storage: Arc<dyn SyncStorage>,
    documents: RwLock<HashMap<DataKey, Value>>,
    locks: KeyLocks,
}

impl Provider {
    pub fn new(storage: Arc<dyn SyncStorage>) -> Self {
        Self::with_lock_timeout(storage, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(storage: Arc<dyn SyncStorage>, timeout: Duration) -> Self {
        Self {
            storage,
            documents: RwLock::new(HashMap::new()),
            locks: KeyLocks::new(timeout),
        }
    }

    /// Provider backed by [`MemoryStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Committed document for `key`, loaded from storage on first access.
    pub async fn get(&self, key: &DataKey, ctx: &UserContext) -> Result<Value, ProviderError> {
        if let Some(document) = self.documents.read().await.get(key) {
            return Ok(document.clone());
        }

        let loaded = self
            .storage
            .get(key, ctx)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new()));

        let mut documents = self.documents.write().await;
        // A concurrent commit may have landed while storage was loading.
        Ok(documents.entry(key.clone()).or_insert(loaded).clone())
    }

    /// Apply `ops` to `key` under its lock.
    ///
    /// Returns with the lock still held so callers can publish the result
    /// before the next mutation runs.
    pub async fn concurrency_set(
        &self,
        key: &DataKey,
        ops: &[Operation],
        ctx: &UserContext,
    ) -> Result<MutationGuard, ProviderError> {
        if ops.is_empty() {
            return Ok(MutationGuard::noop());
        }

        let guard = self.locks.acquire(key).await?;

        let mut working = self.get(key, ctx).await?;
        ops::apply(&mut working, ops)?;

        let extra = self.storage.set(key, &working, ctx).await?;
        if !extra.is_empty() {
            log::debug!("Storage contributed {} extra ops to {key}", extra.len());
            ops::apply(&mut working, &extra)?;
        }

        self.documents.write().await.insert(key.clone(), working);
        log::trace!("Committed {} ops to {key} for {}", ops.len(), ctx.id);

        Ok(MutationGuard { guard: Some(guard) })
    }

    /// Forget `key` in memory and in the backend.
    pub async fn clear(&self, key: &DataKey, ctx: &UserContext) -> Result<bool, ProviderError> {
        let cached = self.documents.write().await.remove(key).is_some();
        let stored = self.storage.clear(key, ctx).await?;
        Ok(cached || stored)
    }

    /// Connection teardown hook.
    pub async fn clear_all(&self, ctx: &UserContext) -> Result<(), ProviderError> {
        self.storage.clear_all(ctx).await?;
        Ok(())
    }

    /// Number of documents held in memory.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl Default for Provider {
    fn default() -> Self {
        Self::in_memory()
    }
}
