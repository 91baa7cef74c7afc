//! Per-key FIFO mutual exclusion with a bounded wait.
//!
//! ```text
//!  key ─► LockEntry { semaphore(1), pending }
//!            │
//!            ├─ holder      (KeyGuard: permit + ticket)
//!            ├─ waiter #1   (queued, FIFO)
//!            └─ waiter #2
//! ```
//!
//! Each key gets its own single-permit semaphore. Tokio semaphores hand out
//! permits in request order, so waiters run strictly FIFO. A waiter that
//! times out is dropped from the queue without ever running. The entry is
//! removed once nobody holds or waits on it, so idle keys cost nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::protocol::DataKey;

/// Default bound on how long a mutation waits for its turn.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for key lock")]
    Timeout(Duration),
}

struct LockEntry {
    semaphore: Arc<Semaphore>,
    pending: usize,
}

type LockTable = Arc<Mutex<HashMap<DataKey, LockEntry>>>;

/// Registry of per-key locks.
#[derive(Clone)]
pub struct KeyLocks {
    table: LockTable,
    timeout: Duration,
}

impl KeyLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &DataKey) -> Result<KeyGuard, LockError> {
        let semaphore = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = table.entry(key.clone()).or_insert_with(|| LockEntry {
                semaphore: Arc::new(Semaphore::new(1)),
                pending: 0,
            });
            entry.pending += 1;
            entry.semaphore.clone()
        };
        let ticket = Ticket {
            table: self.table.clone(),
            key: key.clone(),
        };

        // Uncontended fast path.
        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return Ok(KeyGuard {
                _permit: permit,
                _ticket: ticket,
            });
        }

        log::trace!("Waiting for lock on {key}");
        match tokio::time::timeout(self.timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(KeyGuard {
                _permit: permit,
                _ticket: ticket,
            }),
            // The semaphore is never closed; treat it like a timeout anyway.
            Ok(Err(_)) | Err(_) => {
                log::warn!("Lock wait on {key} exceeded {:?}", self.timeout);
                Err(LockError::Timeout(self.timeout))
            }
        }
    }

    /// Number of keys with a holder or waiters.
    pub fn active_keys(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Holders plus waiters on `key`.
    pub fn pending(&self, key: &DataKey) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |entry| entry.pending)
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Decrements the key's pending count on drop and removes the entry at zero.
struct Ticket {
    table: LockTable,
    key: DataKey,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = table.get_mut(&self.key) {
            entry.pending = entry.pending.saturating_sub(1);
            if entry.pending == 0 {
                table.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key. Dropping it admits the next waiter.
pub struct KeyGuard {
    // Field order matters: the permit is released before the ticket.
    _permit: OwnedSemaphorePermit,
    _ticket: Ticket,
}
