//! Named locks with bounded-wait acquisition.
//!
//! A lock is identified by a resource-domain string such as
//! `"device-map-mutation"` or `"usage-collection:zone:7"`. Two holders of the
//! same name exclude each other; distinct names never contend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Error type for lock acquisition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The lock was not obtained within the allowed wait.
    #[error("Timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: String, waited: Duration },

    /// The lock backend could not be reached or rejected the request.
    #[error("Lock backend error for '{name}': {message}")]
    Backend { name: String, message: String },
}

impl LockError {
    /// Returns the lock name this error refers to.
    pub fn name(&self) -> &str {
        match self {
            LockError::Timeout { name, .. } | LockError::Backend { name, .. } => name,
        }
    }
}

pub(crate) enum Held {
    Local(#[allow(dead_code)] OwnedMutexGuard<()>),
    #[cfg(feature = "redis")]
    Lease(#[allow(dead_code)] crate::redis_lock::Lease),
}

/// Scoped ownership of a named lock.
///
/// The lock is released when the guard is dropped.
pub struct LockGuard {
    name: String,
    acquired_at: Instant,
    _held: Held,
}

impl LockGuard {
    pub(crate) fn new(name: impl Into<String>, held: Held) -> Self {
        Self {
            name: name.into(),
            acquired_at: Instant::now(),
            _held: held,
        }
    }

    /// Returns the lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns how long the guard has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(lock = %self.name, held_ms = self.held_for().as_millis() as u64, "Released lock");
    }
}

/// Source of named locks.
///
/// Implementations must fail closed: when the lock cannot be obtained within
/// `wait`, [`LockError::Timeout`] is returned instead of blocking further.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquires the lock `name`, waiting at most `wait`.
    async fn acquire(&self, name: &str, wait: Duration) -> Result<LockGuard, LockError>;
}

/// Lock provider for a single orchestrator process.
///
/// Each lock name maps to one `tokio::sync::Mutex`, created on first use and
/// kept for the life of the provider.
#[derive(Default)]
pub struct InProcessLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
}

impl InProcessLocks {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Returns the names of all locks created so far.
    pub fn lock_names(&self) -> Vec<String> {
        self.locks.lock().keys().cloned().collect()
    }

    /// Returns true if `name` is currently held.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .lock()
            .get(name)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Returns the number of successful acquisitions.
    pub fn acquisition_count(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Returns the number of acquisitions that timed out.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LockProvider for InProcessLocks {
    async fn acquire(&self, name: &str, wait: Duration) -> Result<LockGuard, LockError> {
        let slot = self.slot(name);
        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => {
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                debug!(lock = %name, "Acquired lock");
                Ok(LockGuard::new(name, Held::Local(guard)))
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(lock = %name, wait_ms = wait.as_millis() as u64, "Lock wait expired");
                Err(LockError::Timeout {
                    name: name.to_string(),
                    waited: wait,
                })
            }
        }
    }
}
