//! Common orchestration primitives for extnet.
//!
//! This crate provides the building blocks shared by the appliance control
//! plane:
//!
//! - [`LockProvider`]: Named, bounded-wait locks keyed by resource domain
//! - [`run_in_transaction`]: Unit-of-work helper with commit/rollback
//! - [`PeriodicTask`]: Trait for work driven by the daemon's scheduler
//! - [`TaskStatus`]: Outcome classification for a scheduler tick
//!
//! # Locking model
//!
//! Every mutation of shared orchestration state happens while holding a
//! [`LockGuard`] obtained from a [`LockProvider`]. Acquisition always has a
//! bounded wait and fails closed with [`LockError::Timeout`]. The guard
//! releases the lock when dropped, so every exit path (including `?`
//! propagation) gives the lock back.
//!
//! ```ignore
//! use extnet_common::{InProcessLocks, LockProvider};
//! use std::time::Duration;
//!
//! let locks = InProcessLocks::new();
//! let _guard = locks.acquire("device-map", Duration::from_secs(30)).await?;
//! // ... mutate mappings ...
//! // guard dropped here, lock released
//! ```

mod lock;
#[cfg(feature = "redis")]
mod redis_lock;
mod task;
mod transaction;

pub use lock::{InProcessLocks, LockError, LockGuard, LockProvider};
#[cfg(feature = "redis")]
pub use redis_lock::{RedisLockConfig, RedisLockProvider};
pub use task::{PeriodicTask, TaskError, TaskResult, TaskStatus, TickReport};
pub use transaction::run_in_transaction;
