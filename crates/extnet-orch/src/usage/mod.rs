//! Usage collection and reconciliation.
//!
//! [`UsageCollector`] runs as a [`PeriodicTask`](extnet_common::PeriodicTask).
//! Each tick walks every zone under that zone's lock, queries each appliance
//! once, and folds the reported counters into usage rows with
//! [`reconcile_counter`]. Failures are logged and counted, never propagated
//! past the tick.

mod collector;
mod reconcile;

pub use collector::{usage_lock_name, UsageCollector};
pub use reconcile::{apply_reading, reconcile_counter, ByteCounters};
