//! Rollover-safe accounting of raw appliance byte counters.
//!
//! An appliance reports the raw value of each counter. The stored row keeps
//! the last raw value (`current`) and everything accumulated before the last
//! counter reset (`net`). A reading below the stored raw value means the
//! counter restarted, so the previous period is rolled into `net`.

use crate::types::UsageStatsRow;
use chrono::{DateTime, Utc};

/// One `[sent, received]` reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub sent: u64,
    pub received: u64,
}

impl ByteCounters {
    pub fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }
}

impl From<[u64; 2]> for ByteCounters {
    fn from(raw: [u64; 2]) -> Self {
        Self {
            sent: raw[0],
            received: raw[1],
        }
    }
}

/// Reconciles one counter; returns `(current, net)` to store.
pub fn reconcile_counter(old_current: u64, old_net: u64, new_current: u64) -> (u64, u64) {
    if new_current < old_current {
        (new_current, old_net.saturating_add(old_current))
    } else {
        (new_current, old_net)
    }
}

/// Applies a reading to a row, sent and received independently.
///
/// Returns true if either counter rolled over.
pub fn apply_reading(row: &mut UsageStatsRow, reading: ByteCounters, at: DateTime<Utc>) -> bool {
    let rolled = reading.sent < row.current_bytes_sent || reading.received < row.current_bytes_received;

    let (current, net) = reconcile_counter(row.current_bytes_sent, row.net_bytes_sent, reading.sent);
    row.current_bytes_sent = current;
    row.net_bytes_sent = net;

    let (current, net) = reconcile_counter(
        row.current_bytes_received,
        row.net_bytes_received,
        reading.received,
    );
    row.current_bytes_received = current;
    row.net_bytes_received = net;

    row.updated_at = Some(at);
    rolled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UsageKey;
    use pretty_assertions::assert_eq;

    fn row(current_sent: u64, net_sent: u64, current_received: u64, net_received: u64) -> UsageStatsRow {
        let mut row = UsageStatsRow::new(UsageKey {
            account_id: 1,
            zone_id: 1,
            network_id: 1,
            public_ip: None,
            appliance_id: 1,
        });
        row.current_bytes_sent = current_sent;
        row.net_bytes_sent = net_sent;
        row.current_bytes_received = current_received;
        row.net_bytes_received = net_received;
        row
    }

    #[test]
    fn test_counter_reset_rolls_previous_period_into_net() {
        assert_eq!(reconcile_counter(1000, 5000, 800), (800, 6000));
    }

    #[test]
    fn test_monotonic_counter_leaves_net_unchanged() {
        assert_eq!(reconcile_counter(1000, 5000, 1500), (1500, 5000));
        assert_eq!(reconcile_counter(1000, 5000, 1000), (1000, 5000));
    }

    #[test]
    fn test_sent_and_received_reconcile_independently() {
        let mut r = row(1000, 5000, 200, 300);
        let rolled = apply_reading(&mut r, ByteCounters::new(800, 900), Utc::now());
        assert!(rolled);
        assert_eq!((r.current_bytes_sent, r.net_bytes_sent), (800, 6000));
        assert_eq!((r.current_bytes_received, r.net_bytes_received), (900, 300));
        assert!(r.updated_at.is_some());
    }

    #[test]
    fn test_totals_survive_a_reboot() {
        let mut r = row(0, 0, 0, 0);
        for reading in [100, 400, 50, 80] {
            apply_reading(&mut r, ByteCounters::new(reading, 0), Utc::now());
        }
        // 400 before the reset plus 80 after it
        assert_eq!(r.total_sent(), 480);
    }

    #[test]
    fn test_from_raw_pair() {
        assert_eq!(ByteCounters::from([3, 4]), ByteCounters::new(3, 4));
    }
}
