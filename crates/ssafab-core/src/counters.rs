//! Runtime statistics served over the admin link.
//!
//! A fixed table of 64-bit counters shared by all pipelines of a node.
//! Counter ids are stable: the admin `Counter` response is a vector
//! indexed by [`CounterId`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifiers of the runtime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CounterId {
    /// Number of database updates applied.
    DbUpdates = 0,
    /// Epoch of the current database.
    DbEpoch = 1,
    /// Wall-clock seconds of the first database update.
    DbFirstUpdateTime = 2,
    /// Wall-clock seconds of the latest database update.
    DbLastUpdateTime = 3,
    /// Wall-clock seconds of the latest SSA MAD received.
    LastSsaMadTime = 4,
    /// Wall-clock seconds of the latest upstream connect.
    LastUpstreamConnTime = 5,
    /// Wall-clock seconds of the latest downstream accept.
    LastDownstreamConnTime = 6,
    /// Current number of downstream children.
    NumChildren = 7,
    /// Access PRDB computations currently in flight.
    NumAccessTasks = 8,
}

/// Total number of counters.
pub const COUNTER_COUNT: usize = 9;

/// The shared counter table.
#[derive(Debug, Default)]
pub struct Counters {
    values: [AtomicU64; COUNTER_COUNT],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: CounterId, value: u64) {
        self.values[id as usize].store(value, Ordering::Relaxed);
    }

    pub fn inc(&self, id: CounterId) -> u64 {
        self.values[id as usize].fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dec(&self, id: CounterId) -> u64 {
        self.values[id as usize].fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn get(&self, id: CounterId) -> u64 {
        self.values[id as usize].load(Ordering::Relaxed)
    }

    /// Stamps a timestamp counter with the current wall-clock seconds.
    pub fn set_time(&self, id: CounterId) {
        self.set(id, now_secs());
    }

    /// Records a database update: count, epoch, and the first/last
    /// update timestamps.
    pub fn record_db_update(&self, epoch: u64) {
        if self.get(CounterId::DbFirstUpdateTime) == 0 {
            self.set_time(CounterId::DbFirstUpdateTime);
        }
        self.set_time(CounterId::DbLastUpdateTime);
        self.inc(CounterId::DbUpdates);
        self.set(CounterId::DbEpoch, epoch);
    }

    /// Snapshot of the whole table.
    pub fn snapshot(&self) -> Vec<u64> {
        self.values
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect()
    }
}

/// Current wall-clock time in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_db_update_tracks_count_and_epoch() {
        let counters = Counters::new();
        counters.record_db_update(5);
        counters.record_db_update(6);
        assert_eq!(counters.get(CounterId::DbUpdates), 2);
        assert_eq!(counters.get(CounterId::DbEpoch), 6);
        assert!(counters.get(CounterId::DbFirstUpdateTime) > 0);
        assert!(
            counters.get(CounterId::DbLastUpdateTime)
                >= counters.get(CounterId::DbFirstUpdateTime)
        );
    }

    #[test]
    fn snapshot_has_one_slot_per_counter() {
        let counters = Counters::new();
        counters.set(CounterId::NumChildren, 4);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.len(), COUNTER_COUNT);
        assert_eq!(snapshot[CounterId::NumChildren as usize], 4);
    }

    #[test]
    fn inc_dec_are_symmetric() {
        let counters = Counters::new();
        counters.inc(CounterId::NumAccessTasks);
        counters.inc(CounterId::NumAccessTasks);
        counters.dec(CounterId::NumAccessTasks);
        assert_eq!(counters.get(CounterId::NumAccessTasks), 1);
    }
}
