//! In-memory validator liveness tracking. Resets on restart and has no
//! consensus impact; miners use it for grace-period decisions and health
//! surfaces read it for reporting.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::crypto::signature::PUBKEY_LEN;

/// Liveness counters for one validator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    /// Unix time of the last heartbeat, 0 = never
    pub last_heartbeat: u64,
    /// Unix time of the last block produced, 0 = never
    pub last_block: u64,
    /// Blocks produced since this process started
    pub block_count: u64,
    /// Slots missed since this process started
    pub missed_count: u64,
}

pub struct ValidatorTracker {
    stats: DashMap<[u8; PUBKEY_LEN], ValidatorStats>,
    heartbeat_interval: u64,
}

impl ValidatorTracker {
    pub fn new(heartbeat_interval: u64) -> Self {
        Self {
            stats: DashMap::new(),
            heartbeat_interval,
        }
    }

    pub fn record_heartbeat(&self, pubkey: [u8; PUBKEY_LEN]) {
        let now = unix_now();
        self.stats.entry(pubkey).or_default().last_heartbeat = now;
    }

    pub fn record_block(&self, pubkey: [u8; PUBKEY_LEN]) {
        let now = unix_now();
        let mut entry = self.stats.entry(pubkey).or_default();
        entry.last_block = now;
        entry.block_count += 1;
    }

    pub fn record_missed(&self, pubkey: [u8; PUBKEY_LEN]) {
        self.stats.entry(pubkey).or_default().missed_count += 1;
    }

    /// A validator is online if it heartbeated within two intervals.
    pub fn is_online(&self, pubkey: &[u8; PUBKEY_LEN]) -> bool {
        match self.stats.get(pubkey) {
            Some(stats) if stats.last_heartbeat > 0 => {
                unix_now().saturating_sub(stats.last_heartbeat) <= 2 * self.heartbeat_interval
            }
            _ => false,
        }
    }

    pub fn get(&self, pubkey: &[u8; PUBKEY_LEN]) -> Option<ValidatorStats> {
        self.stats.get(pubkey).map(|s| *s)
    }

    pub fn snapshot(&self) -> Vec<([u8; PUBKEY_LEN], ValidatorStats)> {
        self.stats.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_marks_online() {
        let tracker = ValidatorTracker::new(30);
        let pk = [0x02u8; PUBKEY_LEN];
        assert!(!tracker.is_online(&pk));
        tracker.record_heartbeat(pk);
        assert!(tracker.is_online(&pk));
    }

    #[test]
    fn counters_accumulate() {
        let tracker = ValidatorTracker::new(30);
        let pk = [0x03u8; PUBKEY_LEN];
        tracker.record_block(pk);
        tracker.record_block(pk);
        tracker.record_missed(pk);

        let stats = tracker.get(&pk).expect("stats");
        assert_eq!(stats.block_count, 2);
        assert_eq!(stats.missed_count, 1);
        assert!(stats.last_block > 0);
    }

    #[test]
    fn snapshot_covers_all_tracked() {
        let tracker = ValidatorTracker::new(30);
        tracker.record_heartbeat([1u8; PUBKEY_LEN]);
        tracker.record_heartbeat([2u8; PUBKEY_LEN]);
        assert_eq!(tracker.snapshot().len(), 2);
    }
}
