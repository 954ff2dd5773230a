//! Nonce replay window
//!
//! Signed requests carry a single-use nonce; replaying one inside the TTL
//! window is rejected. The store is a concurrent map with opportunistic
//! housekeeping instead of a timer: expired entries are dropped whenever
//! the map grows past a coarse threshold.

use dashmap::DashMap;

/// Entries tolerated before a housekeeping pass runs.
const CLEANUP_THRESHOLD: usize = 4096;

pub struct NonceStore {
    seen: DashMap<String, u64>,
    ttl_secs: u64,
}

impl NonceStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            seen: DashMap::new(),
            ttl_secs,
        }
    }

    /// Record the nonce; false when it was already seen inside the TTL.
    pub fn check_and_record(&self, nonce: &str, now_secs: u64) -> bool {
        if self.seen.len() > CLEANUP_THRESHOLD {
            self.housekeep(now_secs);
        }

        if let Some(first_seen) = self.seen.get(nonce) {
            if now_secs.saturating_sub(*first_seen) <= self.ttl_secs {
                return false;
            }
        }
        self.seen.insert(nonce.to_string(), now_secs);
        true
    }

    fn housekeep(&self, now_secs: u64) {
        self.seen
            .retain(|_, first_seen| now_secs.saturating_sub(*first_seen) <= self.ttl_secs);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
