//! In-memory per-user activity tracking
//!
//! Idle decisions are made on a monotonic clock so wall-clock jumps (NTP
//! steps, suspend/resume) never reap a user early.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// user id → last-touch instant
#[derive(Default)]
pub struct ActivityTracker {
    touches: DashMap<u64, Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for a user. Called on every authenticated request
    /// and on realtime channel traffic.
    pub fn touch(&self, user_id: u64) {
        self.touches.insert(user_id, Instant::now());
    }

    /// Time since the user's last touch, if the user is known.
    pub fn idle_for(&self, user_id: u64) -> Option<Duration> {
        self.touches.get(&user_id).map(|at| at.elapsed())
    }

    /// Forget a user entirely (container torn down).
    pub fn forget(&self, user_id: u64) {
        self.touches.remove(&user_id);
    }

    /// Point-in-time snapshot of idle ages for the reaper sweep.
    pub fn snapshot(&self) -> Vec<(u64, Duration)> {
        let now = Instant::now();
        self.touches
            .iter()
            .map(|entry| (*entry.key(), now.duration_since(*entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.touches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.touches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_and_idle() {
        let tracker = ActivityTracker::new();
        assert!(tracker.idle_for(1).is_none());

        tracker.touch(1);
        let idle = tracker.idle_for(1).unwrap();
        assert!(idle < Duration::from_secs(1));
    }

    #[test]
    fn test_snapshot_lists_all_users() {
        let tracker = ActivityTracker::new();
        tracker.touch(1);
        tracker.touch(2);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_forget() {
        let tracker = ActivityTracker::new();
        tracker.touch(9);
        tracker.forget(9);
        assert!(tracker.idle_for(9).is_none());
        assert!(tracker.is_empty());
    }
}
