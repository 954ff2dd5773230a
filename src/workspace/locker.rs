//! Per-user operation serialization
//!
//! Container and run-state mutations for one user must never interleave:
//! the reaper stopping a container while a request is ensuring it, or two
//! concurrent launches, would race on the same on-disk state. A keyed
//! mutex map gives every user their own lock; across users nothing
//! serializes.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-user async mutexes. Lock entries are created on demand and
/// kept for the process lifetime; the per-user footprint is one Arc.
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the user's lock, waiting if another operation holds it.
    pub async fn acquire(&self, user_id: u64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Acquire without waiting; `None` when another operation is active.
    pub fn try_acquire(&self, user_id: u64) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_user_serializes() {
        let locks = UserLocks::new();
        let guard = locks.acquire(1).await;
        assert!(locks.try_acquire(1).is_none());
        drop(guard);
        assert!(locks.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn test_different_users_do_not_block() {
        let locks = UserLocks::new();
        let _one = locks.acquire(1).await;
        let _two = locks.acquire(2).await;
        assert!(locks.try_acquire(3).is_some());
    }
}
