//! Lock brokers: multi-granularity intention locks over shard targets and a
//! per-shard pessimistic key-lock table.
//!
//! Acquisition is bounded: a waiter that cannot be granted within the
//! manager's timeout fails with `Busy` instead of deadlocking.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Lock acquisition deadline before giving up with `Busy`.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared = 0,
    IntentionExclusive = 1,
    Shared = 2,
    Exclusive = 3,
}

/// Standard multi-granularity compatibility matrix.
fn compatible(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match (held, requested) {
        (Exclusive, _) | (_, Exclusive) => false,
        (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => false,
        (Shared, Shared)
        | (Shared, IntentionShared)
        | (IntentionShared, _)
        | (IntentionExclusive, IntentionShared)
        | (IntentionExclusive, IntentionExclusive) => true,
    }
}

#[derive(Default)]
struct TargetState {
    granted: [usize; 4],
}

impl TargetState {
    fn admits(&self, requested: LockMode) -> bool {
        for (mode_idx, count) in self.granted.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let held = match mode_idx {
                0 => LockMode::IntentionShared,
                1 => LockMode::IntentionExclusive,
                2 => LockMode::Shared,
                _ => LockMode::Exclusive,
            };
            if !compatible(held, requested) {
                return false;
            }
        }
        true
    }

    fn is_idle(&self) -> bool {
        self.granted.iter().all(|c| *c == 0)
    }
}

/// Intention-locking broker over named targets (one per shard).
pub struct MgLockMgr {
    targets: Mutex<HashMap<String, TargetState>>,
    released: Notify,
}

impl MgLockMgr {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            targets: Mutex::new(HashMap::new()),
            released: Notify::new(),
        })
    }

    fn try_grant(&self, target: &str, mode: LockMode) -> bool {
        let mut targets = self.targets.lock().unwrap();
        let state = targets.entry(target.to_string()).or_default();
        if state.admits(mode) {
            state.granted[mode as usize] += 1;
            true
        } else {
            false
        }
    }

    fn release(&self, target: &str, mode: LockMode) {
        let mut targets = self.targets.lock().unwrap();
        if let Some(state) = targets.get_mut(target) {
            state.granted[mode as usize] = state.granted[mode as usize].saturating_sub(1);
            if state.is_idle() {
                targets.remove(target);
            }
        }
        self.released.notify_waiters();
    }

    /// Acquire `mode` on `target`, waiting at most `LOCK_TIMEOUT`.
    pub async fn lock(self: &Arc<Self>, target: &str, mode: LockMode) -> Result<MgLockGuard> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            if self.try_grant(target, mode) {
                return Ok(MgLockGuard {
                    mgr: Arc::clone(self),
                    target: target.to_string(),
                    mode,
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::busy(format!("lock timeout on {target} ({mode:?})")));
            }
            // Wake on release; the slice cap bounds a wakeup racing the wait.
            let slice = deadline.min(Instant::now() + Duration::from_millis(50));
            let _ = tokio::time::timeout_at(slice, self.released.notified()).await;
        }
    }
}

/// Held multi-granularity lock; releases on drop.
pub struct MgLockGuard {
    mgr: Arc<MgLockMgr>,
    target: String,
    mode: LockMode,
}

impl MgLockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl std::fmt::Debug for MgLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MgLockGuard")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for MgLockGuard {
    fn drop(&mut self) {
        self.mgr.release(&self.target, self.mode);
    }
}

struct KeyLockSpace {
    held: Mutex<HashSet<Vec<u8>>>,
    released: Notify,
}

/// Per-shard key-lock tables used by conflicting writers. Keys are acquired
/// in sorted order so two writers locking overlapping sets cannot deadlock.
pub struct PessimisticMgr {
    spaces: Vec<KeyLockSpace>,
}

impl PessimisticMgr {
    pub fn new(store_count: u32) -> Arc<Self> {
        let spaces = (0..store_count.max(1))
            .map(|_| KeyLockSpace {
                held: Mutex::new(HashSet::new()),
                released: Notify::new(),
            })
            .collect();
        Arc::new(Self { spaces })
    }

    /// Lock a set of keys in one shard's lock space. All-or-nothing: either
    /// every key is acquired or the caller waits.
    pub async fn lock_keys(
        self: &Arc<Self>,
        store_id: u32,
        keys: &[&[u8]],
    ) -> Result<KeyLockGuard> {
        let space_idx = store_id as usize % self.spaces.len();
        let mut sorted: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        sorted.sort();
        sorted.dedup();

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            {
                let mut held = self.spaces[space_idx].held.lock().unwrap();
                if sorted.iter().all(|k| !held.contains(k)) {
                    for k in &sorted {
                        held.insert(k.clone());
                    }
                    return Ok(KeyLockGuard {
                        mgr: Arc::clone(self),
                        space_idx,
                        keys: sorted,
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::busy(format!("key lock timeout in store {store_id}")));
            }
            let slice = deadline.min(Instant::now() + Duration::from_millis(50));
            let _ = tokio::time::timeout_at(slice, self.spaces[space_idx].released.notified()).await;
        }
    }
}

/// Held key locks; releases on drop.
pub struct KeyLockGuard {
    mgr: Arc<PessimisticMgr>,
    space_idx: usize,
    keys: Vec<Vec<u8>>,
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("space_idx", &self.space_idx)
            .field("keys", &self.keys)
            .finish()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let space = &self.mgr.spaces[self.space_idx];
        let mut held = space.held.lock().unwrap();
        for k in &self.keys {
            held.remove(k);
        }
        drop(held);
        space.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        assert!(compatible(IntentionShared, IntentionShared));
        assert!(compatible(IntentionShared, IntentionExclusive));
        assert!(compatible(IntentionShared, Shared));
        assert!(!compatible(IntentionShared, Exclusive));
        assert!(compatible(IntentionExclusive, IntentionExclusive));
        assert!(!compatible(IntentionExclusive, Shared));
        assert!(compatible(Shared, Shared));
        assert!(!compatible(Shared, IntentionExclusive));
        assert!(!compatible(Exclusive, IntentionShared));
    }

    #[tokio::test]
    async fn shared_locks_coexist_and_exclusive_waits() {
        let mgr = MgLockMgr::new();
        let a = mgr.lock("store_0", LockMode::IntentionShared).await.unwrap();
        let _b = mgr.lock("store_0", LockMode::Shared).await.unwrap();

        // Exclusive cannot be granted while readers hold the target.
        let err = mgr.lock("store_0", LockMode::Exclusive).await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        drop(a);
        let err = mgr.lock("store_0", LockMode::Exclusive).await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[tokio::test]
    async fn exclusive_granted_after_release() {
        let mgr = MgLockMgr::new();
        let guard = mgr.lock("store_1", LockMode::IntentionShared).await.unwrap();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.lock("store_1", LockMode::Exclusive).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        let granted = waiter.await.unwrap();
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn different_targets_are_independent() {
        let mgr = MgLockMgr::new();
        let _x = mgr.lock("store_0", LockMode::Exclusive).await.unwrap();
        let other = mgr.lock("store_1", LockMode::Exclusive).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn key_locks_conflict_on_same_key_only() {
        let mgr = PessimisticMgr::new(3);
        let g = mgr
            .lock_keys(0, &[b"a".as_slice(), b"b".as_slice()])
            .await
            .unwrap();
        assert!(mgr.lock_keys(0, &[b"c".as_slice()]).await.is_ok());
        let err = mgr.lock_keys(0, &[b"b".as_slice()]).await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        drop(g);
        assert!(mgr.lock_keys(0, &[b"b".as_slice()]).await.is_ok());
    }

    #[tokio::test]
    async fn key_lock_spaces_are_per_shard() {
        let mgr = PessimisticMgr::new(2);
        let _g = mgr.lock_keys(0, &[b"k".as_slice()]).await.unwrap();
        assert!(mgr.lock_keys(1, &[b"k".as_slice()]).await.is_ok());
    }
}
