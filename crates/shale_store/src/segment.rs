//! Key routing: FNV-hash a key into a chunk, map the chunk to its owning
//! shard, and hand back the store together with a held multi-granularity
//! lock.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::locks::{LockMode, MgLockGuard, MgLockMgr};
use crate::store::Store;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit hash. Stable across versions and platforms; the chunk
/// assignment of a key must never change under the server's feet.
pub fn fnv1a64(key: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for b in key {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A store handle bundled with the lock that protects it.
pub struct DbHandle {
    pub store: Arc<Store>,
    pub chunk_id: Option<u32>,
    _guard: MgLockGuard,
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle")
            .field("chunk_id", &self.chunk_id)
            .field("guard", &self._guard)
            .finish()
    }
}

pub struct SegmentMgr {
    stores: Vec<Arc<Store>>,
    chunk_size: u32,
    locks: Arc<MgLockMgr>,
}

impl SegmentMgr {
    pub fn new(stores: Vec<Arc<Store>>, chunk_size: u32, locks: Arc<MgLockMgr>) -> Self {
        Self {
            stores,
            chunk_size: chunk_size.max(1),
            locks,
        }
    }

    pub fn store_count(&self) -> u32 {
        self.stores.len() as u32
    }

    pub fn chunk_of(&self, key: &[u8]) -> u32 {
        (fnv1a64(key) % u64::from(self.chunk_size)) as u32
    }

    pub fn store_id_of(&self, key: &[u8]) -> u32 {
        self.chunk_of(key) % self.store_count()
    }

    /// Lock and return the store that owns `store_id`.
    pub async fn get_db(&self, store_id: u32, mode: LockMode) -> Result<DbHandle> {
        let Some(store) = self.stores.get(store_id as usize) else {
            return Err(Error::not_found(format!("store {store_id}")));
        };
        let guard = self
            .locks
            .lock(&format!("store_{store_id}"), mode)
            .await?;
        Ok(DbHandle {
            store: Arc::clone(store),
            chunk_id: None,
            _guard: guard,
        })
    }

    /// Lock and return the store that owns `key`.
    pub async fn get_db_by_key(&self, key: &[u8], mode: LockMode) -> Result<DbHandle> {
        let chunk = self.chunk_of(key);
        let store_id = chunk % self.store_count();
        let mut handle = self.get_db(store_id, mode).await?;
        handle.chunk_id = Some(chunk);
        Ok(handle)
    }
}
