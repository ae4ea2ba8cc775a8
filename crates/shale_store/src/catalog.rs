//! Metadata shard: per-store mode records.
//!
//! The catalog is a dedicated `Store` that is not part of the user shard
//! array. It is the durable truth for shard modes: the in-memory mode of a
//! shard always matches its last persisted `StoreMainMeta`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{Store, StoreMode};

/// Persisted `{store_id -> store_mode}` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMainMeta {
    pub store_id: u32,
    pub store_mode: StoreMode,
}

pub struct Catalog {
    store: Arc<Store>,
    kv_store_count: u32,
    chunk_size: u32,
}

fn meta_key(store_id: u32) -> Vec<u8> {
    format!("store-meta/{store_id}").into_bytes()
}

impl Catalog {
    pub fn new(store: Arc<Store>, kv_store_count: u32, chunk_size: u32) -> Self {
        Self {
            store,
            kv_store_count,
            chunk_size,
        }
    }

    pub fn kv_store_count(&self) -> u32 {
        self.kv_store_count
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn store_main_meta(&self, store_id: u32) -> Result<StoreMainMeta> {
        let Some(record) = self.store.get(&meta_key(store_id))? else {
            return Err(Error::not_found(format!("store main meta {store_id}")));
        };
        let meta: StoreMainMeta = serde_json::from_slice(&record.value)?;
        Ok(meta)
    }

    pub fn set_store_main_meta(&self, meta: &StoreMainMeta) -> Result<()> {
        let encoded = serde_json::to_vec(meta)?;
        self.store.set(&meta_key(meta.store_id), &encoded, None)
    }

    pub fn stop(&self) -> Result<()> {
        self.store.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CATALOG_NAME;
    use fjall::Keyspace;

    fn temp_keyspace(tag: &str) -> Arc<Keyspace> {
        let dir = std::env::temp_dir().join(format!(
            "shale-catalog-{tag}-{}-{}",
            std::process::id(),
            crate::stats::ns_since_epoch()
        ));
        Arc::new(fjall::Config::new(dir).open().unwrap())
    }

    fn open_catalog(keyspace: Arc<Keyspace>) -> Catalog {
        let store = Store::open(keyspace, CATALOG_NAME, StoreMode::ReadWrite, true).unwrap();
        Catalog::new(store, 3, 0x4000)
    }

    #[test]
    fn missing_meta_is_not_found() {
        let catalog = open_catalog(temp_keyspace("missing"));
        let err = catalog.store_main_meta(0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn meta_roundtrip_and_update() {
        let keyspace = temp_keyspace("roundtrip");
        let catalog = open_catalog(keyspace.clone());
        catalog
            .set_store_main_meta(&StoreMainMeta {
                store_id: 1,
                store_mode: StoreMode::ReadWrite,
            })
            .unwrap();
        assert_eq!(
            catalog.store_main_meta(1).unwrap().store_mode,
            StoreMode::ReadWrite
        );

        catalog
            .set_store_main_meta(&StoreMainMeta {
                store_id: 1,
                store_mode: StoreMode::ReplicateOnly,
            })
            .unwrap();
        assert_eq!(
            catalog.store_main_meta(1).unwrap().store_mode,
            StoreMode::ReplicateOnly
        );

        // A fresh catalog over the same keyspace observes the persisted mode.
        let reopened = open_catalog(keyspace);
        assert_eq!(
            reopened.store_main_meta(1).unwrap().store_mode,
            StoreMode::ReplicateOnly
        );
    }
}
