//! One storage shard backed by a pair of fjall partitions.
//!
//! A `Store` owns a data partition and a TTL index partition inside the
//! shared keyspace. Records carry a one-byte type tag and an expire-at word
//! so type checks and expiry have real on-disk representation. The change
//! counter is the replication position for this shard.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stats::ms_since_epoch;

/// Id of the dedicated metadata shard.
pub const CATALOG_NAME: &str = "catalog";

/// Record type tag for plain string values.
pub const RECORD_STRING: u8 = 0;

const RECORD_HEADER_LEN: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    ReadWrite,
    ReplicateOnly,
    StoreNone,
}

/// A decoded record: type tag, absolute expiry (0 means none) and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub record_type: u8,
    pub expire_at_ms: u64,
    pub value: Vec<u8>,
}

pub struct Store {
    id: String,
    keyspace: Arc<Keyspace>,
    data: PartitionHandle,
    ttl: PartitionHandle,
    mode: RwLock<StoreMode>,
    paused: AtomicBool,
    stopped: AtomicBool,
    /// Replication position: bumped once per applied write.
    changes: AtomicU64,
    version_increase: bool,
    stat_reads: AtomicU64,
    stat_writes: AtomicU64,
}

fn encode_record(record_type: u8, expire_at_ms: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + value.len());
    out.push(record_type);
    out.extend_from_slice(&expire_at_ms.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_record(raw: &[u8]) -> Result<Record> {
    if raw.len() < RECORD_HEADER_LEN {
        return Err(Error::internal("record shorter than header"));
    }
    let mut expire = [0u8; 8];
    expire.copy_from_slice(&raw[1..9]);
    Ok(Record {
        record_type: raw[0],
        expire_at_ms: u64::from_be_bytes(expire),
        value: raw[RECORD_HEADER_LEN..].to_vec(),
    })
}

fn encode_ttl_key(expire_at_ms: u64, data_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data_key.len());
    out.extend_from_slice(&expire_at_ms.to_be_bytes());
    out.extend_from_slice(data_key);
    out
}

impl Store {
    /// Open (or create) the shard partitions inside the shared keyspace.
    pub fn open(
        keyspace: Arc<Keyspace>,
        id: &str,
        mode: StoreMode,
        version_increase: bool,
    ) -> Result<Arc<Store>> {
        let data_name = if id == CATALOG_NAME {
            CATALOG_NAME.to_string()
        } else {
            format!("store_{id}")
        };
        let ttl_name = format!("{data_name}_ttl");
        let data = keyspace.open_partition(&data_name, PartitionCreateOptions::default())?;
        let ttl = keyspace.open_partition(&ttl_name, PartitionCreateOptions::default())?;
        Ok(Arc::new(Store {
            id: id.to_string(),
            keyspace,
            data,
            ttl,
            mode: RwLock::new(mode),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            changes: AtomicU64::new(0),
            version_increase,
            stat_reads: AtomicU64::new(0),
            stat_writes: AtomicU64::new(0),
        }))
    }

    pub fn db_id(&self) -> &str {
        &self.id
    }

    pub fn get_mode(&self) -> StoreMode {
        *self.mode.read().unwrap()
    }

    /// Switch the in-memory mode, persisting pending writes first. The caller
    /// must hold the exclusive lock on this shard and is responsible for
    /// updating the catalog afterwards.
    pub fn set_mode(&self, mode: StoreMode) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncData)?;
        *self.mode.write().unwrap() = mode;
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(Error::internal(format!("store {} is stopped", self.id)));
        }
        if self.get_mode() == StoreMode::StoreNone {
            return Err(Error::internal(format!("store {} is destroyed", self.id)));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.is_paused() {
            return Err(Error::busy(format!("store {} is paused", self.id)));
        }
        Ok(())
    }

    /// Write one record. `expire_at_ms` of `None` stores a non-expiring value.
    pub fn set(&self, key: &[u8], value: &[u8], expire_at_ms: Option<u64>) -> Result<()> {
        self.set_typed(key, RECORD_STRING, value, expire_at_ms)
    }

    pub fn set_typed(
        &self,
        key: &[u8],
        record_type: u8,
        value: &[u8],
        expire_at_ms: Option<u64>,
    ) -> Result<()> {
        self.ensure_writable()?;
        let expire = expire_at_ms.unwrap_or(0);
        let mut batch = self.keyspace.batch();
        batch.insert(&self.data, key, encode_record(record_type, expire, value));
        if expire > 0 {
            batch.insert(&self.ttl, encode_ttl_key(expire, key), Vec::<u8>::new());
        }
        batch.commit()?;
        self.stat_writes.fetch_add(1, Ordering::Relaxed);
        if self.version_increase {
            self.changes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Read a record, treating lazily anything already past its expiry as
    /// absent. The reaper removes the physical entry later.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        self.ensure_open()?;
        self.stat_reads.fetch_add(1, Ordering::Relaxed);
        let Some(raw) = self.data.get(key)? else {
            return Ok(None);
        };
        let record = decode_record(&raw)?;
        if record.expire_at_ms > 0 && record.expire_at_ms <= ms_since_epoch() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Type tag of the live record under `key`, if any.
    pub fn record_type(&self, key: &[u8]) -> Result<Option<u8>> {
        Ok(self.get(key)?.map(|r| r.record_type))
    }

    pub fn del(&self, key: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        let existed = self.data.get(key)?.is_some();
        if existed {
            self.data.remove(key)?;
            self.stat_writes.fetch_add(1, Ordering::Relaxed);
            if self.version_increase {
                self.changes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(existed)
    }

    /// Count live records under a key prefix.
    pub fn count_prefix(&self, prefix: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        let now = ms_since_epoch();
        let mut count = 0u64;
        for item in self.data.prefix(prefix.to_vec()) {
            let (_, raw) = item?;
            let record = decode_record(&raw)?;
            if record.expire_at_ms == 0 || record.expire_at_ms > now {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Materialize every live record, e.g. for a full-sync snapshot.
    pub fn export_all(&self) -> Result<Vec<(Vec<u8>, Record)>> {
        self.ensure_open()?;
        let now = ms_since_epoch();
        let mut out = Vec::new();
        for item in self.data.iter() {
            let (key, raw) = item?;
            let record = decode_record(&raw)?;
            if record.expire_at_ms == 0 || record.expire_at_ms > now {
                out.push((key.to_vec(), record));
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> Result<bool> {
        match self.data.iter().next() {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(err)) => Err(err.into()),
        }
    }

    /// Delete records whose expiry is at or before `now_ms`. Returns the
    /// number of records reaped, at most `limit` per call.
    pub fn reap_expired(&self, now_ms: u64, limit: u64) -> Result<u64> {
        self.ensure_open()?;
        let upper = encode_ttl_key(now_ms.saturating_add(1), b"");
        let mut reaped = 0u64;
        let mut stale_index: Vec<Vec<u8>> = Vec::new();
        let mut dead: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for item in self.ttl.range(Vec::<u8>::new()..upper) {
            if reaped + stale_index.len() as u64 >= limit {
                break;
            }
            let (ttl_key, _) = item?;
            let mut expire = [0u8; 8];
            expire.copy_from_slice(&ttl_key[..8]);
            let expire_at = u64::from_be_bytes(expire);
            let data_key = ttl_key[8..].to_vec();
            match self.data.get(&data_key)? {
                // The live record still carries this expiry, so it is dead.
                Some(raw) if decode_record(&raw)?.expire_at_ms == expire_at => {
                    reaped += 1;
                    dead.push((ttl_key.to_vec(), data_key));
                }
                // Overwritten or already gone: the index entry is stale.
                _ => stale_index.push(ttl_key.to_vec()),
            }
        }
        let mut batch = self.keyspace.batch();
        for (ttl_key, data_key) in &dead {
            batch.remove(&self.ttl, ttl_key.clone());
            batch.remove(&self.data, data_key.clone());
        }
        for ttl_key in &stale_index {
            batch.remove(&self.ttl, ttl_key.clone());
        }
        batch.commit()?;
        Ok(reaped)
    }

    pub fn approximate_keys(&self) -> u64 {
        self.data.approximate_len() as u64
    }

    pub fn disk_space(&self) -> u64 {
        self.data.disk_space() + self.ttl.disk_space()
    }

    pub fn get_int_property(&self, name: &str) -> Result<u64> {
        match name {
            "shale.approximate-keys" => Ok(self.approximate_keys()),
            "shale.disk-space" => Ok(self.disk_space()),
            "shale.changes" => Ok(self.changes()),
            "shale.reads" => Ok(self.stat_reads.load(Ordering::Relaxed)),
            "shale.writes" => Ok(self.stat_writes.load(Ordering::Relaxed)),
            _ => Err(Error::not_found(format!("unknown property {name}"))),
        }
    }

    pub fn get_property(&self, name: &str) -> Result<String> {
        self.get_int_property(name).map(|v| v.to_string())
    }

    pub fn reset_statistics(&self) {
        self.stat_reads.store(0, Ordering::Relaxed);
        self.stat_writes.store(0, Ordering::Relaxed);
    }

    /// Drop the shard's partitions. The caller must have persisted the
    /// `StoreNone` catalog record first; an orphan record is safely
    /// re-destroyable, destroyed-but-recorded-alive is not.
    pub fn destroy(&self) -> Result<()> {
        self.keyspace.delete_partition(self.data.clone())?;
        self.keyspace.delete_partition(self.ttl.clone())?;
        *self.mode.write().unwrap() = StoreMode::StoreNone;
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and mark the shard stopped. Further access errors out.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        if self.get_mode() != StoreMode::StoreNone {
            self.keyspace.persist(PersistMode::SyncData)?;
        }
        Ok(())
    }
}

/// Prefix a user key with its logical database id.
pub fn encode_data_key(db_id: u32, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len());
    out.extend_from_slice(&db_id.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// The db-id prefix used for whole-database scans.
pub fn db_prefix(db_id: u32) -> Vec<u8> {
    db_id.to_be_bytes().to_vec()
}
