//! Background TTL reaper.
//!
//! One owned task ticks once per second and sweeps each shard's TTL index,
//! deleting records that are past their expiry. Shards can be masked out
//! individually when they are being destroyed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::server::Server;
use crate::stats::ms_since_epoch;
use crate::store::StoreMode;

/// Records reaped per shard per sweep.
const REAP_BATCH: u64 = 512;

pub struct IndexManager {
    server: Weak<Server>,
    stopped_stores: Arc<Mutex<HashSet<u32>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IndexManager {
    pub fn new(server: Weak<Server>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            server,
            stopped_stores: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn startup(self: &Arc<Self>) -> Result<()> {
        let server = self.server.clone();
        let stopped_stores = Arc::clone(&self.stopped_stores);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(server) = server.upgrade() else { break };
                sweep(&server, &stopped_stores);
            }
            tracing::debug!("index manager exits");
        });
        *self.task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Mask a shard out of future sweeps.
    pub fn stop_store(&self, store_id: u32) -> Result<()> {
        self.stopped_stores.lock().unwrap().insert(store_id);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "index manager join failed");
            }
        }
    }
}

fn sweep(server: &Arc<Server>, stopped_stores: &Mutex<HashSet<u32>>) {
    let now = ms_since_epoch();
    let count = server.kv_store_count();
    for store_id in 0..count {
        if stopped_stores.lock().unwrap().contains(&store_id) {
            continue;
        }
        let Ok(store) = server.store(store_id) else {
            continue;
        };
        if store.get_mode() != StoreMode::ReadWrite || store.is_paused() {
            continue;
        }
        match store.reap_expired(now, REAP_BATCH) {
            Ok(0) => {}
            Ok(reaped) => {
                server
                    .stat()
                    .expired_keys
                    .fetch_add(reaped, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(store_id = store_id, reaped = reaped, "expired keys reaped");
            }
            Err(err) => {
                tracing::warn!(store_id = store_id, error = %err, "ttl sweep failed");
            }
        }
    }
}
