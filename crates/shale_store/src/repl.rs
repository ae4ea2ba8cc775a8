//! Replication manager: custody of sockets borrowed from client sessions.
//!
//! The dispatcher hands a replica's connection here when it sees `FULLSYNC`
//! or `INCRSYNC`; from that point the session framework never touches the
//! socket again. Full-sync streams a snapshot of the requested shard;
//! incr-sync validates the requested position against the shard's change
//! counter, registers the replica, and keeps the connection alive with
//! periodic pings. The sync protocol state machines beyond registration and
//! snapshot supply live with the replica side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::network::ReplicaConn;
use crate::server::Server;

struct ReplicaState {
    dst_store_id: u32,
    listen_addr: String,
    cancel: watch::Sender<bool>,
}

pub struct ReplManager {
    server: Weak<Server>,
    running: AtomicBool,
    replicas: Mutex<HashMap<u32, Vec<ReplicaState>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn parse_store_id(raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|_| Error::parse_packet(format!("invalid store id {raw}")))
}

impl ReplManager {
    pub fn new(server: Weak<Server>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            server,
            running: AtomicBool::new(false),
            replicas: Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The network must already be prepared so replicas can reach us; there
    /// is nothing else to set up on the master side.
    pub fn startup(&self) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Number of registered incremental replicas for a shard.
    pub fn replica_count(&self, store_id: u32) -> usize {
        self.replicas
            .lock()
            .unwrap()
            .get(&store_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Stream a full snapshot of `store_id` over the borrowed connection.
    /// The connection is owned by this manager from here on.
    pub fn supply_full_sync(
        self: &Arc<Self>,
        mut conn: ReplicaConn,
        store_id: &str,
        dst_store_id: &str,
        pos: &str,
    ) {
        let manager = Arc::clone(self);
        let store_id = store_id.to_string();
        let dst = dst_store_id.to_string();
        let pos = pos.to_string();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let result = manager.run_full_sync(&mut conn, &store_id, &dst, &pos).await;
            if let Err(err) = result {
                tracing::warn!(store_id = %store_id, error = %err, "full sync failed");
                return;
            }
            // Retain the socket until the replica hangs up or we stop.
            let stream = conn.get_mut();
            let mut probe = [0u8; 1];
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = stream.peek(&mut probe) => {}
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    async fn run_full_sync(
        &self,
        conn: &mut ReplicaConn,
        store_id: &str,
        _dst_store_id: &str,
        _pos: &str,
    ) -> Result<()> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| Error::internal("server is gone"))?;
        let id = parse_store_id(store_id)?;
        let store = server.store(id)?;
        let entries = store.export_all()?;
        let changes = store.changes();

        let mut payload = Vec::with_capacity(64 + entries.len() * 32);
        payload.extend_from_slice(format!("*{}\r\n", entries.len() * 2).as_bytes());
        for (key, record) in &entries {
            payload.extend_from_slice(format!("${}\r\n", key.len()).as_bytes());
            payload.extend_from_slice(key);
            payload.extend_from_slice(b"\r\n");
            payload.extend_from_slice(format!("${}\r\n", record.value.len()).as_bytes());
            payload.extend_from_slice(&record.value);
            payload.extend_from_slice(b"\r\n");
        }
        payload.extend_from_slice(format!("+FULLSYNC-END {changes}\r\n").as_bytes());

        let stream = conn.get_mut();
        stream.write_all(&payload).await?;
        stream.flush().await?;
        tracing::info!(
            store_id = id,
            entries = entries.len(),
            changes = changes,
            "full sync supplied"
        );
        Ok(())
    }

    /// Register an incremental replica. Returns whether the registration was
    /// accepted; the connection is owned by this manager either way.
    pub fn register_incr_sync(
        self: &Arc<Self>,
        mut conn: ReplicaConn,
        store_id: &str,
        dst_store_id: &str,
        pos: &str,
        listen_ip: &str,
        listen_port: &str,
    ) -> bool {
        if !self.running.load(Ordering::Relaxed) {
            return false;
        }
        let Some(server) = self.server.upgrade() else {
            return false;
        };
        let (Ok(id), Ok(dst)) = (parse_store_id(store_id), parse_store_id(dst_store_id)) else {
            return false;
        };
        let Ok(requested_pos) = pos.parse::<u64>() else {
            return false;
        };
        let Ok(store) = server.store(id) else {
            return false;
        };
        // A replica cannot resume from a position we have not reached yet.
        if requested_pos > store.changes() {
            tracing::warn!(
                store_id = id,
                requested_pos = requested_pos,
                changes = store.changes(),
                "incr sync position ahead of master"
            );
            return false;
        }

        let (cancel, mut cancel_rx) = watch::channel(false);
        let listen_addr = format!("{listen_ip}:{listen_port}");
        self.replicas.lock().unwrap().entry(id).or_default().push(ReplicaState {
            dst_store_id: dst,
            listen_addr: listen_addr.clone(),
            cancel,
        });
        tracing::info!(
            store_id = id,
            dst_store_id = dst,
            replica = %listen_addr,
            pos = requested_pos,
            "incr sync registered"
        );

        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let stream = conn.get_mut();
            if stream.write_all(b"+OK\r\n").await.is_err() {
                return;
            }
            let _ = stream.flush().await;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {
                        let ping = format!("+PING {}\r\n", store.changes());
                        if stream.write_all(ping.as_bytes()).await.is_err() {
                            break;
                        }
                        if stream.flush().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        true
    }

    /// Drop every replica registered against one shard.
    pub fn stop_store(&self, store_id: u32) -> Result<()> {
        let removed = self.replicas.lock().unwrap().remove(&store_id);
        if let Some(replicas) = removed {
            for replica in replicas {
                let _ = replica.cancel.send(true);
                tracing::info!(
                    store_id = store_id,
                    dst_store_id = replica.dst_store_id,
                    replica = %replica.listen_addr,
                    "replica dropped"
                );
            }
        }
        Ok(())
    }

    /// Quiesce every replica task and release their sockets.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(true);
        self.replicas.lock().unwrap().clear();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(error = ?err, "replica task join failed");
                }
            }
        }
    }
}
