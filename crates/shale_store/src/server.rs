//! The server coordinator.
//!
//! Owns the lifecycle of every subsystem: catalog, shard array, segment
//! router, lock managers, worker pools, network, replication, expiry index,
//! stats, cron and the slow-log. Startup installs subsystems leaf-first and
//! accepting connections is strictly last; stop tears everything down in
//! reverse and quiesces every producer before shared state goes away.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::catalog::{Catalog, StoreMainMeta};
use crate::commands;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::executor::WorkerPool;
use crate::index::IndexManager;
use crate::locks::{LockMode, MgLockMgr, PessimisticMgr};
use crate::network::{Network, SessionConn, SessionRunner};
use crate::repl::ReplManager;
use crate::segment::SegmentMgr;
use crate::session::SessionHandle;
use crate::slowlog::SlowLog;
use crate::stats::{
    self, ns_since_epoch, us_since_epoch, Metric, NetworkMatrix, PoolMatrix, RequestMatrix,
    ServerStat,
};
use crate::store::{Store, StoreMode, CATALOG_NAME};

/// What the session framework should do with the session after a dispatch.
pub enum DispatchOutcome {
    /// Write the reply and keep serving the session.
    Reply(Bytes),
    /// The socket was handed to replication; never touch it again.
    Detached,
    /// The server is not running; close the session.
    Closed,
}

struct ServerInner {
    sessions: HashMap<u64, SessionHandle>,
    monitors: Vec<SessionHandle>,
    requirepass: String,
    masterauth: String,
    slowlog: Option<SlowLog>,
}

pub struct Server {
    cfg: ServerConfig,
    startup_time_ns: u64,
    running: AtomicBool,
    stopped: AtomicBool,
    shutdown_requested: AtomicBool,
    ftmc_enabled: AtomicBool,
    ts_ep: AtomicU64,
    next_session_id: AtomicU64,
    /// Wakes the cron loop and stop waiters.
    notify: Notify,

    stat: ServerStat,
    net_matrix: Arc<NetworkMatrix>,
    pool_matrix: Arc<PoolMatrix>,
    req_matrix: Arc<RequestMatrix>,

    keyspace: RwLock<Option<Arc<fjall::Keyspace>>>,
    catalog: RwLock<Option<Arc<Catalog>>>,
    stores: RwLock<Vec<Arc<Store>>>,
    segment_mgr: RwLock<Option<Arc<SegmentMgr>>>,
    pessimistic_mgr: RwLock<Option<Arc<PessimisticMgr>>>,
    mg_lock_mgr: RwLock<Option<Arc<MgLockMgr>>>,
    executors: RwLock<Vec<Arc<WorkerPool>>>,
    network: RwLock<Option<Arc<Network>>>,
    repl_mgr: RwLock<Option<Arc<ReplManager>>>,
    index_mgr: RwLock<Option<Arc<IndexManager>>>,

    inner: Mutex<ServerInner>,
    cron: Mutex<Option<JoinHandle<()>>>,
}

/// Periodicity gate on the cron tick counter. Periods at or below the tick
/// interval collapse to every tick.
fn every(period_ms: u64, tick: u64) -> bool {
    period_ms <= 100 || tick % (period_ms / 100) == 0
}

fn render_args(args: &[Vec<u8>]) -> String {
    args.iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Arc<Server> {
        Arc::new(Server {
            startup_time_ns: ns_since_epoch(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            ftmc_enabled: AtomicBool::new(false),
            ts_ep: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
            notify: Notify::new(),
            stat: ServerStat::default(),
            net_matrix: Arc::new(NetworkMatrix::default()),
            pool_matrix: Arc::new(PoolMatrix::default()),
            req_matrix: Arc::new(RequestMatrix::default()),
            keyspace: RwLock::new(None),
            catalog: RwLock::new(None),
            stores: RwLock::new(Vec::new()),
            segment_mgr: RwLock::new(None),
            pessimistic_mgr: RwLock::new(None),
            mg_lock_mgr: RwLock::new(None),
            executors: RwLock::new(Vec::new()),
            network: RwLock::new(None),
            repl_mgr: RwLock::new(None),
            index_mgr: RwLock::new(None),
            inner: Mutex::new(ServerInner {
                sessions: HashMap::new(),
                monitors: Vec::new(),
                requirepass: cfg.requirepass.clone(),
                masterauth: cfg.masterauth.clone(),
                slowlog: None,
            }),
            cron: Mutex::new(None),
            cfg,
        })
    }

    pub fn cfg(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn startup_time_ns(&self) -> u64 {
        self.startup_time_ns
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn stat(&self) -> &ServerStat {
        &self.stat
    }

    pub fn net_matrix(&self) -> &NetworkMatrix {
        &self.net_matrix
    }

    pub fn pool_matrix(&self) -> &PoolMatrix {
        &self.pool_matrix
    }

    pub fn req_matrix(&self) -> &RequestMatrix {
        &self.req_matrix
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn requirepass(&self) -> String {
        self.inner.lock().unwrap().requirepass.clone()
    }

    pub fn set_requirepass(&self, v: &str) {
        self.inner.lock().unwrap().requirepass = v.to_string();
    }

    pub fn masterauth(&self) -> String {
        self.inner.lock().unwrap().masterauth.clone()
    }

    pub fn set_masterauth(&self, v: &str) {
        self.inner.lock().unwrap().masterauth = v.to_string();
    }

    pub fn ts_ep(&self) -> u64 {
        self.ts_ep.load(Ordering::Relaxed)
    }

    pub fn set_ts_ep(&self, timestamp: u64) {
        self.ts_ep.store(timestamp, Ordering::Relaxed);
    }

    pub fn toggle_ftmc(&self, enable: bool) {
        self.ftmc_enabled.store(enable, Ordering::Relaxed);
    }

    /// Zero every matrix and the server stat counters.
    pub fn reset_server_stat(&self) {
        let _inner = self.inner.lock().unwrap();
        self.pool_matrix.reset();
        self.net_matrix.reset();
        self.req_matrix.reset();
        self.stat.reset();
    }

    pub fn segment_mgr(&self) -> Result<Arc<SegmentMgr>> {
        self.segment_mgr
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("segment manager not installed"))
    }

    pub fn pessimistic_mgr(&self) -> Result<Arc<PessimisticMgr>> {
        self.pessimistic_mgr
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("pessimistic lock manager not installed"))
    }

    pub fn repl_mgr(&self) -> Result<Arc<ReplManager>> {
        self.repl_mgr
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("replication manager not installed"))
    }

    fn index_mgr_opt(&self) -> Option<Arc<IndexManager>> {
        self.index_mgr.read().unwrap().clone()
    }

    fn catalog(&self) -> Result<Arc<Catalog>> {
        self.catalog
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("catalog not installed"))
    }

    pub fn kv_store_count(&self) -> u32 {
        self.catalog
            .read()
            .unwrap()
            .as_ref()
            .map(|c| c.kv_store_count())
            .unwrap_or(0)
    }

    pub fn store(&self, store_id: u32) -> Result<Arc<Store>> {
        self.stores
            .read()
            .unwrap()
            .get(store_id as usize)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("store {store_id}")))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.network.read().unwrap().as_ref().map(|n| n.local_addr())
    }

    /// Install every subsystem in dependency order and start accepting.
    /// On failure the server is left not-running; already-installed
    /// subsystems are retained until `stop` is called.
    pub fn startup(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        tracing::info!("server startup begins");

        let cfg = &self.cfg;
        let kv_store_count = cfg.kv_store_count;
        let chunk_size = cfg.chunk_size;

        // Global command configuration is applied exactly once.
        commands::set_no_expire(cfg.noexpire);
        commands::install(&cfg.rename_commands, &cfg.alias_commands)
            .context("install command table")?;

        std::fs::create_dir_all(&cfg.data_dir).context("create data dir")?;
        let storage_dir = cfg.data_dir.join("storage");
        let keyspace = Arc::new(
            fjall::Config::new(&storage_dir)
                .cache_size(cfg.block_cache_mb * 1024 * 1024)
                .open()
                .context("open keyspace")?,
        );
        *self.keyspace.write().unwrap() = Some(Arc::clone(&keyspace));
        tracing::info!(
            cache_mb = cfg.block_cache_mb,
            strict_capacity = cfg.strict_capacity_limit,
            "shared block cache configured"
        );

        let catalog_store = Store::open(
            Arc::clone(&keyspace),
            CATALOG_NAME,
            StoreMode::ReadWrite,
            cfg.version_increase,
        )
        .map_err(|err| anyhow::anyhow!("open catalog store: {err}"))?;
        let catalog = Arc::new(Catalog::new(catalog_store, kv_store_count, chunk_size));
        *self.catalog.write().unwrap() = Some(Arc::clone(&catalog));

        let mut stores = Vec::with_capacity(kv_store_count as usize);
        for store_id in 0..kv_store_count {
            let mode = match catalog.store_main_meta(store_id) {
                Ok(meta) => meta.store_mode,
                Err(err) if err.is_not_found() => {
                    let meta = StoreMainMeta {
                        store_id,
                        store_mode: StoreMode::ReadWrite,
                    };
                    catalog.set_store_main_meta(&meta).map_err(|err| {
                        anyhow::anyhow!("catalog set store main meta {store_id}: {err}")
                    })?;
                    StoreMode::ReadWrite
                }
                Err(err) => {
                    anyhow::bail!("catalog get store main meta {store_id}: {err}");
                }
            };
            let store = Store::open(
                Arc::clone(&keyspace),
                &store_id.to_string(),
                mode,
                cfg.version_increase,
            )
            .map_err(|err| anyhow::anyhow!("open store {store_id}: {err}"))?;
            stores.push(store);
        }
        *self.stores.write().unwrap() = stores.clone();
        debug_assert_eq!(self.kv_store_count(), kv_store_count);

        let mg_lock_mgr = MgLockMgr::new();
        *self.mg_lock_mgr.write().unwrap() = Some(Arc::clone(&mg_lock_mgr));
        *self.segment_mgr.write().unwrap() =
            Some(Arc::new(SegmentMgr::new(stores, chunk_size, mg_lock_mgr)));
        *self.pessimistic_mgr.write().unwrap() = Some(PessimisticMgr::new(kv_store_count));

        let threads = cfg.resolve_executor_threads()?;
        tracing::info!(
            threads,
            configured = cfg.executor_threads,
            "request executor threads"
        );
        let mut pools = Vec::with_capacity(threads);
        for i in 0..threads {
            pools.push(WorkerPool::startup(
                format!("req-exec-{i}"),
                Arc::clone(&self.pool_matrix),
            ));
        }
        *self.executors.write().unwrap() = pools;

        let network = Network::prepare(&cfg.bind_ip, cfg.port).context("prepare network")?;
        let port = network.local_addr().port();
        tracing::info!(ip = %cfg.bind_ip, port, "network prepared");
        *self.network.write().unwrap() = Some(Arc::clone(&network));

        // Replication relies on the network being prepared (it opens blocking
        // outbound connections) but must start before we accept.
        let repl = ReplManager::new(Arc::downgrade(self));
        repl.startup()
            .map_err(|err| anyhow::anyhow!("replication startup: {err}"))?;
        *self.repl_mgr.write().unwrap() = Some(repl);

        if !cfg.noexpire {
            let index = IndexManager::new(Arc::downgrade(self));
            index
                .startup()
                .map_err(|err| anyhow::anyhow!("index manager startup: {err}"))?;
            *self.index_mgr.write().unwrap() = Some(index);
        }

        // The listener is the last one to run.
        network
            .run(Arc::downgrade(self))
            .map_err(|err| anyhow::anyhow!("network run: {err}"))?;
        tracing::warn!(ip = %cfg.bind_ip, port, "ready to accept connections");

        self.running.store(true, Ordering::Relaxed);
        self.stopped.store(false, Ordering::Relaxed);
        self.spawn_cron();

        inner.slowlog = Some(
            SlowLog::open(
                &cfg.slowlog_path,
                cfg.slowlog_slower_than_us,
                cfg.slowlog_flush_interval,
            )
            .map_err(|err| anyhow::anyhow!("{err}"))?,
        );

        tracing::info!("server startup complete");
        Ok(())
    }

    /// Route one framed command: precheck, monitor fan-out, replication
    /// hijack, then worker-pool dispatch.
    pub async fn process_request(
        self: &Arc<Self>,
        sess: &SessionHandle,
        args: &[Vec<u8>],
        conn: &mut SessionConn,
    ) -> DispatchOutcome {
        if !self.is_running() {
            return DispatchOutcome::Closed;
        }
        if self.cfg.general_log {
            tracing::info!(
                session_id = sess.id,
                remote = %sess.remote,
                cmd = %render_args(args),
                "command"
            );
        }

        let requirepass_set = !self.requirepass().is_empty();
        let def = match commands::precheck(args, sess.ctx.authed(), requirepass_set) {
            Ok(def) => def,
            Err(err) => return DispatchOutcome::Reply(commands::fmt_error(&err)),
        };

        // Monitors observe command submission order: fan out before the
        // command is scheduled anywhere.
        self.reply_monitors(sess, args);

        match def.name {
            "fullsync" => {
                tracing::warn!(session_id = sess.id, "session socket borrowed for full sync");
                let borrowed = match conn.borrow_conn() {
                    Ok(borrowed) => borrowed,
                    Err(err) => return DispatchOutcome::Reply(commands::fmt_error(&err)),
                };
                let repl = match self.repl_mgr() {
                    Ok(repl) => repl,
                    Err(err) => return DispatchOutcome::Reply(commands::fmt_error(&err)),
                };
                let a1 = String::from_utf8_lossy(&args[1]).into_owned();
                let a2 = String::from_utf8_lossy(&args[2]).into_owned();
                let a3 = String::from_utf8_lossy(&args[3]).into_owned();
                repl.supply_full_sync(borrowed, &a1, &a2, &a3);
                self.stat.sync_full.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Detached
            }
            "incrsync" => {
                tracing::warn!(session_id = sess.id, "session socket borrowed for incr sync");
                let borrowed = match conn.borrow_conn() {
                    Ok(borrowed) => borrowed,
                    Err(err) => return DispatchOutcome::Reply(commands::fmt_error(&err)),
                };
                let repl = match self.repl_mgr() {
                    Ok(repl) => repl,
                    Err(err) => return DispatchOutcome::Reply(commands::fmt_error(&err)),
                };
                let fields: Vec<String> = args[1..=5]
                    .iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect();
                let registered = repl.register_incr_sync(
                    borrowed, &fields[0], &fields[1], &fields[2], &fields[3], &fields[4],
                );
                if registered {
                    self.stat.sync_partial_ok.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stat.sync_partial_err.fetch_add(1, Ordering::Relaxed);
                }
                DispatchOutcome::Detached
            }
            "quit" => {
                tracing::info!(session_id = sess.id, "quit command");
                sess.ctx.set_close_after_reply();
                DispatchOutcome::Reply(commands::fmt_ok())
            }
            _ => {
                let pools = self.executors.read().unwrap().clone();
                if pools.is_empty() {
                    return DispatchOutcome::Reply(commands::fmt_err("no worker pools"));
                }
                let pool = Arc::clone(&pools[(sess.id % pools.len() as u64) as usize]);
                let server = Arc::clone(self);
                let session = sess.clone();
                let argv = args.to_vec();
                let start_us = us_since_epoch();
                let started = Instant::now();
                let result = pool
                    .schedule(move || {
                        commands::run_session_cmd(server, session, def, argv).boxed()
                    })
                    .await;
                let elapsed = started.elapsed();
                self.req_matrix.processed.fetch_add(1, Ordering::Relaxed);
                self.req_matrix
                    .process_cost_ns
                    .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
                self.slowlog_push(start_us, elapsed.as_micros() as u64, args);
                match result {
                    Ok(reply) => DispatchOutcome::Reply(reply),
                    Err(err) => DispatchOutcome::Reply(commands::fmt_error(&err)),
                }
            }
        }
    }

    /// Broadcast one command to every monitor session's response stream.
    fn reply_monitors(&self, sess: &SessionHandle, args: &[Vec<u8>]) {
        if self.inner.lock().unwrap().monitors.is_empty() {
            return;
        }

        let ts = us_since_epoch();
        let mut line = format!(
            "+{}.{} [{} {}] ",
            ts / 1_000_000,
            ts % 1_000_000,
            sess.ctx.db_id(),
            sess.remote
        );
        for (i, arg) in args.iter().enumerate() {
            line.push('"');
            line.push_str(&String::from_utf8_lossy(arg));
            line.push('"');
            if i != args.len() - 1 {
                line.push(' ');
            }
        }
        line.push_str("\r\n");
        let payload = Bytes::from(line);

        let inner = self.inner.lock().unwrap();
        for monitor in &inner.monitors {
            let _ = monitor.push_out_of_band(payload.clone());
        }
    }

    fn slowlog_push(&self, time_us: u64, duration_us: u64, args: &[Vec<u8>]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slowlog) = inner.slowlog.as_mut() {
            slowlog.push_entry_if_needed(time_us, duration_us, args);
        }
    }

    pub fn slowlog_id(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .slowlog
            .as_ref()
            .map(SlowLog::current_id)
            .unwrap_or(0)
    }

    /// Register a session and start driving it. Refused when not running.
    pub fn add_session(&self, handle: SessionHandle, runner: SessionRunner) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !self.is_running() {
            tracing::warn!(session_id = handle.id, "session arrived while stopping, ignored");
            return false;
        }
        // First driving force of the session state machine.
        runner.start();
        if inner.sessions.contains_key(&handle.id) {
            panic!("add session {}: id already exists", handle.id);
        }
        inner.sessions.insert(handle.id, handle);
        true
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Cooperatively cancel a session: its next I/O operation is interrupted.
    pub fn cancel_session(&self, session_id: u64) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if !self.is_running() {
            return Err(Error::busy("server is shutting down"));
        }
        let Some(handle) = inner.sessions.get(&session_id) else {
            return Err(Error::not_found(format!("session not found: {session_id}")));
        };
        tracing::info!(session_id, remote = %handle.remote, "cancel session");
        handle.cancel();
        Ok(())
    }

    /// Remove a session from the registry (and from the monitor list if
    /// flagged). An unknown id in steady state means corruption.
    pub fn end_session(&self, session_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !self.is_running() {
            return;
        }
        let Some(handle) = inner.sessions.get(&session_id) else {
            panic!("end session {session_id}: not found");
        };
        if handle.ctx.is_monitor() {
            Self::del_monitor_no_lock(&mut inner, session_id);
        }
        inner.sessions.remove(&session_id);
    }

    /// Snapshot of all live sessions. Warns when the copy takes longer than
    /// 5 ms, an alarm for lock-duration regressions.
    pub fn get_all_sessions(&self) -> Vec<SessionHandle> {
        let inner = self.inner.lock().unwrap();
        let started = Instant::now();
        let sessions: Vec<SessionHandle> = inner.sessions.values().cloned().collect();
        let elapsed = started.elapsed();
        if elapsed >= Duration::from_millis(5) {
            tracing::warn!(
                cost_ms = elapsed.as_millis() as u64,
                length = sessions.len(),
                "get sessions is slow"
            );
        }
        sessions
    }

    /// Idempotent: a session already monitoring is not added twice.
    pub fn add_monitor(&self, session_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.monitors.iter().any(|m| m.id == session_id) {
            return;
        }
        let Some(handle) = inner.sessions.get(&session_id).cloned() else {
            tracing::error!(session_id, "add monitor: session not found");
            return;
        };
        inner.monitors.push(handle);
    }

    fn del_monitor_no_lock(inner: &mut ServerInner, session_id: u64) {
        inner.monitors.retain(|m| m.id != session_id);
    }

    pub fn monitor_count(&self) -> usize {
        self.inner.lock().unwrap().monitors.len()
    }

    /// Destroy one shard. The catalog record flips to `StoreNone` before any
    /// physical state is touched: an orphan record is safely re-destroyable,
    /// the reverse is fatal on restart.
    pub async fn destroy_store(&self, store_id: u32, force: bool) -> Result<()> {
        let segment = self.segment_mgr()?;
        let handle = segment.get_db(store_id, LockMode::Exclusive).await?;
        let store = Arc::clone(&handle.store);

        if !force && !store.is_empty()? {
            return Err(Error::internal("try to close an unempty store"));
        }
        if !store.is_paused() {
            return Err(Error::internal(
                "please pausestore first before destroystore",
            ));
        }

        let catalog = self.catalog()?;
        let mut meta = catalog.store_main_meta(store_id).map_err(|err| {
            tracing::warn!(store_id, error = %err, "get store main meta failed");
            err
        })?;
        meta.store_mode = StoreMode::StoreNone;
        catalog.set_store_main_meta(&meta).map_err(|err| {
            tracing::warn!(store_id, error = %err, "set store main meta failed");
            err
        })?;

        store.destroy().map_err(|err| {
            tracing::error!(store_id, error = %err, "destroy store failed");
            err
        })?;

        self.repl_mgr()?.stop_store(store_id).map_err(|err| {
            tracing::error!(store_id, error = %err, "replication stop store failed");
            err
        })?;
        if let Some(index) = self.index_mgr_opt() {
            index.stop_store(store_id).map_err(|err| {
                tracing::error!(store_id, error = %err, "index stop store failed");
                err
            })?;
        }
        Ok(())
    }

    /// Switch a shard's mode and persist it. The caller must hold the
    /// exclusive lock on the shard.
    pub fn set_store_mode(&self, store: &Arc<Store>, mode: StoreMode) -> Result<()> {
        if store.get_mode() == mode {
            return Ok(());
        }
        store.set_mode(mode)?;
        let store_id: u32 = store
            .db_id()
            .parse()
            .map_err(|_| Error::internal(format!("store id {} is not numeric", store.db_id())))?;
        let catalog = self.catalog()?;
        let mut meta = catalog.store_main_meta(store_id)?;
        meta.store_mode = mode;
        catalog.set_store_main_meta(&meta)
    }

    /// Sum a numeric property over every shard, under shared-intent locks.
    pub async fn get_total_int_property(&self, property: &str) -> Result<u64> {
        let segment = self.segment_mgr()?;
        let mut total = 0u64;
        for store_id in 0..self.kv_store_count() {
            let handle = segment
                .get_db(store_id, LockMode::IntentionShared)
                .await?;
            total += handle.store.get_int_property(property)?;
        }
        Ok(total)
    }

    /// Concatenate a property over every shard as `store_<id>:<value>` lines.
    pub async fn get_all_property(&self, property: &str) -> Result<String> {
        let segment = self.segment_mgr()?;
        let mut out = String::new();
        for store_id in 0..self.kv_store_count() {
            let handle = segment
                .get_db(store_id, LockMode::IntentionShared)
                .await?;
            let value = handle.store.get_property(property)?;
            out.push_str(&format!("store_{}:{}\r\n", handle.store.db_id(), value));
        }
        Ok(out)
    }

    /// Reset per-shard statistics, tolerating per-shard lock failures.
    pub async fn reset_store_stats(&self) {
        let Ok(segment) = self.segment_mgr() else {
            return;
        };
        for store_id in 0..self.kv_store_count() {
            match segment.get_db(store_id, LockMode::IntentionShared).await {
                Ok(handle) => handle.store.reset_statistics(),
                Err(_) => continue,
            }
        }
    }

    /// Redis-INFO-style report.
    pub fn info_string(&self) -> String {
        let uptime_s = (ns_since_epoch() - self.startup_time_ns) / 1_000_000_000;
        let mut out = String::with_capacity(2048);
        out.push_str("# Server\r\n");
        out.push_str(&format!("shale_version:{}\r\n", env!("CARGO_PKG_VERSION")));
        out.push_str(&format!("process_id:{}\r\n", std::process::id()));
        out.push_str(&format!(
            "tcp_port:{}\r\n",
            self.local_addr().map(|a| a.port()).unwrap_or(self.cfg.port)
        ));
        out.push_str(&format!("uptime_in_seconds:{uptime_s}\r\n"));
        out.push_str(&format!("kvstore_count:{}\r\n", self.kv_store_count()));
        out.push_str(&format!("db_num:{}\r\n", self.cfg.db_num));

        out.push_str("\r\n# Clients\r\n");
        out.push_str(&format!("connected_clients:{}\r\n", self.session_count()));
        out.push_str(&format!("monitor_clients:{}\r\n", self.monitor_count()));

        out.push_str("\r\n# Memory\r\n");
        let mut system = sysinfo::System::new();
        let pid = sysinfo::Pid::from(std::process::id() as usize);
        system.refresh_process(pid);
        let rss = system.process(pid).map(|p| p.memory()).unwrap_or(0);
        out.push_str(&format!("used_memory_rss:{rss}\r\n"));

        out.push_str("\r\n# Replication\r\n");
        out.push_str("role:master\r\n");

        out.push_str("\r\n# Stats\r\n");
        out.push_str(&stats::stat_info(
            &self.stat,
            &self.net_matrix,
            &self.pool_matrix,
            &self.req_matrix,
        ));
        out
    }

    pub fn append_json_stat(&self, sections: &HashSet<String>) -> serde_json::Value {
        stats::json_stat(sections, &self.net_matrix, &self.pool_matrix, &self.req_matrix)
    }

    fn spawn_cron(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let hz: u64 = 10;
            let interval = Duration::from_millis(1000 / hz);
            let mut cron_loop: u64 = 0;
            tracing::info!(hz, "server cron starts");

            let mut old_net = stats::NetworkSnapshot::default();
            let mut old_pool = stats::PoolSnapshot::default();
            let mut old_req = stats::RequestSnapshot::default();
            let mut system = sysinfo::System::new();
            let pid = sysinfo::Pid::from(std::process::id() as usize);

            loop {
                {
                    let Some(server) = weak.upgrade() else { break };
                    if !server.is_running() {
                        tracing::info!("server cron exits");
                        break;
                    }

                    if every(100, cron_loop) {
                        server.stat.track_instantaneous(
                            Metric::Command,
                            server.req_matrix.processed.load(Ordering::Relaxed),
                        );
                        server.stat.track_instantaneous(
                            Metric::NetInput,
                            server.stat.net_input_bytes.load(Ordering::Relaxed),
                        );
                        server.stat.track_instantaneous(
                            Metric::NetOutput,
                            server.stat.net_output_bytes.load(Ordering::Relaxed),
                        );
                    }

                    if every(1000, cron_loop)
                        && server.ftmc_enabled.load(Ordering::Relaxed)
                    {
                        let net = server.net_matrix.snapshot();
                        let pool = server.pool_matrix.snapshot();
                        let req = server.req_matrix.snapshot();
                        let net_delta = net.delta(&old_net);
                        let pool_delta = pool.delta(&old_pool);
                        let req_delta = req.delta(&old_req);
                        old_net = net;
                        old_pool = pool;
                        old_req = req;

                        system.refresh_process(pid);
                        let (cpu_pct, rss_bytes) = system
                            .process(pid)
                            .map(|p| (p.cpu_usage(), p.memory()))
                            .unwrap_or((0.0, 0));
                        tracing::info!(
                            conn_created = net_delta.conn_created,
                            conn_released = net_delta.conn_released,
                            invalid_packets = net_delta.invalid_packets,
                            executed = pool_delta.executed,
                            queue_time_ns = pool_delta.queue_time_ns,
                            execute_time_ns = pool_delta.execute_time_ns,
                            in_queue = pool_delta.in_queue,
                            processed = req_delta.processed,
                            process_cost_ns = req_delta.process_cost_ns,
                            send_packet_cost_ns = req_delta.send_packet_cost_ns,
                            cpu_pct = cpu_pct,
                            rss_bytes = rss_bytes,
                            "full-time matrix"
                        );
                    }
                }
                cron_loop += 1;

                let Some(server) = weak.upgrade() else { break };
                let woken = server.notify.notified();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = woken => {}
                }
            }
        });
        *self.cron.lock().unwrap() = Some(task);
    }

    /// The SHUTDOWN command only raises the flag; the stop waiter performs
    /// the actual teardown without holding the coordinator mutex.
    pub fn handle_shutdown_cmd(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Block until the server is fully stopped, driving the teardown when a
    /// SHUTDOWN command raised the flag.
    pub async fn wait_stop_complete(self: &Arc<Self>) {
        let mut shutdowned = false;
        while self.is_running() {
            let woken = self.notify.notified();
            let _ = tokio::time::timeout(Duration::from_secs(1), woken).await;
            if !self.is_running() && self.is_stopped() {
                return;
            }
            if self.shutdown_requested() {
                tracing::info!("shutdown command");
                shutdowned = true;
                break;
            }
        }
        if shutdowned {
            self.stop().await;
        }
    }

    /// Idempotent teardown in reverse dependency order.
    pub async fn stop(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            tracing::info!("server is already stopping");
            return;
        }
        tracing::info!("server begins to stop");
        self.notify.notify_waiters();

        let network = self.network.read().unwrap().clone();
        if let Some(network) = network {
            network.stop().await;
        }

        let executors = self.executors.read().unwrap().clone();
        for pool in &executors {
            pool.stop().await;
        }

        if let Some(repl) = self.repl_mgr.read().unwrap().clone() {
            repl.stop().await;
        }
        if let Some(index) = self.index_mgr_opt() {
            index.stop().await;
        }

        // Interrupt live sessions, then drop the registry's references.
        // Sockets borrowed by replication survive through the replication
        // manager's own references.
        let sessions: Vec<SessionHandle> = {
            let inner = self.inner.lock().unwrap();
            inner.sessions.values().cloned().collect()
        };
        for session in &sessions {
            session.cancel();
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.clear();
            inner.monitors.clear();
        }

        if !self.shutdown_requested() {
            // Not a SHUTDOWN command: drop the owning handles to break the
            // reference chain back to the server for deterministic teardown.
            *self.network.write().unwrap() = None;
            self.executors.write().unwrap().clear();
            *self.repl_mgr.write().unwrap() = None;
            *self.index_mgr.write().unwrap() = None;
            *self.pessimistic_mgr.write().unwrap() = None;
            *self.mg_lock_mgr.write().unwrap() = None;
            *self.segment_mgr.write().unwrap() = None;
        }

        if let Some(catalog) = self.catalog.read().unwrap().clone() {
            if let Err(err) = catalog.stop() {
                tracing::error!(error = %err, "stop catalog failed");
            }
        }
        let stores = self.stores.read().unwrap().clone();
        for store in &stores {
            if let Err(err) = store.stop() {
                tracing::error!(store_id = %store.db_id(), error = %err, "stop store failed");
            }
        }
        if let Some(keyspace) = self.keyspace.read().unwrap().clone() {
            if let Err(err) = keyspace.persist(fjall::PersistMode::SyncAll) {
                tracing::error!(error = %err, "final keyspace persist failed");
            }
        }

        let cron = self.cron.lock().unwrap().take();
        if let Some(cron) = cron {
            if let Err(err) = cron.await {
                tracing::warn!(error = ?err, "cron join failed");
            }
        }

        let slowlog = self.inner.lock().unwrap().slowlog.take();
        if let Some(slowlog) = slowlog {
            slowlog.close();
        }

        self.stopped.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        tracing::info!("server stop complete");
    }
}
