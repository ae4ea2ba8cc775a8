//! Server configuration snapshot.
//!
//! The configuration is assembled once (from the CLI in the binary, or
//! directly in tests) and is immutable after `Server::startup`. The two AUTH
//! secrets are the only runtime-mutable settings and live on the server
//! itself.

use std::path::PathBuf;

use anyhow::Context;

/// Default cap on a single inbound bulk argument (512 MiB, the Redis default).
pub const DEFAULT_PROTO_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Default number of logical databases.
pub const DEFAULT_DB_NUM: u32 = 16;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_ip: String,
    /// Port to listen on. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Number of network I/O runtime threads.
    pub net_io_threads: usize,
    /// Number of request worker pools. `0` selects the automatic rule.
    pub executor_threads: usize,

    /// Number of user storage shards.
    pub kv_store_count: u32,
    /// Keyspace is split into this many chunks before shard assignment.
    pub chunk_size: u32,
    pub db_num: u32,

    /// Shared block cache for every shard, in MiB.
    pub block_cache_mb: u64,
    pub strict_capacity_limit: bool,
    pub data_dir: PathBuf,

    pub requirepass: String,
    pub masterauth: String,
    pub version_increase: bool,
    pub general_log: bool,
    pub check_key_type_for_set: bool,
    pub proto_max_bulk_len: usize,
    pub noexpire: bool,

    /// `(old_name, new_name)` pairs applied to the command table at startup.
    pub rename_commands: Vec<(String, String)>,
    /// `(alias, canonical)` pairs applied to the command table at startup.
    pub alias_commands: Vec<(String, String)>,

    pub slowlog_path: PathBuf,
    /// Commands slower than this many microseconds are written to the slow-log.
    pub slowlog_slower_than_us: u64,
    /// Flush the slow-log stream every N records.
    pub slowlog_flush_interval: u64,
}

impl ServerConfig {
    /// A config with production defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let slowlog_path = data_dir.join("slowlog");
        Self {
            bind_ip: "127.0.0.1".to_string(),
            port: 8903,
            net_io_threads: 4,
            executor_threads: 0,
            kv_store_count: 10,
            chunk_size: 0x4000,
            db_num: DEFAULT_DB_NUM,
            block_cache_mb: 256,
            strict_capacity_limit: false,
            data_dir,
            requirepass: String::new(),
            masterauth: String::new(),
            version_increase: true,
            general_log: false,
            check_key_type_for_set: false,
            proto_max_bulk_len: DEFAULT_PROTO_MAX_BULK_LEN,
            noexpire: false,
            rename_commands: Vec::new(),
            alias_commands: Vec::new(),
            slowlog_path,
            slowlog_slower_than_us: 100_000,
            slowlog_flush_interval: 1000,
        }
    }

    /// Resolve the worker pool count: the configured value if non-zero,
    /// otherwise `max(4, available_parallelism / 2)`. Fails when the host
    /// cannot report its parallelism at all.
    pub fn resolve_executor_threads(&self) -> anyhow::Result<usize> {
        if self.executor_threads != 0 {
            return Ok(self.executor_threads);
        }
        let cpus = std::thread::available_parallelism()
            .context("cpu num cannot be detected")?
            .get();
        Ok(std::cmp::max(4, cpus / 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_executor_threads_win() {
        let mut cfg = ServerConfig::new("/tmp/x");
        cfg.executor_threads = 2;
        assert_eq!(cfg.resolve_executor_threads().unwrap(), 2);
    }

    #[test]
    fn auto_executor_threads_has_a_floor_of_four() {
        let cfg = ServerConfig::new("/tmp/x");
        let n = cfg.resolve_executor_threads().unwrap();
        assert!(n >= 4);
    }
}
