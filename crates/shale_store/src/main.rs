// Shale server binary: CLI parsing, logging setup, and the run-until-shutdown
// loop around the coordinator.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use shale_store::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "shale-store", version)]
struct Args {
    #[arg(long, env = "SHALE_BIND_IP", default_value = "127.0.0.1")]
    bind_ip: String,

    #[arg(long, env = "SHALE_PORT", default_value_t = 8903)]
    port: u16,

    #[arg(long, env = "SHALE_DATA_DIR")]
    data_dir: PathBuf,

    /// Network I/O runtime threads.
    #[arg(long, env = "SHALE_NET_IO_THREADS", default_value_t = 4)]
    net_io_threads: usize,

    /// Request worker pools. 0 selects max(4, cpu/2).
    #[arg(long, env = "SHALE_EXECUTOR_THREADS", default_value_t = 0)]
    executor_threads: usize,

    /// Number of user storage shards.
    #[arg(long, env = "SHALE_KVSTORE_COUNT", default_value_t = 10)]
    kvstore_count: u32,

    /// Keyspace chunk count used by the segment router.
    #[arg(long, env = "SHALE_CHUNK_SIZE", default_value_t = 0x4000)]
    chunk_size: u32,

    /// Logical database count.
    #[arg(long, env = "SHALE_DB_NUM", default_value_t = 16)]
    db_num: u32,

    /// Shared block cache across all shards (MiB).
    #[arg(long, env = "SHALE_BLOCK_CACHE_MB", default_value_t = 256)]
    block_cache_mb: u64,

    #[arg(long, env = "SHALE_STRICT_CAPACITY_LIMIT", default_value_t = false)]
    strict_capacity_limit: bool,

    /// AUTH password required from clients. Empty disables auth.
    #[arg(long, env = "SHALE_REQUIREPASS", default_value = "")]
    requirepass: String,

    /// Password presented to a master when replicating.
    #[arg(long, env = "SHALE_MASTERAUTH", default_value = "")]
    masterauth: String,

    /// Bump the replication position on every write.
    #[arg(long, env = "SHALE_VERSION_INCREASE", default_value_t = true)]
    version_increase: bool,

    /// Log every command.
    #[arg(long, env = "SHALE_GENERAL_LOG", default_value_t = false)]
    general_log: bool,

    /// Reject SET against a key holding a non-string record.
    #[arg(long, env = "SHALE_CHECK_KEY_TYPE_FOR_SET", default_value_t = false)]
    check_key_type_for_set: bool,

    /// Max inbound bulk argument size in bytes.
    #[arg(long, env = "SHALE_PROTO_MAX_BULK_LEN", default_value_t = 512 * 1024 * 1024)]
    proto_max_bulk_len: usize,

    /// Disable the TTL expiry subsystem.
    #[arg(long, env = "SHALE_NOEXPIRE", default_value_t = false)]
    noexpire: bool,

    /// Comma-separated `old=new` command renames.
    #[arg(long, env = "SHALE_RENAME_COMMANDS", default_value = "")]
    rename_commands: String,

    /// Comma-separated `alias=canonical` command aliases.
    #[arg(long, env = "SHALE_ALIAS_COMMANDS", default_value = "")]
    alias_commands: String,

    /// Slow-log file path. Defaults to `<data-dir>/slowlog`.
    #[arg(long, env = "SHALE_SLOWLOG_PATH")]
    slowlog_path: Option<PathBuf>,

    /// Slow-log threshold in microseconds.
    #[arg(long, env = "SHALE_SLOWLOG_SLOWER_THAN_US", default_value_t = 100_000)]
    slowlog_slower_than_us: u64,

    /// Flush the slow-log stream every N records.
    #[arg(long, env = "SHALE_SLOWLOG_FLUSH_INTERVAL", default_value_t = 1000)]
    slowlog_flush_interval: u64,
}

fn parse_pairs(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for part in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let (left, right) = part
            .split_once('=')
            .with_context(|| format!("invalid pair (expected a=b): {part}"))?;
        out.push((left.trim().to_string(), right.trim().to_string()));
    }
    Ok(out)
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut cfg = ServerConfig::new(self.data_dir);
        cfg.bind_ip = self.bind_ip;
        cfg.port = self.port;
        cfg.net_io_threads = self.net_io_threads;
        cfg.executor_threads = self.executor_threads;
        cfg.kv_store_count = self.kvstore_count;
        cfg.chunk_size = self.chunk_size;
        cfg.db_num = self.db_num;
        cfg.block_cache_mb = self.block_cache_mb;
        cfg.strict_capacity_limit = self.strict_capacity_limit;
        cfg.requirepass = self.requirepass;
        cfg.masterauth = self.masterauth;
        cfg.version_increase = self.version_increase;
        cfg.general_log = self.general_log;
        cfg.check_key_type_for_set = self.check_key_type_for_set;
        cfg.proto_max_bulk_len = self.proto_max_bulk_len;
        cfg.noexpire = self.noexpire;
        cfg.rename_commands = parse_pairs(&self.rename_commands)?;
        cfg.alias_commands = parse_pairs(&self.alias_commands)?;
        if let Some(path) = self.slowlog_path {
            cfg.slowlog_path = path;
        }
        cfg.slowlog_slower_than_us = self.slowlog_slower_than_us;
        cfg.slowlog_flush_interval = self.slowlog_flush_interval;
        Ok(cfg)
    }
}

fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = args.into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.net_io_threads.max(1))
        .thread_name("net-io")
        .enable_all()
        .build()
        .context("build runtime")?;

    runtime.block_on(async move {
        let server = Server::new(cfg);
        server.startup().context("server startup")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                server.stop().await;
            }
            _ = server.wait_stop_complete() => {}
        }
        Ok(())
    })
}

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL_ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;
