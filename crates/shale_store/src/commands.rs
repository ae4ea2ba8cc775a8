//! Command registry and the command implementations.
//!
//! The registry is a process-wide table with an init-then-read-mostly
//! lifecycle: rename and alias lists are applied exactly once during server
//! startup. `precheck` resolves the canonical command name and validates
//! arity and auth before the dispatcher decides where the request goes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::locks::LockMode;
use crate::server::Server;
use crate::session::SessionHandle;
use crate::stats::ms_since_epoch;
use crate::store::{db_prefix, encode_data_key, StoreMode, RECORD_STRING};

#[derive(Debug)]
pub struct CommandDef {
    pub name: &'static str,
    /// Exact argument count when positive, minimum when negative.
    pub arity: i32,
}

static BUILTINS: &[CommandDef] = &[
    CommandDef { name: "ping", arity: -1 },
    CommandDef { name: "echo", arity: 2 },
    CommandDef { name: "get", arity: 2 },
    CommandDef { name: "set", arity: -3 },
    CommandDef { name: "del", arity: -2 },
    CommandDef { name: "exists", arity: -2 },
    CommandDef { name: "select", arity: 2 },
    CommandDef { name: "auth", arity: 2 },
    CommandDef { name: "info", arity: -1 },
    CommandDef { name: "monitor", arity: 1 },
    CommandDef { name: "dbsize", arity: 1 },
    CommandDef { name: "debug", arity: -2 },
    CommandDef { name: "pausestore", arity: 2 },
    CommandDef { name: "destroystore", arity: -2 },
    CommandDef { name: "quit", arity: 1 },
    CommandDef { name: "shutdown", arity: -1 },
    CommandDef { name: "fullsync", arity: 4 },
    CommandDef { name: "incrsync", arity: 6 },
];

struct CommandTable {
    by_name: HashMap<String, &'static CommandDef>,
}

static TABLE: OnceLock<CommandTable> = OnceLock::new();
static NO_EXPIRE: AtomicBool = AtomicBool::new(false);

/// Disable the expiry subsystem's view of TTL arguments.
pub fn set_no_expire(on: bool) {
    NO_EXPIRE.store(on, Ordering::Relaxed);
}

pub fn no_expire() -> bool {
    NO_EXPIRE.load(Ordering::Relaxed)
}

fn build_table(
    renames: &[(String, String)],
    aliases: &[(String, String)],
) -> anyhow::Result<CommandTable> {
    let mut by_name: HashMap<String, &'static CommandDef> = BUILTINS
        .iter()
        .map(|def| (def.name.to_string(), def))
        .collect();
    for (old, new) in renames {
        let Some(def) = by_name.remove(&old.to_ascii_lowercase()) else {
            anyhow::bail!("rename of unknown command {old}");
        };
        by_name.insert(new.to_ascii_lowercase(), def);
    }
    for (alias, canonical) in aliases {
        let Some(def) = by_name.get(&canonical.to_ascii_lowercase()).copied() else {
            anyhow::bail!("alias to unknown command {canonical}");
        };
        by_name.insert(alias.to_ascii_lowercase(), def);
    }
    Ok(CommandTable { by_name })
}

/// Install the command table. The first installation wins; later servers in
/// the same process share it.
pub fn install(
    renames: &[(String, String)],
    aliases: &[(String, String)],
) -> anyhow::Result<()> {
    let table = build_table(renames, aliases)?;
    let _ = TABLE.set(table);
    Ok(())
}

fn table() -> &'static CommandTable {
    TABLE.get_or_init(|| build_table(&[], &[]).unwrap())
}

fn arity_ok(def: &CommandDef, argc: usize) -> bool {
    if def.arity >= 0 {
        argc == def.arity as usize
    } else {
        argc >= (-def.arity) as usize
    }
}

/// Resolve the canonical command, validate arity, then auth.
pub fn precheck(
    args: &[Vec<u8>],
    authed: bool,
    requirepass_set: bool,
) -> Result<&'static CommandDef> {
    let Some(first) = args.first() else {
        return Err(Error::parse_packet("empty command"));
    };
    let name = String::from_utf8_lossy(first).to_ascii_lowercase();
    let Some(def) = table().by_name.get(&name).copied() else {
        return Err(Error::parse_packet(format!("unknown command '{name}'")));
    };
    if !arity_ok(def, args.len()) {
        return Err(Error::parse_packet(format!(
            "wrong number of arguments for '{}' command",
            def.name
        )));
    }
    if requirepass_set && !authed && !matches!(def.name, "auth" | "quit") {
        return Err(Error::auth("NOAUTH Authentication required."));
    }
    Ok(def)
}

pub fn fmt_ok() -> Bytes {
    Bytes::from_static(b"+OK\r\n")
}

pub fn fmt_pong() -> Bytes {
    Bytes::from_static(b"+PONG\r\n")
}

pub fn fmt_null() -> Bytes {
    Bytes::from_static(b"$-1\r\n")
}

pub fn fmt_int(v: i64) -> Bytes {
    Bytes::from(format!(":{v}\r\n"))
}

pub fn fmt_bulk(data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

pub fn fmt_err(msg: &str) -> Bytes {
    Bytes::from(format!("-ERR {msg}\r\n"))
}

/// RESP rendering for a status error. NOAUTH keeps its own error code; the
/// rest collapse to ERR.
pub fn fmt_error(err: &Error) -> Bytes {
    match err {
        Error::Auth(msg) if msg.starts_with("NOAUTH") => Bytes::from(format!("-{msg}\r\n")),
        _ => fmt_err(&err.to_string()),
    }
}

fn parse_u64(raw: &[u8], what: &str) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::parse_packet(format!("value is not an integer: {what}")))
}

/// Execute one prechecked command. Runs on the session's worker pool.
pub async fn run_session_cmd(
    server: Arc<Server>,
    sess: SessionHandle,
    def: &'static CommandDef,
    args: Vec<Vec<u8>>,
) -> Result<Bytes> {
    match def.name {
        "ping" => {
            if args.len() >= 2 {
                Ok(fmt_bulk(&args[1]))
            } else {
                Ok(fmt_pong())
            }
        }
        "echo" => Ok(fmt_bulk(&args[1])),
        "select" => {
            let db = parse_u64(&args[1], "db index")? as u32;
            if db >= server.cfg().db_num {
                return Err(Error::parse_packet("DB index is out of range"));
            }
            sess.ctx.set_db_id(db);
            Ok(fmt_ok())
        }
        "auth" => {
            let requirepass = server.requirepass();
            if requirepass.is_empty() {
                return Err(Error::internal(
                    "Client sent AUTH, but no password is set",
                ));
            }
            if args[1] == requirepass.as_bytes() {
                sess.ctx.set_authed(true);
                Ok(fmt_ok())
            } else {
                Err(Error::auth("invalid password"))
            }
        }
        "get" => cmd_get(&server, &sess, &args).await,
        "set" => cmd_set(&server, &sess, &args).await,
        "del" => cmd_del(&server, &sess, &args).await,
        "exists" => cmd_exists(&server, &sess, &args).await,
        "dbsize" => cmd_dbsize(&server, &sess).await,
        "info" => Ok(fmt_bulk(server.info_string().as_bytes())),
        "monitor" => {
            sess.ctx.set_monitor(true);
            server.add_monitor(sess.id);
            Ok(fmt_ok())
        }
        "debug" => cmd_debug(&server, &args).await,
        "pausestore" => {
            let store_id = parse_u64(&args[1], "store id")? as u32;
            let handle = server
                .segment_mgr()?
                .get_db(store_id, LockMode::Exclusive)
                .await?;
            handle.store.pause();
            Ok(fmt_ok())
        }
        "destroystore" => {
            let store_id = parse_u64(&args[1], "store id")? as u32;
            let force = args
                .get(2)
                .map(|a| a.eq_ignore_ascii_case(b"force"))
                .unwrap_or(false);
            server.destroy_store(store_id, force).await?;
            Ok(fmt_ok())
        }
        "shutdown" => {
            server.handle_shutdown_cmd();
            Ok(fmt_ok())
        }
        other => Err(Error::internal(format!("command {other} not dispatchable"))),
    }
}

async fn cmd_get(server: &Arc<Server>, sess: &SessionHandle, args: &[Vec<u8>]) -> Result<Bytes> {
    let key = &args[1];
    let handle = server
        .segment_mgr()?
        .get_db_by_key(key, LockMode::IntentionShared)
        .await?;
    let data_key = encode_data_key(sess.ctx.db_id(), key);
    match handle.store.get(&data_key)? {
        Some(record) => {
            server.stat().keyspace_hits.fetch_add(1, Ordering::Relaxed);
            Ok(fmt_bulk(&record.value))
        }
        None => {
            server
                .stat()
                .keyspace_misses
                .fetch_add(1, Ordering::Relaxed);
            Ok(fmt_null())
        }
    }
}

async fn cmd_set(server: &Arc<Server>, sess: &SessionHandle, args: &[Vec<u8>]) -> Result<Bytes> {
    let key = &args[1];
    let value = &args[2];
    let mut expire_at_ms = None;
    let mut i = 3;
    while i < args.len() {
        let opt = args[i].to_ascii_uppercase();
        match opt.as_slice() {
            b"EX" | b"PX" => {
                let raw = args
                    .get(i + 1)
                    .ok_or_else(|| Error::parse_packet("syntax error"))?;
                let amount = parse_u64(raw, "expire")?;
                if amount == 0 {
                    return Err(Error::parse_packet("invalid expire time in 'set' command"));
                }
                if !no_expire() {
                    let ms = if opt == b"EX" { amount * 1000 } else { amount };
                    expire_at_ms = Some(ms_since_epoch() + ms);
                }
                i += 2;
            }
            _ => return Err(Error::parse_packet("syntax error")),
        }
    }

    let handle = server
        .segment_mgr()?
        .get_db_by_key(key, LockMode::IntentionExclusive)
        .await?;
    if handle.store.get_mode() != StoreMode::ReadWrite {
        return Err(Error::internal(format!(
            "store {} is not writable",
            handle.store.db_id()
        )));
    }
    let data_key = encode_data_key(sess.ctx.db_id(), key);
    let store_id = server.segment_mgr()?.store_id_of(key);
    let _keys = server
        .pessimistic_mgr()?
        .lock_keys(store_id, &[data_key.as_slice()])
        .await?;
    if server.cfg().check_key_type_for_set {
        if let Some(existing) = handle.store.record_type(&data_key)? {
            if existing != RECORD_STRING {
                return Err(Error::internal(
                    "Operation against a key holding the wrong kind of value",
                ));
            }
        }
    }
    handle.store.set(&data_key, value, expire_at_ms)?;
    Ok(fmt_ok())
}

async fn cmd_del(server: &Arc<Server>, sess: &SessionHandle, args: &[Vec<u8>]) -> Result<Bytes> {
    let mut removed = 0i64;
    for key in &args[1..] {
        let handle = server
            .segment_mgr()?
            .get_db_by_key(key, LockMode::IntentionExclusive)
            .await?;
        let data_key = encode_data_key(sess.ctx.db_id(), key);
        let store_id = server.segment_mgr()?.store_id_of(key);
        let _keys = server
            .pessimistic_mgr()?
            .lock_keys(store_id, &[data_key.as_slice()])
            .await?;
        if handle.store.del(&data_key)? {
            removed += 1;
        }
    }
    Ok(fmt_int(removed))
}

async fn cmd_exists(
    server: &Arc<Server>,
    sess: &SessionHandle,
    args: &[Vec<u8>],
) -> Result<Bytes> {
    let mut found = 0i64;
    for key in &args[1..] {
        let handle = server
            .segment_mgr()?
            .get_db_by_key(key, LockMode::IntentionShared)
            .await?;
        let data_key = encode_data_key(sess.ctx.db_id(), key);
        if handle.store.get(&data_key)?.is_some() {
            found += 1;
        }
    }
    Ok(fmt_int(found))
}

async fn cmd_dbsize(server: &Arc<Server>, sess: &SessionHandle) -> Result<Bytes> {
    let segment = server.segment_mgr()?;
    let prefix = db_prefix(sess.ctx.db_id());
    let mut total = 0u64;
    for store_id in 0..segment.store_count() {
        let handle = segment.get_db(store_id, LockMode::IntentionShared).await?;
        total += handle.store.count_prefix(&prefix)?;
    }
    Ok(fmt_int(total as i64))
}

async fn cmd_debug(server: &Arc<Server>, args: &[Vec<u8>]) -> Result<Bytes> {
    let sub = args[1].to_ascii_lowercase();
    match sub.as_slice() {
        b"sleep" => {
            let ms = parse_u64(
                args.get(2)
                    .ok_or_else(|| Error::parse_packet("DEBUG SLEEP requires milliseconds"))?,
                "sleep",
            )?;
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok(fmt_ok())
        }
        b"ftmc" => {
            let on = args
                .get(2)
                .map(|a| a.eq_ignore_ascii_case(b"on"))
                .unwrap_or(false);
            server.toggle_ftmc(on);
            Ok(fmt_ok())
        }
        b"reset-stats" => {
            server.reset_server_stat();
            Ok(fmt_ok())
        }
        b"jsonstat" => {
            let sections: HashSet<String> = args
                .get(2)
                .map(|a| {
                    String::from_utf8_lossy(a)
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .collect()
                })
                .unwrap_or_default();
            let v = server.append_json_stat(&sections);
            Ok(fmt_bulk(v.to_string().as_bytes()))
        }
        b"storestats" => {
            let property = args
                .get(2)
                .map(|a| String::from_utf8_lossy(a).to_string())
                .unwrap_or_else(|| "shale.approximate-keys".to_string());
            let all = server.get_all_property(&property).await?;
            Ok(fmt_bulk(all.as_bytes()))
        }
        b"resetstores" => {
            server.reset_store_stats().await;
            Ok(fmt_ok())
        }
        other => Err(Error::parse_packet(format!(
            "unknown DEBUG subcommand {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn precheck_resolves_case_insensitively() {
        let def = precheck(&argv(&["PiNg"]), false, false).unwrap();
        assert_eq!(def.name, "ping");
    }

    #[test]
    fn precheck_rejects_unknown_and_bad_arity() {
        let err = precheck(&argv(&["frobnicate"]), false, false).unwrap_err();
        assert!(matches!(err, Error::ParsePacket(_)));

        let err = precheck(&argv(&["get"]), false, false).unwrap_err();
        assert!(matches!(err, Error::ParsePacket(_)));

        let err = precheck(&argv(&["incrsync", "0", "0", "0", "ip"]), false, false).unwrap_err();
        assert!(matches!(err, Error::ParsePacket(_)));
    }

    #[test]
    fn precheck_enforces_auth_except_for_auth_and_quit() {
        let err = precheck(&argv(&["get", "k"]), false, true).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(precheck(&argv(&["auth", "pw"]), false, true).is_ok());
        assert!(precheck(&argv(&["quit"]), false, true).is_ok());
        assert!(precheck(&argv(&["get", "k"]), true, true).is_ok());
    }

    #[test]
    fn negative_arity_is_a_minimum() {
        assert!(precheck(&argv(&["set", "k", "v"]), false, false).is_ok());
        assert!(precheck(&argv(&["set", "k", "v", "EX", "10"]), false, false).is_ok());
        assert!(precheck(&argv(&["fullsync", "0", "1", "0"]), false, false).is_ok());
    }

    #[test]
    fn table_applies_renames_and_aliases() {
        let table = build_table(
            &[("dbsize".to_string(), "kvsize".to_string())],
            &[("tally".to_string(), "exists".to_string())],
        )
        .unwrap();
        assert!(table.by_name.get("dbsize").is_none());
        assert_eq!(table.by_name.get("kvsize").unwrap().name, "dbsize");
        assert_eq!(table.by_name.get("tally").unwrap().name, "exists");
        assert_eq!(table.by_name.get("exists").unwrap().name, "exists");
    }

    #[test]
    fn resp_formatting() {
        assert_eq!(&fmt_ok()[..], b"+OK\r\n");
        assert_eq!(&fmt_null()[..], b"$-1\r\n");
        assert_eq!(&fmt_int(3)[..], b":3\r\n");
        assert_eq!(&fmt_bulk(b"hi")[..], b"$2\r\nhi\r\n");
        assert_eq!(
            &fmt_error(&Error::auth("NOAUTH Authentication required."))[..],
            b"-NOAUTH Authentication required.\r\n"
        );
        assert_eq!(
            &fmt_error(&Error::internal("boom"))[..],
            b"-ERR boom\r\n"
        );
    }
}
