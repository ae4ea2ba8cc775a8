#![allow(dead_code)]
//! Shared helpers for integration tests: unique data dirs, in-process server
//! startup, and a small raw-RESP client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use shale_store::{Server, ServerConfig};

/// Timeout for individual RESP read/write operations.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(5);

/// A unique data directory under the system temp dir.
pub fn temp_data_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("shale-it-{tag}-{}-{nanos}", std::process::id()))
}

/// Config for an in-process test server on an ephemeral port.
pub fn test_config(tag: &str, kv_store_count: u32) -> ServerConfig {
    let mut cfg = ServerConfig::new(temp_data_dir(tag));
    cfg.port = 0;
    cfg.kv_store_count = kv_store_count;
    cfg.executor_threads = 2;
    cfg
}

/// Start a server and return it with its bound address.
pub fn start_server(cfg: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let server = Server::new(cfg);
    server.startup().expect("server startup");
    let addr = server.local_addr().expect("server local addr");
    (server, addr)
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<Vec<u8>>),
    ArrayHeader(i64),
}

impl Reply {
    pub fn simple(self) -> String {
        match self {
            Reply::Simple(s) => s,
            other => panic!("expected simple string, got {other:?}"),
        }
    }

    pub fn error(self) -> String {
        match self {
            Reply::Error(s) => s,
            other => panic!("expected error, got {other:?}"),
        }
    }

    pub fn int(self) -> i64 {
        match self {
            Reply::Int(v) => v,
            other => panic!("expected integer, got {other:?}"),
        }
    }

    pub fn bulk(self) -> Option<Vec<u8>> {
        match self {
            Reply::Bulk(b) => b,
            other => panic!("expected bulk string, got {other:?}"),
        }
    }

    pub fn bulk_string(self) -> String {
        String::from_utf8(self.bulk().expect("non-null bulk")).expect("utf8 bulk")
    }
}

/// Minimal RESP2 client speaking over a raw TCP stream.
pub struct RespClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RespClient {
    pub async fn connect(addr: SocketAddr) -> RespClient {
        let stream = tokio::time::timeout(RESP_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timeout")
            .expect("connect");
        let (read_half, write_half) = stream.into_split();
        RespClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, args: &[&str]) {
        let mut buf = format!("*{}\r\n", args.len()).into_bytes();
        for arg in args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        tokio::time::timeout(RESP_TIMEOUT, self.writer.write_all(&buf))
            .await
            .expect("write timeout")
            .expect("write");
    }

    pub async fn cmd(&mut self, args: &[&str]) -> Reply {
        self.send(args).await;
        self.read_reply().await
    }

    /// One CRLF-terminated protocol line, without the terminator. Returns
    /// `None` at EOF.
    pub async fn try_read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(RESP_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("read timeout")
            .expect("read line");
        if n == 0 {
            return None;
        }
        Some(line.trim_end().to_string())
    }

    pub async fn read_line(&mut self) -> String {
        self.try_read_line().await.expect("unexpected EOF")
    }

    pub async fn read_reply(&mut self) -> Reply {
        let line = self.read_line().await;
        let (kind, rest) = line.split_at(1);
        match kind {
            "+" => Reply::Simple(rest.to_string()),
            "-" => Reply::Error(rest.to_string()),
            ":" => Reply::Int(rest.parse().expect("integer reply")),
            "$" => {
                let len: i64 = rest.parse().expect("bulk length");
                if len < 0 {
                    return Reply::Bulk(None);
                }
                let mut data = vec![0u8; len as usize + 2];
                tokio::time::timeout(RESP_TIMEOUT, self.reader.read_exact(&mut data))
                    .await
                    .expect("read timeout")
                    .expect("read bulk");
                data.truncate(len as usize);
                Reply::Bulk(Some(data))
            }
            "*" => Reply::ArrayHeader(rest.parse().expect("array length")),
            other => panic!("unknown reply kind {other:?} in line {line:?}"),
        }
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
