//! RESP listener and per-session I/O loops.
//!
//! The listener is prepared (bound) early in startup but only starts
//! accepting when `run` is called, strictly last. Each accepted socket gets
//! an owned session task that frames RESP commands, feeds the dispatcher,
//! writes replies, and drains the out-of-band channel used by the monitor
//! broadcast.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use futures_util::StreamExt;
use redis_protocol::codec::Resp2;
use redis_protocol::error::RedisProtocolError;
use redis_protocol::resp2::types::BytesFrame;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::server::{DispatchOutcome, Server};
use crate::session::SessionHandle;

/// A connection in replication custody keeps its codec.
pub type ReplicaConn = Framed<TcpStream, Resp2>;

/// The session's connection, with the capability to yield the underlying
/// socket. Once borrowed the session is terminally detached: the framework
/// never reads or writes that socket again.
pub struct SessionConn {
    framed: Option<Framed<TcpStream, Resp2>>,
}

impl SessionConn {
    fn new(framed: Framed<TcpStream, Resp2>) -> Self {
        Self {
            framed: Some(framed),
        }
    }

    /// Transfer socket ownership to the caller.
    pub fn borrow_conn(&mut self) -> Result<ReplicaConn> {
        self.framed
            .take()
            .ok_or_else(|| Error::network("connection already detached"))
    }

    pub fn is_detached(&self) -> bool {
        self.framed.is_none()
    }

    async fn next_frame(&mut self) -> Option<std::result::Result<BytesFrame, RedisProtocolError>> {
        match self.framed.as_mut() {
            Some(framed) => framed.next().await,
            None => None,
        }
    }

    async fn write_raw(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let Some(framed) = self.framed.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session detached",
            ));
        };
        let stream = framed.get_mut();
        stream.write_all(payload).await?;
        stream.flush().await
    }
}

pub struct Network {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Network {
    /// Bind the listen socket without accepting yet.
    pub fn prepare(bind_ip: &str, port: u16) -> anyhow::Result<Arc<Network>> {
        let std_listener = std::net::TcpListener::bind((bind_ip, port))
            .with_context(|| format!("bind {bind_ip}:{port}"))?;
        std_listener
            .set_nonblocking(true)
            .context("set listener nonblocking")?;
        let listener = TcpListener::from_std(std_listener).context("register listener")?;
        let local_addr = listener.local_addr().context("listener local addr")?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Network {
            local_addr,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections.
    pub fn run(&self, server: Weak<Server>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::internal("network already running"))?;
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, remote)) => {
                                let Some(server) = server.upgrade() else { break };
                                let _ = socket.set_nodelay(true);
                                server.net_matrix().conn_created.fetch_add(1, Ordering::Relaxed);
                                spawn_session(&server, socket, remote);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "accept failed");
                            }
                        }
                    }
                }
            }
            tracing::debug!("acceptor exits");
        });
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Refuse new connections and join the acceptor.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        *self.listener.lock().unwrap() = None;
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "acceptor join failed");
            }
        }
    }
}

fn spawn_session(server: &Arc<Server>, socket: TcpStream, remote: SocketAddr) {
    let id = server.next_session_id();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = SessionHandle::new(id, remote, out_tx, Arc::new(cancel_tx));
    let runner = SessionRunner {
        server: Arc::downgrade(server),
        handle: handle.clone(),
        conn: SessionConn::new(Framed::new(socket, Resp2::default())),
        out_rx,
        cancel_rx,
    };
    if !server.add_session(handle, runner) {
        server.stat().rejected_conn.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owns one session's socket and drives its read/dispatch/write loop.
pub struct SessionRunner {
    server: Weak<Server>,
    handle: SessionHandle,
    conn: SessionConn,
    out_rx: mpsc::UnboundedReceiver<Bytes>,
    cancel_rx: watch::Receiver<bool>,
}

impl SessionRunner {
    /// The driving edge of the session state machine.
    pub fn start(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let id = self.handle.id;
        loop {
            tokio::select! {
                _ = self.cancel_rx.changed() => break,
                line = self.out_rx.recv() => {
                    let Some(line) = line else { break };
                    if self.conn.write_raw(&line).await.is_err() {
                        break;
                    }
                    if let Some(server) = self.server.upgrade() {
                        server.stat().net_output_bytes.fetch_add(line.len() as u64, Ordering::Relaxed);
                    }
                }
                frame = self.conn.next_frame() => {
                    let Some(server) = self.server.upgrade() else { break };
                    match frame {
                        None => break,
                        Some(Err(err)) => {
                            server.net_matrix().invalid_packets.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(session_id = id, error = %err, "bad RESP frame");
                            let _ = self.conn.write_raw(b"-ERR Protocol error\r\n").await;
                            break;
                        }
                        Some(Ok(frame)) => {
                            let args = match parse_args(frame, server.cfg().proto_max_bulk_len) {
                                Ok(Some(args)) => args,
                                Ok(None) => continue,
                                Err(msg) => {
                                    server.net_matrix().invalid_packets.fetch_add(1, Ordering::Relaxed);
                                    let _ = self
                                        .conn
                                        .write_raw(format!("-ERR Protocol error: {msg}\r\n").as_bytes())
                                        .await;
                                    break;
                                }
                            };
                            server
                                .stat()
                                .net_input_bytes
                                .fetch_add(resp2_encoded_len(&args), Ordering::Relaxed);
                            match server.process_request(&self.handle, &args, &mut self.conn).await {
                                DispatchOutcome::Reply(reply) => {
                                    let started = Instant::now();
                                    if self.conn.write_raw(&reply).await.is_err() {
                                        break;
                                    }
                                    server.req_matrix().send_packet_cost_ns.fetch_add(
                                        started.elapsed().as_nanos() as u64,
                                        Ordering::Relaxed,
                                    );
                                    server
                                        .stat()
                                        .net_output_bytes
                                        .fetch_add(reply.len() as u64, Ordering::Relaxed);
                                    if self.handle.ctx.close_after_reply() {
                                        break;
                                    }
                                }
                                // The socket belongs to replication now.
                                DispatchOutcome::Detached => break,
                                DispatchOutcome::Closed => break,
                            }
                        }
                    }
                }
            }
        }
        if let Some(server) = self.server.upgrade() {
            server.net_matrix().conn_released.fetch_add(1, Ordering::Relaxed);
            server.end_session(id);
        }
    }
}

/// Flatten a RESP array frame into an argument vector.
fn parse_args(
    frame: BytesFrame,
    max_bulk_len: usize,
) -> std::result::Result<Option<Vec<Vec<u8>>>, String> {
    let BytesFrame::Array(parts) = frame else {
        return Err("expected array".to_string());
    };
    if parts.is_empty() {
        return Ok(None);
    }
    let mut args = Vec::with_capacity(parts.len());
    for part in parts {
        let arg = match part {
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => b.to_vec(),
            _ => return Err("expected bulk string".to_string()),
        };
        if arg.len() > max_bulk_len {
            return Err("invalid bulk length".to_string());
        }
        args.push(arg);
    }
    Ok(Some(args))
}

/// Wire size of the RESP2 encoding of an argument vector.
fn resp2_encoded_len(args: &[Vec<u8>]) -> u64 {
    fn digits(mut n: usize) -> usize {
        let mut d = 1;
        while n >= 10 {
            n /= 10;
            d += 1;
        }
        d
    }
    let mut total = 1 + digits(args.len()) + 2;
    for arg in args {
        total += 1 + digits(arg.len()) + 2 + arg.len() + 2;
    }
    total as u64
}
