//! Connected-client state shared between the network loop and the
//! coordinator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

/// Per-connection context: current database, monitor flag, auth state and
/// the close-after-reply latch set by QUIT.
#[derive(Default)]
pub struct SessionCtx {
    db_id: AtomicU32,
    is_monitor: AtomicBool,
    authed: AtomicBool,
    close_after_reply: AtomicBool,
}

impl SessionCtx {
    pub fn db_id(&self) -> u32 {
        self.db_id.load(Ordering::Relaxed)
    }

    pub fn set_db_id(&self, db: u32) {
        self.db_id.store(db, Ordering::Relaxed);
    }

    pub fn is_monitor(&self) -> bool {
        self.is_monitor.load(Ordering::Relaxed)
    }

    pub fn set_monitor(&self, on: bool) {
        self.is_monitor.store(on, Ordering::Relaxed);
    }

    pub fn authed(&self) -> bool {
        self.authed.load(Ordering::Relaxed)
    }

    pub fn set_authed(&self, on: bool) {
        self.authed.store(on, Ordering::Relaxed);
    }

    pub fn close_after_reply(&self) -> bool {
        self.close_after_reply.load(Ordering::Relaxed)
    }

    pub fn set_close_after_reply(&self) {
        self.close_after_reply.store(true, Ordering::Relaxed);
    }
}

/// Shared handle to a live session, held by the registry and the monitor
/// list. The socket itself stays with the session's network task.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub remote: SocketAddr,
    pub ctx: Arc<SessionCtx>,
    out_tx: mpsc::UnboundedSender<Bytes>,
    cancel: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn new(
        id: u64,
        remote: SocketAddr,
        out_tx: mpsc::UnboundedSender<Bytes>,
        cancel: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            id,
            remote,
            ctx: Arc::new(SessionCtx::default()),
            out_tx,
            cancel,
        }
    }

    /// Queue raw bytes for out-of-band delivery (the monitor feed). Returns
    /// whether the session's writer is still alive.
    pub fn push_out_of_band(&self, payload: Bytes) -> bool {
        self.out_tx.send(payload).is_ok()
    }

    /// Cooperative cancel: interrupts the session's next I/O operation.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (SessionHandle, mpsc::UnboundedReceiver<Bytes>, watch::Receiver<bool>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = SessionHandle::new(
            7,
            "127.0.0.1:4242".parse().unwrap(),
            out_tx,
            Arc::new(cancel_tx),
        );
        (handle, out_rx, cancel_rx)
    }

    #[test]
    fn ctx_defaults() {
        let (handle, _out, _cancel) = handle();
        assert_eq!(handle.ctx.db_id(), 0);
        assert!(!handle.ctx.is_monitor());
        assert!(!handle.ctx.authed());
        assert!(!handle.ctx.close_after_reply());
    }

    #[test]
    fn out_of_band_delivery_and_cancel() {
        let (handle, mut out, cancel) = handle();
        assert!(handle.push_out_of_band(Bytes::from_static(b"+line\r\n")));
        assert_eq!(&out.try_recv().unwrap()[..], b"+line\r\n");

        assert!(!*cancel.borrow());
        handle.cancel();
        assert!(*cancel.borrow());

        drop(out);
        assert!(!handle.push_out_of_band(Bytes::new()));
    }
}
