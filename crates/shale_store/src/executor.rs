//! Request worker pools.
//!
//! Each pool is a single-worker executor: one owned task draining one queue,
//! so every job scheduled on a pool runs in submission order. Sessions are
//! deterministically affine to a pool, which serializes all commands of one
//! session.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::stats::PoolMatrix;

type Work = Box<dyn FnOnce() -> BoxFuture<'static, Result<Bytes>> + Send>;

struct Job {
    enqueued: Instant,
    work: Work,
    reply: oneshot::Sender<Result<Bytes>>,
}

pub struct WorkerPool {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    matrix: Arc<PoolMatrix>,
}

impl WorkerPool {
    /// Spawn the pool's single worker task.
    pub fn startup(name: String, matrix: Arc<PoolMatrix>) -> Arc<WorkerPool> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_matrix = Arc::clone(&matrix);
        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            tracing::debug!(pool = %worker_name, "worker pool started");
            while let Some(job) = rx.recv().await {
                worker_matrix
                    .queue_time_ns
                    .fetch_add(job.enqueued.elapsed().as_nanos() as u64, Ordering::Relaxed);
                worker_matrix.in_queue.fetch_sub(1, Ordering::Relaxed);

                let started = Instant::now();
                let result = (job.work)().await;
                worker_matrix
                    .execute_time_ns
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
                worker_matrix.executed.fetch_add(1, Ordering::Relaxed);

                // The requester may have gone away; that is not an error.
                let _ = job.reply.send(result);
            }
            tracing::debug!(pool = %worker_name, "worker pool drained");
        });
        Arc::new(WorkerPool {
            name,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            matrix,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue one job and wait for its result.
    pub async fn schedule<F>(&self, work: F) -> Result<Bytes>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Bytes>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            enqueued: Instant::now(),
            work: Box::new(work),
            reply: reply_tx,
        };
        {
            let tx = self.tx.lock().unwrap();
            let Some(tx) = tx.as_ref() else {
                return Err(Error::busy(format!("worker pool {} is stopped", self.name)));
            };
            self.matrix.in_queue.fetch_add(1, Ordering::Relaxed);
            if tx.send(job).is_err() {
                self.matrix.in_queue.fetch_sub(1, Ordering::Relaxed);
                return Err(Error::busy(format!("worker pool {} is stopped", self.name)));
            }
        }
        reply_rx
            .await
            .map_err(|_| Error::internal(format!("worker pool {} dropped a job", self.name)))?
    }

    /// Close the queue, let the worker drain what is already queued, then
    /// join it.
    pub async fn stop(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(pool = %self.name, error = ?err, "worker pool join failed");
            }
        }
    }
}
