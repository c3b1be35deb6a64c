//! A fixed set of workers consuming a shared, bounded job queue.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info_span, trace, Instrument};

#[derive(Clone, Debug)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("worker pool has been stopped")]
pub struct PoolStopped;

/// Resolves once its job has run.
#[derive(Debug)]
pub struct JobHandle(oneshot::Receiver<()>);

#[derive(Debug)]
struct Inner {
    workers: usize,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Job {
    run: BoxFuture<'static, ()>,
    done: oneshot::Sender<()>,
}

// === impl WorkerPool ===

impl WorkerPool {
    /// Spawns `workers` workers, or one per available CPU if `workers` is 0.
    pub fn new(workers: usize) -> Self {
        let workers = match workers {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };

        let (tx, rx) = mpsc::channel::<Job>(workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| tokio::spawn(work(rx.clone()).instrument(info_span!("worker", id))))
            .collect();
        debug!(workers, "Started worker pool");

        Self {
            inner: Arc::new(Inner {
                workers,
                tx: Mutex::new(Some(tx)),
                handles: Mutex::new(handles),
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Queues a job, waiting for room if the queue is full.
    pub async fn add_job<F>(&self, job: F) -> Result<JobHandle, PoolStopped>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.inner.tx.lock().clone().ok_or(PoolStopped)?;
        let (done, rx) = oneshot::channel();
        tx.send(Job {
            run: Box::pin(job),
            done,
        })
        .await
        .map_err(|_| PoolStopped)?;
        Ok(JobHandle(rx))
    }

    /// Closes the queue and waits for every worker to finish the jobs already
    /// queued.
    pub async fn stop(&self) {
        drop(self.inner.tx.lock().take());
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                error!(%error, "Worker failed");
            }
        }
        debug!("Stopped worker pool");
    }
}

async fn work(rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(Job { run, done }) = next else {
            trace!("Queue closed");
            return;
        };

        // Running the job on its own task keeps a panic from taking down the
        // worker.
        match tokio::spawn(run).await {
            Ok(()) => {
                let _ = done.send(());
            }
            Err(error) if error.is_panic() => error!(%error, "Job panicked"),
            Err(error) => debug!(%error, "Job cancelled"),
        }
    }
}

// === impl JobHandle ===

impl JobHandle {
    /// Waits for the job. Returns false if it panicked.
    pub async fn wait(self) -> bool {
        self.0.await.is_ok()
    }
}
