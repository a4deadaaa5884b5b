//! A fixed-capacity pool of job slots, fed by a FIFO queue.
//!
//! [`WorkerPool::submit`] never blocks and never rejects: the queue is
//! unbounded, and the pool's capacity limits how many items *run* at once,
//! not how many may wait. Items start in submission order.
//!
//! Each item runs in its own spawned task on the multi-threaded runtime, so
//! jobs execute in parallel and a panic in one is contained by its
//! [`JoinHandle`](tokio::task::JoinHandle). Whatever escapes a task, whether an
//! error or a panic, is reported to a fault handler instead of being lost.

use std::{
    any::Any,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::{StreamExt as _, channel::mpsc};
use tokio::task::JoinHandle;

use crate::{async_utils::BoxedFuture, prelude::*};

/// An async work function.
pub type WorkFn<Input> = Arc<dyn Fn(Input) -> BoxedFuture<Result<()>> + Send + Sync + 'static>;

/// Called when a work item's task fails or panics.
pub type FaultFn<Key> = Arc<dyn Fn(Key, WorkerFault) + Send + Sync + 'static>;

/// Something that escaped a work item's task.
#[derive(Debug, thiserror::Error)]
pub enum WorkerFault {
    #[error("{0:#}")]
    Failed(anyhow::Error),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("worker task was cancelled")]
    Cancelled,
}

/// A queued work item.
struct WorkItem<Key, Input> {
    key: Key,
    input: Input,
}

#[derive(Default)]
struct PoolCounters {
    queued: AtomicUsize,
    running: AtomicUsize,
}

/// A snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub queued: usize,
    pub running: usize,
}

/// See the module docs.
pub struct WorkerPool<Key, Input> {
    tx: mpsc::UnboundedSender<WorkItem<Key, Input>>,
    worker: JoinHandle<()>,
    counters: Arc<PoolCounters>,
    capacity: usize,
}

impl<Key, Input> WorkerPool<Key, Input>
where
    Key: fmt::Display + Send + 'static,
    Input: Send + 'static,
{
    /// Create a pool that runs up to `capacity` items at once.
    pub fn new(capacity: usize, work_fn: WorkFn<Input>, fault_fn: FaultFn<Key>) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("worker pool capacity must be at least 1"));
        }
        let (tx, rx) = mpsc::unbounded::<WorkItem<Key, Input>>();
        let counters = Arc::new(PoolCounters::default());
        let worker_counters = counters.clone();
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(capacity, move |item| {
                let work_fn = work_fn.clone();
                let fault_fn = fault_fn.clone();
                let counters = worker_counters.clone();
                async move {
                    counters.queued.fetch_sub(1, Ordering::SeqCst);
                    counters.running.fetch_add(1, Ordering::SeqCst);
                    let handle = tokio::spawn(work_fn(item.input));
                    let fault = match handle.await {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Some(WorkerFault::Failed(err)),
                        Err(err) if err.is_panic() => {
                            Some(WorkerFault::Panicked(panic_message(err.into_panic())))
                        }
                        Err(_) => Some(WorkerFault::Cancelled),
                    };
                    counters.running.fetch_sub(1, Ordering::SeqCst);
                    if let Some(fault) = fault {
                        error!(key = %item.key, %fault, "Work item faulted");
                        fault_fn(item.key, fault);
                    }
                }
            })
            .await;
            debug!("Worker pool queue closed");
        });
        Ok(Self {
            tx,
            worker,
            counters,
            capacity,
        })
    }

    /// Queue an item. Returns immediately.
    pub fn submit(&self, key: Key, input: Input) -> Result<()> {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        self.tx
            .unbounded_send(WorkItem { key, input })
            .map_err(|_| {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                anyhow!("worker pool has shut down")
            })
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            queued: self.counters.queued.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, and wait for everything already queued to finish.
    pub async fn close(self) -> Result<()> {
        drop(self.tx);
        self.worker.await.context("worker pool task failed")
    }
}

/// Extract a readable message from a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
