//! # Bounded worker pool with caller-runs backpressure.
//!
//! ```text
//! execute(job)
//!     │
//!     ├── try_send ──► [queue, capacity N] ──► worker 1..size ──► job.await
//!     │                                              └──► panic → logged, counted
//!     └── Full / Closed ──► job.await on the caller
//! ```
//!
//! A job is never dropped: when the queue is saturated, or the pool is shut
//! down, the submitting task runs it itself. Workers share one queue, so jobs
//! submitted from different callers have no relative ordering.

use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, warn};

use crate::{error::panic_message, metrics};

type Job = BoxFuture<'static, ()>;

/// Size and queue capacity of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// number of worker tasks
    pub size: usize,
    /// jobs that may wait in the queue before callers run them
    pub capacity: usize,
}

impl PoolConfig {
    /// new pool config, both values are raised to at least 1
    pub fn new(size: usize, capacity: usize) -> Self {
        Self {
            size: size.max(1),
            capacity: capacity.max(1),
        }
    }
}

/// A fixed set of tokio tasks draining one bounded job queue.
pub struct WorkerPool {
    name: &'static str,
    config: PoolConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `config.size` workers. Must be called from within a tokio runtime.
    pub fn new(name: &'static str, config: PoolConfig) -> Self {
        let config = PoolConfig::new(config.size, config.capacity);
        let (tx, rx) = mpsc::channel::<Job>(config.capacity);
        let rx = Arc::new(AsyncMutex::new(rx));

        let workers = (0..config.size)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let worker = async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        metrics::POOL_QUEUED.with_label_values(&[name]).dec();
                        run_guarded(name, job).await;
                    }
                    debug!(pool = name, worker = id, "pool worker stopped");
                };
                tokio::spawn(worker.in_current_span())
            })
            .collect();

        debug!(pool = name, size = config.size, capacity = config.capacity, "started worker pool");
        Self {
            name,
            config,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// pool name, used as the metrics label
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// pool size and capacity
    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Queue `job` for a worker. If the queue is full or the pool is shut
    /// down, `job` runs to completion on the caller before this returns.
    pub async fn execute<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);
        let sender = self.sender.lock().clone();
        let job = match sender {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => {
                    metrics::POOL_QUEUED.with_label_values(&[self.name]).inc();
                    return;
                }
                Err(mpsc::error::TrySendError::Full(job)) => {
                    debug!(pool = self.name, "queue saturated, running job on caller");
                    job
                }
                Err(mpsc::error::TrySendError::Closed(job)) => job,
            },
            None => job,
        };
        metrics::POOL_CALLER_RUNS.with_label_values(&[self.name]).inc();
        run_guarded(self.name, job).await;
    }

    /// Stop accepting jobs and wait up to `grace` for queued and running jobs
    /// to finish. Returns false if the grace period ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return true;
        }

        match tokio::time::timeout(grace, futures::future::join_all(workers)).await {
            Ok(_) => {
                debug!(pool = self.name, "worker pool drained");
                true
            }
            Err(_) => {
                warn!(pool = self.name, grace_ms = grace.as_millis() as u64, "worker pool did not drain in time");
                false
            }
        }
    }
}

async fn run_guarded(pool: &'static str, job: Job) {
    if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
        metrics::POOL_JOB_PANICS.with_label_values(&[pool]).inc();
        error!(pool, panic = %panic_message(panic.as_ref()), "pool job panicked");
    }
}
