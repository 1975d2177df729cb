//! Fixed-rate scheduling with one central error handler.
//!
//! Every schedule is a tokio task driving an interval until the scheduler's
//! token is cancelled. A run that fails or panics is logged and counted by
//! [`run_scheduled`]; the schedule itself keeps ticking.

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace, warn};

use crate::{error::panic_message, metrics, pool::WorkerPool};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Owns the periodic tasks of the client.
#[derive(Debug)]
pub struct TaskScheduler {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TaskScheduler {
    /// Schedules stop when `token` (or [`shutdown`](Self::shutdown)) cancels.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token: token.child_token(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` every `period`, starting immediately, on the schedule's
    /// own task. A slow run delays the next tick instead of overlapping it.
    pub fn schedule_at_fixed_rate<F, Fut>(&self, name: &'static str, period: Duration, task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_schedule(name, period, None, task);
    }

    /// Like [`schedule_at_fixed_rate`](Self::schedule_at_fixed_rate) but each
    /// run is submitted to `pool`, so runs may overlap when the pool has more
    /// than one worker.
    pub fn schedule_on_pool<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        pool: Arc<WorkerPool>,
        task: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_schedule(name, period, Some(pool), task);
    }

    fn spawn_schedule<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        pool: Option<Arc<WorkerPool>>,
        mut task: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.token.clone();
        let period = period.max(MIN_PERIOD);
        let schedule = async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(task = name, period_ms = period.as_millis() as u64, "schedule started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(task = name, "schedule stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let run = run_scheduled(name, task());
                        match &pool {
                            Some(pool) => pool.execute(run).await,
                            None => run.await,
                        }
                    }
                }
            }
        };
        let handle = tokio::spawn(schedule.in_current_span());
        self.tasks.lock().push((name, handle));
    }

    /// Cancel every schedule and wait up to `grace` for in-flight runs.
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(task = name, "scheduled task still running after grace period, aborting");
                abort.abort();
            }
        }
    }
}

/// Central error handler for scheduled runs.
async fn run_scheduled<Fut>(name: &'static str, run: Fut)
where
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    trace!(task = name, "running scheduled task");
    let err = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{err:#}"),
        Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
    };
    metrics::SCHEDULED_TASK_ERRORS.with_label_values(&[name]).inc();
    error!(task = name, error = %err, "error in scheduled task");
}
