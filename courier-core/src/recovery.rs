//! # Unseen message recovery
//!
//! Periodically asks the broker for every message this client has not
//! acknowledged yet and replays them through the registry, in broker order.
//!
//! Runs never overlap: a run that finds the slot taken returns
//! [`RecoveryOutcome::Skipped`] immediately instead of queueing behind the
//! run in flight. The next tick picks up whatever is still unseen.

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    metrics,
    pool::WorkerPool,
    registry::ListenerRegistry,
    scheduler::TaskScheduler,
    transport::{Broker, ResponseStatus},
};

/// Result of one [`RecoveryJob::run_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// a previous run still held the slot, nothing was queried
    Skipped,
    /// the unseen query failed
    Failed,
    /// the broker answered with an error status
    Rejected,
    /// the batch was processed
    Completed {
        /// messages handled successfully
        delivered: usize,
        /// messages with no listener or a failing one
        failed: usize,
    },
}

/// Replays unseen messages into the [`ListenerRegistry`].
#[derive(Debug)]
pub struct RecoveryJob {
    broker: Arc<dyn Broker>,
    registry: Arc<ListenerRegistry>,
    slot: Mutex<()>,
}

impl RecoveryJob {
    /// new recovery job
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            broker,
            registry,
            slot: Mutex::new(()),
        }
    }

    /// Query the broker once and dispatch the batch.
    pub async fn run_once(&self) -> RecoveryOutcome {
        let Ok(_slot) = self.slot.try_lock() else {
            metrics::RECOVERY_SKIPPED.inc();
            warn!("unseen recovery skipped, previous run still in flight and holding the slot");
            return RecoveryOutcome::Skipped;
        };

        trace!("querying unseen messages");
        metrics::RECOVERY_RUNS.inc();
        let response = match self.broker.query_unseen().await {
            Ok(response) => response,
            Err(err) => {
                metrics::RECOVERY_FAILED.inc();
                error!(error = %err, "unseen query failed");
                return RecoveryOutcome::Failed;
            }
        };
        if response.status != ResponseStatus::Ok {
            metrics::RECOVERY_FAILED.inc();
            warn!(status = ?response.status, "broker rejected unseen query");
            return RecoveryOutcome::Rejected;
        }

        let mut delivered = 0;
        let mut failed = 0;
        for message in &response.messages {
            let result = match self.registry.listener_for_channel(&message.channel) {
                Ok(listener) => listener.handle(message).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    delivered += 1;
                    metrics::RECOVERY_MESSAGES.inc();
                }
                Err(err) => {
                    failed += 1;
                    warn!(
                        channel = %message.channel,
                        message_id = ?message.message_id,
                        error = %err,
                        "failed to recover message"
                    );
                }
            }
        }

        debug!(delivered, failed, "unseen recovery finished");
        RecoveryOutcome::Completed { delivered, failed }
    }

    /// Run this job every `period` on `pool`.
    pub fn spawn(self: &Arc<Self>, scheduler: &TaskScheduler, period: Duration, pool: Arc<WorkerPool>) {
        let job = Arc::clone(self);
        scheduler.schedule_on_pool("unseen_recovery", period, pool, move || {
            let job = Arc::clone(&job);
            async move {
                job.run_once().await;
                anyhow::Ok(())
            }
        });
    }
}
