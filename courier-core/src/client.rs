//! # Courier client
//!
//! Wires the delivery control plane together from a [`DeliveryConfig`], a
//! [`Transport`] and a [`Broker`]:
//!
//! ```text
//! transport events ──► StateNotifier ──► ConnectionStateController ──► registry / lifecycle / refresher
//! scheduler ──► recovery pool ──► RecoveryJob ──► registry ──► listeners ──► seen pool
//! application ──► PublishDispatcher ──► publish pool / caller ──► RetryExecutor ──► transport
//! ```

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DeliveryConfig,
    error::DeliveryResult,
    listener::ListenerEntry,
    pool::WorkerPool,
    publisher::{PublishDispatcher, PublishRequest},
    recovery::{RecoveryJob, RecoveryOutcome},
    registry::{BoundListener, ListenerRegistry},
    retry::{RetryExecutor, RetryPolicy},
    scheduler::TaskScheduler,
    seen::SeenAcknowledger,
    state::{ConnectionRefresher, ConnectionStateController, LifecycleHooks, StateReceiver},
    transport::{Broker, Transport},
};

/// The assembled control plane. Create inside a tokio runtime.
#[derive(Debug)]
pub struct CourierClient {
    config: DeliveryConfig,
    token: CancellationToken,
    registry: Arc<ListenerRegistry>,
    dispatcher: PublishDispatcher,
    recovery: Arc<RecoveryJob>,
    scheduler: TaskScheduler,
    seen_pool: Arc<WorkerPool>,
    recovery_pool: Arc<WorkerPool>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl CourierClient {
    /// Build pools, registry, recovery and dispatcher. Nothing runs until
    /// [`start`](Self::start). Cancelling `token` stops the client's tasks.
    pub fn new(
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        broker: Arc<dyn Broker>,
        token: CancellationToken,
    ) -> Self {
        let token = token.child_token();
        let seen_pool = Arc::new(WorkerPool::new("seen", config.seen_pool));
        let recovery_pool = Arc::new(WorkerPool::new("recovery", config.recovery_pool));
        let publish_pool = Arc::new(WorkerPool::new("publish", config.publish_pool));

        let acks = SeenAcknowledger::new(Arc::clone(&broker), Arc::clone(&seen_pool));
        let registry = Arc::new(ListenerRegistry::new(Arc::clone(&transport), acks));
        let recovery = Arc::new(RecoveryJob::new(broker, Arc::clone(&registry)));
        let retry = RetryExecutor::new(
            RetryPolicy::always(config.publish_backoff),
            token.child_token(),
        );
        let dispatcher = PublishDispatcher::new(transport, publish_pool, retry)
            .with_event_modes(config.event_modes.iter().cloned());

        Self {
            scheduler: TaskScheduler::new(token.clone()),
            config,
            token,
            registry,
            dispatcher,
            recovery,
            seen_pool,
            recovery_pool,
            controller: Mutex::new(None),
        }
    }

    /// Start the state controller on `receiver` and the recovery schedule.
    pub fn start(
        &self,
        receiver: StateReceiver,
        lifecycle: Arc<dyn LifecycleHooks>,
        refresher: Arc<dyn ConnectionRefresher>,
    ) {
        let controller =
            ConnectionStateController::new(Arc::clone(&self.registry), lifecycle, refresher);
        let handle = controller.spawn(receiver, self.token.child_token());
        if let Some(previous) = self.controller.lock().replace(handle) {
            warn!("courier client started twice, stopping previous controller");
            previous.abort();
        }
        self.recovery.spawn(
            &self.scheduler,
            self.config.recovery_period,
            Arc::clone(&self.recovery_pool),
        );
        info!(
            recovery_period_secs = self.config.recovery_period.as_secs(),
            listeners = self.registry.len(),
            "courier client started"
        );
    }

    /// Register a listener.
    pub async fn register(&self, entry: ListenerEntry) -> Arc<BoundListener> {
        self.registry.register(entry).await
    }

    /// Publish through the dispatcher.
    pub async fn publish<T: Serialize>(&self, request: PublishRequest<T>) -> DeliveryResult<()> {
        self.dispatcher.publish(request).await
    }

    /// Run one recovery pass now, outside the schedule.
    pub async fn recover_now(&self) -> RecoveryOutcome {
        self.recovery.run_once().await
    }

    /// listener registry
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// delivery settings
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// True while the controller task is alive.
    pub fn is_running(&self) -> bool {
        self.controller
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop schedules, drain pools within the configured grace period,
    /// interrupt pending publish retries and drop live subscriptions.
    pub async fn shutdown(&self) {
        let grace = self.config.shutdown_grace;
        info!(grace_ms = grace.as_millis() as u64, "shutting down courier client");
        self.scheduler.shutdown(grace).await;
        self.dispatcher.shutdown(grace).await;
        drain("recovery", &self.recovery_pool, grace).await;
        drain("seen", &self.seen_pool, grace).await;
        self.registry.unsubscribe_all().await;

        self.token.cancel();
        let controller = self.controller.lock().take();
        if let Some(handle) = controller {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("state controller did not stop in time");
            }
        }
        debug!("courier client stopped");
    }
}

async fn drain(name: &str, pool: &WorkerPool, grace: Duration) {
    if !pool.shutdown(grace).await {
        warn!(pool = name, "pool did not drain before shutdown grace expired");
    }
}
