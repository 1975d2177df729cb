//! # Connection state controller
//!
//! The controller is the only owner of [`ConnectionState`]. The transport
//! pushes raw notifications through a [`StateNotifier`]; the controller task
//! applies them one at a time and fires the side effects:
//!
//! ```text
//! Connected (state changed)  ──► registry.re_register_all() ──► lifecycle.initialize()
//! Connected (unchanged)      ──► nothing
//! Disconnected (always)      ──► refresher.refresh()        ──► lifecycle.destroy()
//! ```
//!
//! Repeated `Connected` notifications are ignored so a flapping transport
//! does not re-initialize the application over and over. `Disconnected` is
//! never gated, so every disconnect signal gets a fresh refresh attempt.
//!
//! Side effects that fail or panic are logged and counted. The new state is
//! stored regardless and the controller keeps processing notifications.

use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::{error::panic_message, metrics, registry::ListenerRegistry, transport::ConnectionState};

/// Application hooks run on connect and disconnect.
#[async_trait]
pub trait LifecycleHooks: Send + Sync + 'static {
    /// the transport is live and every listener is subscribed
    async fn initialize(&self) -> anyhow::Result<()>;
    /// the transport went away
    async fn destroy(&self) -> anyhow::Result<()>;
}

/// Lifecycle hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

#[async_trait]
impl LifecycleHooks for NoopLifecycle {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Obtains a fresh transport configuration or connection after a disconnect.
#[async_trait]
pub trait ConnectionRefresher: Send + Sync + 'static {
    /// refresh the connection
    async fn refresh(&self) -> anyhow::Result<()>;
}

/// Create a connected notifier/receiver pair.
pub fn state_channel() -> (StateNotifier, StateReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StateNotifier { tx }, StateReceiver { rx })
}

/// Sending half handed to the transport. Cloneable, never blocks.
#[derive(Debug, Clone)]
pub struct StateNotifier {
    tx: mpsc::UnboundedSender<ConnectionState>,
}

impl StateNotifier {
    /// Report a connectivity change. Dropped if the controller has stopped.
    pub fn notify(&self, state: ConnectionState) {
        if self.tx.send(state).is_err() {
            debug!(%state, "state controller stopped, dropping notification");
        }
    }
}

/// Receiving half consumed by [`ConnectionStateController::spawn`].
#[derive(Debug)]
pub struct StateReceiver {
    rx: mpsc::UnboundedReceiver<ConnectionState>,
}

impl StateReceiver {
    /// Next notification, `None` once every notifier is dropped.
    pub async fn recv(&mut self) -> Option<ConnectionState> {
        self.rx.recv().await
    }
}

/// Owner of the connection state.
pub struct ConnectionStateController {
    state: ConnectionState,
    registry: Arc<ListenerRegistry>,
    lifecycle: Arc<dyn LifecycleHooks>,
    refresher: Arc<dyn ConnectionRefresher>,
}

impl fmt::Debug for ConnectionStateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateController")
            .field("state", &self.state)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ConnectionStateController {
    /// controller starting in [`ConnectionState::Unknown`]
    pub fn new(
        registry: Arc<ListenerRegistry>,
        lifecycle: Arc<dyn LifecycleHooks>,
        refresher: Arc<dyn ConnectionRefresher>,
    ) -> Self {
        Self {
            state: ConnectionState::Unknown,
            registry,
            lifecycle,
            refresher,
        }
    }

    /// Apply one notification. Redundant notifications are tolerated.
    pub async fn on_transport_state_change(&mut self, new_state: ConnectionState) {
        let changed = new_state != self.state;
        metrics::STATE_NOTIFICATIONS
            .with_label_values(&[state_label(new_state)])
            .inc();
        debug!(from = %self.state, to = %new_state, changed, "transport state notification");

        match new_state {
            ConnectionState::Connected if changed => {
                info!("transport connected, re-registering listeners");
                run_hook("re_register_all", self.registry.re_register_all()).await;
                run_hook("initialize", self.lifecycle.initialize()).await;
            }
            ConnectionState::Connected => {
                trace!("already connected, ignoring notification");
            }
            ConnectionState::Disconnected => {
                warn!("transport disconnected, refreshing connection");
                run_hook("refresh", self.refresher.refresh()).await;
                run_hook("destroy", self.lifecycle.destroy()).await;
            }
            ConnectionState::Unknown => {}
        }

        self.state = new_state;
        metrics::CONNECTION_STATE.set(i64::from(new_state == ConnectionState::Connected));
    }

    /// Run the controller until `token` is cancelled or every notifier is
    /// dropped.
    pub fn spawn(mut self, mut receiver: StateReceiver, token: CancellationToken) -> JoinHandle<()> {
        let actor = async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    state = receiver.recv() => match state {
                        Some(state) => self.on_transport_state_change(state).await,
                        None => break,
                    },
                }
            }
            debug!(state = %self.state, "state controller stopped");
        };
        tokio::spawn(actor.in_current_span())
    }
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Unknown => "unknown",
        ConnectionState::Connected => "connected",
        ConnectionState::Disconnected => "disconnected",
    }
}

async fn run_hook<F, E>(hook: &'static str, fut: F)
where
    F: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let err = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{err:#}"),
        Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
    };
    metrics::HOOK_FAILURES.with_label_values(&[hook]).inc();
    error!(hook, error = %err, "state transition side effect failed");
}
