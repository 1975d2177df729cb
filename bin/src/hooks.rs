//! Application side of the control plane wired by the binary.

use async_trait::async_trait;
use courier_core::{listener::EventListener, state::LifecycleHooks};
use external_api::Health;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Flips the external api health: GOOD once initialized, BAD once destroyed.
/// Never waits on the api, a full health queue drops the update.
#[derive(Debug, Clone)]
pub struct HealthHooks {
    sender: mpsc::Sender<Health>,
}

impl HealthHooks {
    pub fn new(sender: mpsc::Sender<Health>) -> Self {
        Self { sender }
    }

    fn set(&self, health: Health) -> anyhow::Result<()> {
        match self.sender.try_send(health) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(%health, "health queue is full, update dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(anyhow::anyhow!("health listener is gone, cannot report {health}"))
            }
        }
    }
}

#[async_trait]
impl LifecycleHooks for HealthHooks {
    async fn initialize(&self) -> anyhow::Result<()> {
        debug!("changing health to good");
        self.set(Health::Good)
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        debug!("changing health to bad");
        self.set(Health::Bad)
    }
}

/// Logs every message received on its channel.
#[derive(Debug, Clone)]
pub struct TapListener {
    channel: String,
}

impl TapListener {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl EventListener for TapListener {
    async fn handle(&self, body: &str) -> anyhow::Result<()> {
        info!(channel = %self.channel, %body, "message received");
        Ok(())
    }
}
