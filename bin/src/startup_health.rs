use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use courier_core::client::CourierClient;
use tokio::task::JoinHandle;

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// Health stays BAD until the external api and the state controller have
/// survived the stabilization window.
pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    client: &CourierClient,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .context("startup check failed")?;
    if !client.is_running() {
        return Err(anyhow!("state controller is not running")).context("startup check failed");
    }
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}
