#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod hooks;
mod startup_health;

use courier_core::{
    client::CourierClient,
    config::{
        cli::{self, Parser},
        trace,
    },
    listener::{ErrorStrategy, HandlerPolicy, ListenerEntry},
    state::state_channel,
};
use external_api::{ExternalApi, Health};
use hooks::{HealthHooks, TapListener};
use nats_transport::{NatsClient, NatsConfig, NatsTransport, SubjectResolver};
use startup_health::verify_startup_subsystems;
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // loaded before parsing so `.env` values reach the env fallbacks
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.courier_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start courier"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    info!(service_name = %config.service_name, "starting courier");
    let token = CancellationToken::new();
    let (notifier, receiver) = state_channel();

    let nats_config = NatsConfig::try_from(&config).context("invalid NATS configuration")?;
    let resolver = SubjectResolver::with_prefix(&config.subject_prefix)
        .map_err(|e| anyhow!("subject resolver error: {e}"))?;
    let nats_client = NatsClient::new(nats_config, resolver, notifier);
    let transport = Arc::new(NatsTransport::new(
        nats_client.clone(),
        config.service_name.clone(),
    ));

    let client = CourierClient::new(
        config.delivery(),
        transport.clone(),
        transport,
        token.clone(),
    );
    for channel in config
        .tap_channels
        .iter()
        .map(|channel| channel.trim())
        .filter(|channel| !channel.is_empty())
    {
        debug!(%channel, "registering tap listener");
        client
            .register(
                ListenerEntry::new(channel, TapListener::new(channel))
                    .with_policy(HandlerPolicy::AsyncSeen)
                    .with_error_strategy(ErrorStrategy::Acknowledge),
            )
            .await;
    }

    // start external api for healthchecks
    let api = ExternalApi::new(config.external_api, Arc::clone(client.registry()));
    let api_sender = api.sender();
    client.start(
        receiver,
        Arc::new(HealthHooks::new(api_sender.clone())),
        Arc::new(nats_client.clone()),
    );
    let mut api_task = api.start(token.clone());

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) = verify_startup_subsystems(&mut api_task, &client).await {
        let _ = api_sender.send(Health::Bad).await;
        client.shutdown().await;
        token.cancel();
        return Err(err);
    }

    info!("connecting to NATS");
    if let Err(err) = nats_client
        .connect()
        .await
        .map_err(|e| anyhow!("NATS connection failed: {e}"))
    {
        let _ = api_sender.send(Health::Bad).await;
        client.shutdown().await;
        token.cancel();
        return Err(err);
    }
    info!("NATS connection established");

    shutdown_signal(token.clone()).await?;
    info!("shutdown signal received");

    let _ = api_sender.send(Health::Bad).await;
    client.shutdown().await;
    nats_client.disconnect().await;
    token.cancel();
    if let Err(err) = api_task.await {
        error!(?err, "error waiting for web server API");
    }
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|err| anyhow!(err))?
            .recv()
            .await;
        Ok::<_, anyhow::Error>(())
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    let ret = tokio::select! {
        ret = signal::ctrl_c() => ret.map_err(|err| anyhow!(err)),
        ret = terminate => ret,
        _ = token.cancelled() => Ok(()),
    };
    token.cancel();
    ret
}
