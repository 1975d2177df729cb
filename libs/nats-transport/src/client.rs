//! NATS connection manager.
//!
//! async-nats reconnects to a known server list on its own. [`NatsClient`]
//! covers the rest:
//!
//! - bounded, exponentially backed off retry of the first connect
//! - forwarding of connect/disconnect events to a [`StateNotifier`]
//! - reconnecting with a new server list when a [`ServerProvider`] reports one

use std::{fmt, sync::Arc, time::Duration};

use async_nats::{ConnectOptions, Event, connection::State};
use async_trait::async_trait;
use courier_core::{
    state::{ConnectionRefresher, StateNotifier},
    transport::ConnectionState,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    config::NatsConfig,
    error::{NatsError, NatsResult},
    subjects::SubjectResolver,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// first connect retry delay, doubled per attempt
const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Source of the NATS server list, asked again after every disconnect.
#[async_trait]
pub trait ServerProvider: Send + Sync + 'static {
    /// current server urls
    async fn servers(&self) -> NatsResult<Vec<String>>;
}

/// A server list that never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticServers(pub Vec<String>);

#[async_trait]
impl ServerProvider for StaticServers {
    async fn servers(&self) -> NatsResult<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Delay before retry number `retry` (1-based) of the first connect.
fn connect_backoff(retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    CONNECT_BACKOFF_BASE
        .saturating_mul(factor)
        .min(CONNECT_BACKOFF_MAX)
}

/// The live connection and the servers it was made with.
struct Session {
    client: Option<async_nats::Client>,
    servers: Vec<String>,
}

/// Cloneable handle to one NATS connection shared by transport and broker.
#[derive(Clone)]
pub struct NatsClient {
    config: Arc<NatsConfig>,
    session: Arc<RwLock<Session>>,
    resolver: SubjectResolver,
    notifier: StateNotifier,
    servers: Arc<dyn ServerProvider>,
}

impl NatsClient {
    /// Client for `config`, not connected until [`connect`](Self::connect).
    /// Connection changes are reported through `notifier`.
    pub fn new(config: NatsConfig, resolver: SubjectResolver, notifier: StateNotifier) -> Self {
        let servers = config.servers.clone();
        Self {
            servers: Arc::new(StaticServers(servers.clone())),
            session: Arc::new(RwLock::new(Session {
                client: None,
                servers,
            })),
            config: Arc::new(config),
            resolver,
            notifier,
        }
    }

    /// Replace the server list source used by [`refresh`](Self::refresh).
    pub fn with_server_provider(mut self, servers: impl ServerProvider) -> Self {
        self.servers = Arc::new(servers);
        self
    }

    async fn connect_options(&self) -> NatsResult<ConnectOptions> {
        let notifier = self.notifier.clone();
        let options = ConnectOptions::new()
            .connection_timeout(self.config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .event_callback(move |event| {
                let notifier = notifier.clone();
                async move { forward_event(&notifier, event) }
            });
        self.config.secure(options).await
    }

    /// Connect, retrying up to `connect_retry_max` times with exponential
    /// backoff. Reports `Connected` once the connection is up. A no-op while
    /// a connection exists.
    pub async fn connect(&self) -> NatsResult<()> {
        let servers = {
            let session = self.session.read().await;
            if session.client.is_some() {
                debug!("NATS already connected");
                return Ok(());
            }
            session.servers.clone()
        };
        let client = self.dial(&servers).await?;
        self.install(client, servers).await;
        Ok(())
    }

    async fn dial(&self, servers: &[String]) -> NatsResult<async_nats::Client> {
        let attempts = self.config.connect_retry_max.saturating_add(1);
        info!(
            ?servers,
            security_mode = %self.config.security_mode,
            attempts,
            "connecting to NATS"
        );

        let mut attempt = 1;
        loop {
            match self.connect_options().await?.connect(servers.to_vec()).await {
                Ok(client) => {
                    info!(attempt, "NATS connected");
                    return Ok(client);
                }
                Err(err) if attempt < attempts => {
                    let delay = connect_backoff(attempt);
                    warn!(
                        attempt,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "NATS connect attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(attempts, error = %err, "giving up connecting to NATS");
                    return Err(NatsError::Transport(format!(
                        "could not connect to NATS after {attempts} attempt(s): {err}"
                    )));
                }
            }
        }
    }

    async fn install(&self, client: async_nats::Client, servers: Vec<String>) {
        let stale = {
            let mut session = self.session.write().await;
            session.servers = servers;
            session.client.replace(client)
        };
        drop(stale);
        self.notifier.notify(ConnectionState::Connected);
    }

    /// Reconnect if the [`ServerProvider`] reports a different server list
    /// or no connection is left. With a live connection to an unchanged list
    /// reconnection is left to async-nats.
    ///
    /// The new list is kept only once a connection to it is up, so a failed
    /// refresh is attempted again on the next call.
    pub async fn refresh(&self) -> NatsResult<()> {
        let servers = self.servers.servers().await?;
        if servers.is_empty() {
            return Err(NatsError::Config("server provider returned no servers".into()));
        }
        let stale = {
            let mut session = self.session.write().await;
            match (session.client.is_some(), session.servers == servers) {
                (true, true) => {
                    debug!(?servers, "NATS server list unchanged");
                    return Ok(());
                }
                (_, false) => {
                    info!(old = ?session.servers, new = ?servers, "NATS server list changed")
                }
                (false, true) => info!(?servers, "no NATS connection left, reconnecting"),
            }
            session.client.take()
        };
        // closes the old connection once its last clone is gone
        drop(stale);
        let client = self.dial(&servers).await?;
        self.install(client, servers).await;
        Ok(())
    }

    /// Connectivity as seen by async-nats. No connection counts as
    /// disconnected.
    pub async fn connection_state(&self) -> ConnectionState {
        match self.session.read().await.client.as_ref().map(|c| c.connection_state()) {
            Some(State::Connected) => ConnectionState::Connected,
            Some(State::Disconnected | State::Pending) | None => ConnectionState::Disconnected,
        }
    }

    /// connected right now
    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// subject resolver
    pub fn resolver(&self) -> &SubjectResolver {
        &self.resolver
    }

    /// how long [`request`](Self::request) waits for a reply
    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    /// name stamped on envelopes and broker requests
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Handle on the live connection.
    pub(crate) async fn nats_client(&self) -> NatsResult<async_nats::Client> {
        self.session
            .read()
            .await
            .client
            .clone()
            .ok_or_else(|| NatsError::NotConnected("no NATS connection".into()))
    }

    /// Fire-and-forget publish.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> NatsResult<()> {
        self.nats_client()
            .await?
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|e| NatsError::Transport(format!("publish to '{subject}' failed: {e}")))
    }

    /// Request/reply bounded by [`request_timeout`](Self::request_timeout).
    pub async fn request(&self, subject: &str, payload: Vec<u8>) -> NatsResult<Vec<u8>> {
        let client = self.nats_client().await?;
        let timeout = self.request_timeout();
        match tokio::time::timeout(timeout, client.request(subject.to_owned(), payload.into())).await
        {
            Ok(Ok(reply)) => Ok(reply.payload.to_vec()),
            Ok(Err(e)) => Err(NatsError::Transport(format!(
                "request to '{subject}' failed: {e}"
            ))),
            Err(_) => Err(NatsError::Timeout(format!(
                "no reply on '{subject}' within {timeout:?}"
            ))),
        }
    }

    /// Flush pending publishes and drop the connection.
    pub async fn disconnect(&self) {
        let Some(client) = self.session.write().await.client.take() else {
            return;
        };
        if let Err(err) = client.flush().await {
            debug!(error = %err, "NATS flush before disconnect failed");
        }
        info!("NATS disconnected");
    }
}

#[async_trait]
impl ConnectionRefresher for NatsClient {
    async fn refresh(&self) -> anyhow::Result<()> {
        Ok(NatsClient::refresh(self).await?)
    }
}

impl fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsClient")
            .field("service_name", &self.config.service_name)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

fn forward_event(notifier: &StateNotifier, event: Event) {
    match event {
        Event::Connected => {
            info!("NATS connection restored");
            notifier.notify(ConnectionState::Connected);
        }
        Event::Disconnected => {
            warn!("NATS connection lost");
            notifier.notify(ConnectionState::Disconnected);
        }
        Event::ServerError(err) => error!(error = %err, "NATS server error"),
        Event::ClientError(err) => error!(error = %err, "NATS client error"),
        other => debug!(event = %other, "NATS connection event"),
    }
}
