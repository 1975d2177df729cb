//! # Healthcheck & API
//!
//! HTTP surface of a running courier client: health, metrics and a snapshot
//! of the registered listeners.
//!
//! ```text
//! GET /health        200 GOOD / 500 BAD, JSON health report
//! GET /ping          200
//! GET /metrics       prometheus protobuf
//! GET /metrics-text  prometheus text
//! GET /listeners     registered channels and their policies
//! ```
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, bail};
use axum::{Router, routing};
use courier_core::registry::ListenerRegistry;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace};

pub use crate::models::{Health, HealthReport, ListenerInfo, SharedHealth};

/// Health updates buffered before senders wait.
const HEALTH_CHANNEL_CAPACITY: usize = 10;

/// Aborts the api task when dropped.
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("external api guard dropped, aborting server");
        self.task_handle.abort();
    }
}

/// Shared with every handler.
#[derive(Debug, Clone)]
struct ApiContext {
    health: SharedHealth,
    registry: Arc<ListenerRegistry>,
}

/// Serves the HTTP api and applies health updates received on its channel.
#[derive(Debug)]
pub struct ExternalApi {
    addr: SocketAddr,
    health_tx: mpsc::Sender<Health>,
    health_rx: mpsc::Receiver<Health>,
    ctx: ApiContext,
}

impl ExternalApi {
    /// Api on `addr` reporting `registry`. Health starts BAD.
    pub fn new(addr: SocketAddr, registry: Arc<ListenerRegistry>) -> Self {
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        Self {
            addr,
            health_tx,
            health_rx,
            ctx: ApiContext {
                health: models::initial_health(),
                registry,
            },
        }
    }

    /// Sender for health updates. Keeps working after [`start`](Self::start).
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.health_tx.clone()
    }

    /// Overwrite the current health.
    pub fn set_health(&self, health: Health) {
        *self.ctx.health.lock() = health;
    }

    fn router(ctx: ApiContext) -> Router {
        Router::new()
            .route("/health", routing::get(handlers::health))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/listeners", routing::get(handlers::listeners))
            .layer(TraceLayer::new_for_http())
            .with_state(ctx)
    }

    async fn serve_http(addr: SocketAddr, ctx: ApiContext, token: CancellationToken) -> Result<()> {
        let tcp = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind external api to {addr}"))?;
        debug!(%addr, "external API listening");

        axum::serve(tcp, Self::router(ctx))
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .await?;
        if !token.is_cancelled() {
            bail!("external API returned without shutdown");
        }
        debug!("external API stopped");
        Ok(())
    }

    async fn apply_health_updates(
        mut rx: mpsc::Receiver<Health>,
        health: SharedHealth,
        token: CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = rx.recv() => next,
            };
            let Some(update) = next else {
                debug!("all health senders dropped");
                return Ok(());
            };
            let previous = std::mem::replace(&mut *health.lock(), update);
            if previous != update {
                info!(%previous, health = %update, "health changed");
            }
        }
    }

    /// Spawn the server and the health listener. Both stop when `token` is
    /// cancelled.
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        let Self {
            addr,
            health_tx,
            health_rx,
            ctx,
        } = self;
        let health = ctx.health.clone();

        tokio::spawn(async move {
            // held so the channel stays open while the api runs
            let _health_tx = health_tx;
            if let Err(err) = tokio::try_join!(
                ExternalApi::serve_http(addr, ctx, token.clone()),
                ExternalApi::apply_health_updates(health_rx, health, token.clone())
            ) {
                error!(?err, "external api stopped with error");
            }
        })
    }

    /// Start with a private token; the server lives until the guard drops.
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(CancellationToken::new()),
        }
    }
}

mod handlers {
    use axum::{
        Json,
        body::Body,
        extract::State,
        http::{Response, StatusCode, header},
        response::IntoResponse,
    };
    use courier_core::metrics::{START_TIME, UPTIME};
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use super::ApiContext;
    use crate::models::{Health, HealthReport, ListenerInfo, ServerResult};

    pub(crate) async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
        let status = *ctx.health.lock();
        let code = match status {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let report = HealthReport {
            status,
            uptime_secs: START_TIME.elapsed().as_secs(),
            listeners: ctx.registry.len(),
        };
        (code, Json(report))
    }

    pub(crate) async fn listeners(State(ctx): State<ApiContext>) -> Json<Vec<ListenerInfo>> {
        let listeners = ctx
            .registry
            .channels()
            .iter()
            .filter_map(|channel| ctx.registry.listener_for_channel(channel).ok())
            .map(|listener| ListenerInfo::new(listener.channel(), listener.policy()))
            .collect();
        Json(listeners)
    }

    pub(crate) async fn metrics() -> ServerResult<Response<Body>> {
        encode(&ProtobufEncoder::new())
    }

    pub(crate) async fn metrics_text() -> ServerResult<Response<Body>> {
        encode(&TextEncoder::new())
    }

    fn encode(encoder: &impl Encoder) -> ServerResult<Response<Body>> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let mut buf = Vec::new();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());
        Ok(match encoder.encode(&prometheus::gather(), &mut buf) {
            Ok(()) => resp.status(StatusCode::OK).body(Body::from(buf))?,
            Err(err) => {
                error!(?err, format = encoder.format_type(), "failed to encode metrics");
                resp.status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?
            }
        })
    }

    pub(crate) async fn ping() -> StatusCode {
        StatusCode::OK
    }
}

/// Response bodies and shared health state.
pub mod models {
    use std::{fmt, sync::Arc};

    use axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
    };
    use courier_core::listener::HandlerPolicy;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    /// Health shared between the api and its updaters.
    pub type SharedHealth = Arc<Mutex<Health>>;

    /// GOOD once the client is connected and initialized, BAD otherwise.
    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// connected and initialized
        Good,
        /// starting, disconnected or shutting down
        Bad,
    }

    impl Health {
        /// wire name
        pub fn as_str(self) -> &'static str {
            match self {
                Health::Good => "GOOD",
                Health::Bad => "BAD",
            }
        }
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    pub(crate) fn initial_health() -> SharedHealth {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Body of `/health`.
    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
    pub struct HealthReport {
        /// current health
        pub status: Health,
        /// seconds since start
        pub uptime_secs: u64,
        /// registered listeners
        pub listeners: usize,
    }

    /// One entry of `/listeners`.
    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
    pub struct ListenerInfo {
        /// channel name
        pub channel: String,
        /// handler policy
        pub policy: String,
        /// holds a live subscription
        pub live: bool,
        /// acknowledged to the broker
        pub tracked: bool,
    }

    impl ListenerInfo {
        pub(crate) fn new(channel: &str, policy: HandlerPolicy) -> Self {
            Self {
                channel: channel.to_owned(),
                policy: policy.to_string(),
                live: policy.subscribes_live(),
                tracked: policy.uses_broker(),
            }
        }
    }

    /// Handler error rendered as a 500 with the error text.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);

    /// handler result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> Response {
            (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
        }
    }

    impl<E: Into<anyhow::Error>> From<E> for ServerError {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{
        DeliveryError, DeliveryResult, async_trait,
        listener::{EventListener, HandlerPolicy, ListenerEntry},
        pool::{PoolConfig, WorkerPool},
        seen::SeenAcknowledger,
        transport::{
            Broker, InboundHandler, OutboundMessage, ResponseStatus, Subscription, Transport,
            UnseenResponse,
        },
    };

    use super::*;

    #[derive(Debug)]
    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn send(&self, _message: &OutboundMessage) -> DeliveryResult<()> {
            Err(DeliveryError::NotConnected("offline".into()))
        }

        async fn subscribe(
            &self,
            channel: &str,
            _handler: Arc<dyn InboundHandler>,
        ) -> DeliveryResult<Box<dyn Subscription>> {
            Err(DeliveryError::NotConnected(format!(
                "cannot subscribe to {channel}"
            )))
        }
    }

    #[async_trait]
    impl Broker for Offline {
        async fn query_unseen(&self) -> DeliveryResult<UnseenResponse> {
            Ok(UnseenResponse {
                status: ResponseStatus::Ok,
                messages: Vec::new(),
            })
        }

        async fn mark_seen(&self, _message_id: &str) -> DeliveryResult<()> {
            Ok(())
        }
    }

    struct Ignore;

    #[async_trait]
    impl EventListener for Ignore {
        async fn handle(&self, _body: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> Arc<ListenerRegistry> {
        let pool = Arc::new(WorkerPool::new("api-test-seen", PoolConfig::new(1, 1)));
        Arc::new(ListenerRegistry::new(
            Arc::new(Offline),
            SeenAcknowledger::new(Arc::new(Offline), pool),
        ))
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let api = ExternalApi::new("0.0.0.0:8889".parse()?, registry());
        let sender = api.sender();
        let _guard = api.serve();
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;

        // starts BAD i.e. 500
        let r = reqwest::get("http://0.0.0.0:8889/health").await?;
        assert_eq!(r.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let report: HealthReport = r.json().await?;
        assert_eq!(report.status, Health::Bad);
        assert_eq!(report.listeners, 0);

        sender.send(Health::Good).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let r = reqwest::get("http://0.0.0.0:8889/health").await?;
        assert_eq!(r.status(), reqwest::StatusCode::OK);
        assert_eq!(r.json::<HealthReport>().await?.status, Health::Good);
        Ok(())
    }

    #[tokio::test]
    async fn test_metrics() -> anyhow::Result<()> {
        let api = ExternalApi::new("0.0.0.0:8888".parse()?, registry());
        let _guard = api.serve();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let bytes = reqwest::get("http://0.0.0.0:8888/metrics")
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        assert!(!bytes.is_empty());

        let text = reqwest::get("http://0.0.0.0:8888/metrics-text")
            .await?
            .error_for_status()?
            .text()
            .await?;
        assert!(text.contains("uptime"));
        Ok(())
    }

    #[tokio::test]
    async fn test_listeners() -> anyhow::Result<()> {
        let registry = registry();
        registry
            .register(ListenerEntry::new("orders", Ignore).with_policy(HandlerPolicy::NatsOnly))
            .await;
        registry
            .register(ListenerEntry::new("audit", Ignore).with_policy(HandlerPolicy::RecoveryOnly))
            .await;
        let api = ExternalApi::new("0.0.0.0:8887".parse()?, registry);
        let _guard = api.serve();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let listeners: Vec<ListenerInfo> = reqwest::get("http://0.0.0.0:8887/listeners")
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(
            listeners,
            vec![
                ListenerInfo {
                    channel: "audit".into(),
                    policy: "recovery_only".into(),
                    live: false,
                    tracked: true,
                },
                ListenerInfo {
                    channel: "orders".into(),
                    policy: "nats_only".into(),
                    live: true,
                    tracked: false,
                },
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_graceful_stop() -> anyhow::Result<()> {
        let api = ExternalApi::new("0.0.0.0:8886".parse()?, registry());
        let token = CancellationToken::new();
        let handle = api.start(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let r = reqwest::get("http://0.0.0.0:8886/ping").await?;
        assert_eq!(r.status(), reqwest::StatusCode::OK);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await??;
        assert!(reqwest::get("http://0.0.0.0:8886/ping").await.is_err());
        Ok(())
    }

    #[test]
    fn test_listener_info_from_policy() {
        let info = ListenerInfo::new("orders", HandlerPolicy::AsyncSeen);
        assert_eq!(info.policy, "async_seen");
        assert!(info.live);
        assert!(info.tracked);
        assert_eq!(Health::Good.to_string(), "GOOD");
    }
}
