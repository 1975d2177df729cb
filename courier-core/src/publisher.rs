//! # Publish dispatch
//!
//! [`PublishDispatcher::publish`] validates and serializes a typed
//! [`PublishRequest`], then sends it through the [`RetryExecutor`] either on
//! the calling task ([`ExecutionMode::Sync`]) or on the publish
//! [`WorkerPool`] ([`ExecutionMode::Async`]).
//!
//! Only invalid requests fail the call. A send issued during an outage does
//! not fail: it keeps retrying on whichever task runs it until the transport
//! accepts it or the dispatcher is shut down. A `Sync` publish therefore
//! does not return while the transport is down, and neither does an `Async`
//! publish that overflowed the pool queue and ran on the caller.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::{
    error::{DeliveryError, DeliveryResult},
    metrics,
    pool::WorkerPool,
    retry::RetryExecutor,
    transport::{OutboundMessage, PublishStrategy, ResponseHandler, Transport},
};

/// Where the send of a publish runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// on the calling task, `publish` returns once sent
    #[default]
    Sync,
    /// on the publish pool, `publish` returns once queued
    Async,
}

impl ExecutionMode {
    /// lowercase name, also the metrics label
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Sync => "sync",
            ExecutionMode::Async => "async",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One publish call.
pub struct PublishRequest<T> {
    /// event name, used as subject and channel
    pub event_name: String,
    /// value to serialize; `None` is rejected
    pub payload: Option<T>,
    /// receives the reply, turns the publish into a request
    pub response_handler: Option<Arc<dyn ResponseHandler>>,
    /// `None` falls back to the dispatcher's per-event table, then `Sync`
    pub mode: Option<ExecutionMode>,
    /// send the serialized payload without an envelope
    pub raw: bool,
    /// delivery strategy
    pub strategy: PublishStrategy,
}

impl<T> PublishRequest<T> {
    /// `Direct` publish of `payload` on `event_name`
    pub fn new(event_name: impl Into<String>, payload: T) -> Self {
        Self::from_option(event_name, Some(payload))
    }

    /// request with a possibly missing payload
    pub fn from_option(event_name: impl Into<String>, payload: Option<T>) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
            response_handler: None,
            mode: None,
            raw: false,
            strategy: PublishStrategy::default(),
        }
    }

    /// set the execution mode
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// set the strategy
    pub fn with_strategy(mut self, strategy: PublishStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// send without envelope
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// deliver the reply to `handler`
    pub fn with_response_handler(mut self, handler: impl ResponseHandler) -> Self {
        self.response_handler = Some(Arc::new(handler));
        self
    }
}

impl<T> fmt::Debug for PublishRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishRequest")
            .field("event_name", &self.event_name)
            .field("payload", &self.payload.is_some())
            .field("response_handler", &self.response_handler.is_some())
            .field("mode", &self.mode)
            .field("raw", &self.raw)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Validates, serializes and sends publishes.
#[derive(Debug)]
pub struct PublishDispatcher {
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    retry: RetryExecutor,
    event_modes: HashMap<String, ExecutionMode>,
}

impl PublishDispatcher {
    /// `pool` runs async publishes, `retry` wraps every send
    pub fn new(transport: Arc<dyn Transport>, pool: Arc<WorkerPool>, retry: RetryExecutor) -> Self {
        Self {
            transport,
            pool,
            retry,
            event_modes: HashMap::new(),
        }
    }

    /// Execution modes for events whose requests leave `mode` unset.
    pub fn with_event_modes<I, S>(mut self, modes: I) -> Self
    where
        I: IntoIterator<Item = (S, ExecutionMode)>,
        S: Into<String>,
    {
        self.event_modes
            .extend(modes.into_iter().map(|(event, mode)| (event.into(), mode)));
        self
    }

    /// Publish `request`.
    ///
    /// Fails only with configuration errors (`InvalidArgument`, `Codec`),
    /// before anything is sent, or with `Interrupted` for a `Sync` send cut
    /// short by [`shutdown`](Self::shutdown).
    pub async fn publish<T: Serialize>(&self, request: PublishRequest<T>) -> DeliveryResult<()> {
        let mode = request
            .mode
            .or_else(|| self.event_modes.get(&request.event_name).copied())
            .unwrap_or_default();
        let message = match prepare(request) {
            Ok(message) => message,
            Err(err) => {
                metrics::PUBLISH_REJECTED.inc();
                warn!(error = %err, "publish rejected");
                return Err(err);
            }
        };
        metrics::PUBLISH_REQUESTS
            .with_label_values(&[mode.as_str()])
            .inc();
        trace!(event = %message.event_name, %mode, strategy = %message.strategy, "dispatching publish");

        match mode {
            ExecutionMode::Sync => send_with_retry(self.transport.as_ref(), &self.retry, &message).await,
            ExecutionMode::Async => {
                let transport = Arc::clone(&self.transport);
                let retry = self.retry.clone();
                self.pool
                    .execute(async move {
                        let _ = send_with_retry(transport.as_ref(), &retry, &message).await;
                    })
                    .await;
                Ok(())
            }
        }
    }

    /// Stop the publish pool, give queued sends up to `grace` to finish, then
    /// interrupt every retry loop still waiting on the transport.
    pub async fn shutdown(&self, grace: Duration) {
        if !self.pool.shutdown(grace).await {
            warn!("publish pool did not drain in time, interrupting pending sends");
        }
        self.retry.interrupt();
        debug!("publish dispatcher stopped");
    }
}

/// Event names double as subjects: dot separated tokens, no wildcards, no
/// whitespace.
fn validate_event_name(name: &str) -> DeliveryResult<()> {
    if name.trim().is_empty() {
        return Err(DeliveryError::InvalidArgument(
            "event name must not be empty".into(),
        ));
    }
    if name.contains(['*', '>', '{', '}']) || name.chars().any(char::is_whitespace) {
        return Err(DeliveryError::InvalidArgument(format!(
            "event name is not a valid subject: '{name}'"
        )));
    }
    if name.split('.').any(str::is_empty) {
        return Err(DeliveryError::InvalidArgument(format!(
            "event name has an empty token: '{name}'"
        )));
    }
    Ok(())
}

fn prepare<T: Serialize>(request: PublishRequest<T>) -> DeliveryResult<OutboundMessage> {
    validate_event_name(&request.event_name)?;
    let payload = request
        .payload
        .ok_or_else(|| DeliveryError::InvalidArgument("payload must not be null".into()))?;
    let body = serde_json::to_string(&payload)?;
    if body == "null" {
        return Err(DeliveryError::InvalidArgument(
            "payload must not be null".into(),
        ));
    }
    Ok(OutboundMessage {
        event_name: request.event_name,
        body,
        strategy: request.strategy,
        raw: request.raw,
        response_handler: request.response_handler,
    })
}

async fn send_with_retry(
    transport: &dyn Transport,
    retry: &RetryExecutor,
    message: &OutboundMessage,
) -> DeliveryResult<()> {
    let result = retry.run("publish", || transport.send(message)).await;
    match &result {
        Ok(()) => {
            metrics::PUBLISH_SENT.inc();
            trace!(event = %message.event_name, "publish sent");
        }
        Err(err) if err.is_interrupted() => {
            metrics::PUBLISH_ABANDONED.inc();
            warn!(event = %message.event_name, "publish abandoned on shutdown");
        }
        Err(err) => {
            error!(event = %message.event_name, error = %err, "publish failed");
        }
    }
    result
}
