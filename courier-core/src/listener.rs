//! Application listener capabilities and the per-channel registration entry.

use std::{fmt, future::Future, marker::PhantomData, sync::Arc};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::{error::DeliveryError, transport::InboundMessage};

/// Where a listener's messages come from and how they are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandlerPolicy {
    /// Live push plus broker tracking, seen acknowledged inline.
    #[default]
    Full,
    /// Live push plus broker tracking, seen acknowledged on the seen pool.
    AsyncSeen,
    /// Live push only, never acknowledged to the broker.
    NatsOnly,
    /// No live subscription, delivered by unseen recovery only.
    RecoveryOnly,
}

impl HandlerPolicy {
    /// True if messages for this policy are tracked by the broker and must be
    /// reported as seen.
    pub const fn uses_broker(self) -> bool {
        !matches!(self, HandlerPolicy::NatsOnly)
    }

    /// True if the registry should hold a live transport subscription.
    pub const fn subscribes_live(self) -> bool {
        !matches!(self, HandlerPolicy::RecoveryOnly)
    }
}

impl fmt::Display for HandlerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerPolicy::Full => write!(f, "full"),
            HandlerPolicy::AsyncSeen => write!(f, "async_seen"),
            HandlerPolicy::NatsOnly => write!(f, "nats_only"),
            HandlerPolicy::RecoveryOnly => write!(f, "recovery_only"),
        }
    }
}

/// What happens to a message whose listener failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorStrategy {
    /// Report it as seen anyway.
    #[default]
    Acknowledge,
    /// Leave it unseen so the next recovery run replays it.
    Redeliver,
}

/// Message details handed to an [`ErrorHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// channel the message arrived on
    pub channel: String,
    /// broker id, if tracked
    pub message_id: Option<String>,
    /// raw body
    pub body: String,
}

impl From<&InboundMessage> for MessageContext {
    fn from(msg: &InboundMessage) -> Self {
        Self {
            channel: msg.channel.clone(),
            message_id: msg.message_id.clone(),
            body: msg.body.clone(),
        }
    }
}

/// Processes the raw body of one message.
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    /// handle one message body
    async fn handle(&self, body: &str) -> anyhow::Result<()>;
}

/// Notified whenever a listener fails.
pub trait ErrorHandler: Send + Sync + 'static {
    /// `context` is `None` when the failure happened before a message was
    /// attached, e.g. while subscribing.
    fn on_error(&self, error: &DeliveryError, context: Option<&MessageContext>);
}

/// Default error handler, logs and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&self, error: &DeliveryError, context: Option<&MessageContext>) {
        match context {
            Some(ctx) => error!(
                channel = %ctx.channel,
                message_id = ?ctx.message_id,
                %error,
                "listener failed to process message"
            ),
            None => error!(%error, "listener failed"),
        }
    }
}

/// Decodes the body as JSON into `E` and hands it to a processor.
pub struct TypedListener<E, F> {
    processor: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F> TypedListener<E, F> {
    /// wrap `processor`
    pub fn new(processor: F) -> Self {
        Self {
            processor,
            _event: PhantomData,
        }
    }
}

impl<E, F> fmt::Debug for TypedListener<E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedListener")
            .field("event", &std::any::type_name::<E>())
            .finish()
    }
}

#[async_trait]
impl<E, F, Fut> EventListener for TypedListener<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, body: &str) -> anyhow::Result<()> {
        let event: E = serde_json::from_str(body).with_context(|| {
            format!("failed to decode {}", std::any::type_name::<E>())
        })?;
        (self.processor)(event).await
    }
}

/// A listener registered for one channel.
#[derive(Clone)]
pub struct ListenerEntry {
    pub(crate) channel: String,
    pub(crate) listener: Arc<dyn EventListener>,
    pub(crate) policy: HandlerPolicy,
    pub(crate) error_strategy: ErrorStrategy,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
}

impl ListenerEntry {
    /// `Full` policy, `Acknowledge` strategy, logging error handler.
    pub fn new(channel: impl Into<String>, listener: impl EventListener) -> Self {
        Self {
            channel: channel.into(),
            listener: Arc::new(listener),
            policy: HandlerPolicy::default(),
            error_strategy: ErrorStrategy::default(),
            error_handler: Arc::new(LoggingErrorHandler),
        }
    }

    /// Entry whose body is decoded into `E` before `processor` runs.
    pub fn typed<E, F, Fut>(channel: impl Into<String>, processor: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(channel, TypedListener::<E, F>::new(processor))
    }

    /// set the handler policy
    pub fn with_policy(mut self, policy: HandlerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// set the error strategy
    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    /// replace the error handler
    pub fn with_error_handler(mut self, handler: impl ErrorHandler) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// handler policy
    pub fn policy(&self) -> HandlerPolicy {
        self.policy
    }

    /// error strategy
    pub fn error_strategy(&self) -> ErrorStrategy {
        self.error_strategy
    }
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("channel", &self.channel)
            .field("policy", &self.policy)
            .field("error_strategy", &self.error_strategy)
            .finish()
    }
}
