//! Boundaries the control plane consumes: the pub/sub transport and the
//! message-tracking broker.
//!
//! Nothing here knows about a concrete bus. The `nats-transport` crate
//! implements both traits on top of async-nats; tests use in-memory fakes.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::error::DeliveryResult;

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No notification received yet.
    #[default]
    Unknown,
    /// Transport is connected.
    Connected,
    /// Transport lost its connection.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// How a publish is carried to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PublishStrategy {
    /// Publish straight onto the event subject.
    #[default]
    Direct,
    /// Route through the broker so it records the message for unseen tracking.
    Tracked,
    /// Request/reply on the event subject, waiting for a subscriber's reply.
    Blocked,
}

impl fmt::Display for PublishStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStrategy::Direct => write!(f, "direct"),
            PublishStrategy::Tracked => write!(f, "tracked"),
            PublishStrategy::Blocked => write!(f, "blocked"),
        }
    }
}

/// A message delivered to this client, either live from the transport or
/// replayed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-assigned id; `None` for raw publishes.
    pub message_id: Option<String>,
    /// Channel the message was published on.
    pub channel: String,
    /// Serialized payload.
    pub body: String,
}

impl InboundMessage {
    /// Message without a broker id.
    pub fn new(channel: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: None,
            channel: channel.into(),
            body: body.into(),
        }
    }

    /// Attach the broker-assigned id.
    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Receives the reply to a publish that expects one.
#[async_trait]
pub trait ResponseHandler: Send + Sync + 'static {
    /// Called with the raw reply payload.
    async fn on_response(&self, body: &[u8]);
}

/// A serialized publish, ready for the transport.
#[derive(Clone)]
pub struct OutboundMessage {
    /// Event name, used as the subject.
    pub event_name: String,
    /// Serialized payload.
    pub body: String,
    /// Delivery strategy.
    pub strategy: PublishStrategy,
    /// Send `body` as-is instead of wrapping it in an envelope.
    pub raw: bool,
    /// Reply consumer, if the caller wants the reply.
    pub response_handler: Option<Arc<dyn ResponseHandler>>,
}

impl OutboundMessage {
    /// True if the transport must wait for a reply.
    pub fn expects_reply(&self) -> bool {
        self.strategy == PublishStrategy::Blocked || self.response_handler.is_some()
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("event_name", &self.event_name)
            .field("body_len", &self.body.len())
            .field("strategy", &self.strategy)
            .field("raw", &self.raw)
            .field("response_handler", &self.response_handler.is_some())
            .finish()
    }
}

/// Adapter the transport invokes for each message on a subscription.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Process one inbound message. Failures are handled inside.
    async fn on_message(&self, message: InboundMessage);
}

/// A live subscription. Dropping the handle without unsubscribing leaves
/// the transport to clean up on its own schedule.
#[async_trait]
pub trait Subscription: Send + Sync + fmt::Debug {
    /// Stop delivering messages for this subscription.
    async fn unsubscribe(&mut self) -> DeliveryResult<()>;
}

/// Pub/sub transport boundary.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Send one message. The publish path retries every error returned here
    /// until the send succeeds or shutdown interrupts it.
    async fn send(&self, message: &OutboundMessage) -> DeliveryResult<()>;

    /// Subscribe `handler` to `channel`.
    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> DeliveryResult<Box<dyn Subscription>>;
}

/// Status carried by a broker reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Request succeeded.
    Ok,
    /// Broker rejected or failed the request.
    Error,
}

/// Reply to an unseen query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnseenResponse {
    /// Reply status; messages are only meaningful on `Ok`.
    pub status: ResponseStatus,
    /// Unseen messages, in broker order.
    pub messages: Vec<InboundMessage>,
}

/// Message-tracking backend boundary.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug + 'static {
    /// Ask for every message not yet acknowledged as seen by this client.
    async fn query_unseen(&self) -> DeliveryResult<UnseenResponse>;

    /// Report a message as seen so it is not replayed again.
    async fn mark_seen(&self, message_id: &str) -> DeliveryResult<()>;
}
