//! Wire models exchanged with subscribers and the broker, plus JSON codecs.

use chrono::{DateTime, Utc};
use courier_core::transport::{InboundMessage, ResponseStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NatsError, NatsResult};

/// Status carried by broker replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WireStatus {
    /// request succeeded
    Ok,
    /// request failed or was rejected
    Error,
}

impl WireStatus {
    /// true for [`WireStatus::Ok`]
    pub fn is_ok(self) -> bool {
        self == WireStatus::Ok
    }
}

impl From<WireStatus> for ResponseStatus {
    fn from(status: WireStatus) -> Self {
        match status {
            WireStatus::Ok => ResponseStatus::Ok,
            WireStatus::Error => ResponseStatus::Error,
        }
    }
}

/// Envelope wrapping every non-raw publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// unique id, used for seen tracking
    pub message_id: String,
    /// event the message was published as
    pub event_name: String,
    /// channel listeners are registered on
    pub channel_name: String,
    /// publishing service
    pub service_name: String,
    /// serialized payload
    pub body: String,
    /// publish timestamp
    pub sent_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// New envelope with a fresh v4 id, stamped now.
    pub fn new(event_name: &str, service_name: &str, body: &str) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            event_name: event_name.to_owned(),
            channel_name: event_name.to_owned(),
            service_name: service_name.to_owned(),
            body: body.to_owned(),
            sent_at: Utc::now(),
        }
    }
}

impl From<MessageEnvelope> for InboundMessage {
    fn from(envelope: MessageEnvelope) -> Self {
        InboundMessage {
            message_id: Some(envelope.message_id),
            channel: envelope.channel_name,
            body: envelope.body,
        }
    }
}

/// Query for messages `service_name` has not seen yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnseenQuery {
    /// querying service
    pub service_name: String,
    /// only messages sent before this instant
    pub date_before: DateTime<Utc>,
}

/// Broker reply to an [`UnseenQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnseenReply {
    /// reply status
    pub status: WireStatus,
    /// unseen messages, oldest first
    #[serde(default)]
    pub messages: Vec<MessageEnvelope>,
}

/// Acknowledgement that `service_name` handled `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenNotice {
    /// acknowledging service
    pub service_name: String,
    /// handled message
    pub message_id: String,
}

/// Plain status reply, used for tracked publishes, seen notices and replies
/// to request/reply deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    /// reply status
    pub status: WireStatus,
}

impl StatusReply {
    /// `OK` reply
    pub fn ok() -> Self {
        Self {
            status: WireStatus::Ok,
        }
    }
}

/// Encode a typed model to JSON bytes for NATS transport.
pub fn encode<T: Serialize>(value: &T) -> NatsResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| NatsError::Codec(e.to_string()))
}

/// Decode JSON bytes from NATS transport into a typed model.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> NatsResult<T> {
    serde_json::from_slice(data).map_err(|e| NatsError::Codec(e.to_string()))
}

/// Turn a live delivery on `channel` into an [`InboundMessage`]. Payloads that
/// are not a [`MessageEnvelope`] are raw publishes: the whole payload is the
/// body and there is no id to acknowledge.
pub fn decode_inbound(channel: &str, payload: &[u8]) -> InboundMessage {
    match decode::<MessageEnvelope>(payload) {
        Ok(envelope) => InboundMessage {
            message_id: Some(envelope.message_id),
            channel: channel.to_owned(),
            body: envelope.body,
        },
        Err(_) => InboundMessage::new(channel, String::from_utf8_lossy(payload)),
    }
}
