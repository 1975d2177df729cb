//! [`Transport`] and [`Broker`] on top of [`NatsClient`].
//!
//! ```text
//! Direct              ──► publish  <event>
//! Direct + handler    ──► request  <event>          ──► handler(reply)
//! Blocked             ──► request  <event>          ──► handler(reply)?
//! Tracked             ──► request  <prefix>.publish ──► status OK, handler(reply)?
//! query_unseen        ──► request  <prefix>.unseen  ──► UnseenReply
//! mark_seen           ──► request  <prefix>.seen    ──► status OK
//! ```
//!
//! Each subscription is a task draining an async-nats subscriber until its
//! token is cancelled.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{
    DeliveryResult,
    transport::{
        Broker, InboundHandler, OutboundMessage, PublishStrategy, Subscription, Transport,
        UnseenResponse,
    },
};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace, warn};

use crate::{
    client::NatsClient,
    error::{NatsError, NatsResult},
    models::{
        MessageEnvelope, SeenNotice, StatusReply, UnseenQuery, UnseenReply, decode, decode_inbound,
        encode,
    },
    subjects::BrokerSubject,
};

/// NATS implementation of the courier transport and broker boundaries.
#[derive(Debug, Clone)]
pub struct NatsTransport {
    client: NatsClient,
    service_name: String,
}

impl NatsTransport {
    /// Transport stamping `service_name` on envelopes and broker requests.
    pub fn new(client: NatsClient, service_name: impl Into<String>) -> Self {
        Self {
            client,
            service_name: service_name.into(),
        }
    }

    /// underlying client
    pub fn client(&self) -> &NatsClient {
        &self.client
    }

    fn payload(&self, message: &OutboundMessage) -> NatsResult<Vec<u8>> {
        if message.raw && message.strategy != PublishStrategy::Tracked {
            return Ok(message.body.clone().into_bytes());
        }
        encode(&MessageEnvelope::new(
            &message.event_name,
            &self.service_name,
            &message.body,
        ))
    }

    async fn send_message(&self, message: &OutboundMessage) -> NatsResult<()> {
        let resolver = self.client.resolver();
        let subject = resolver.event(&message.event_name)?;
        let payload = self.payload(message)?;

        let reply = match message.strategy {
            PublishStrategy::Tracked => {
                let reply = self
                    .client
                    .request(resolver.broker(BrokerSubject::Publish), payload)
                    .await?;
                expect_ok(&reply, "tracked publish")?;
                Some(reply)
            }
            _ if message.expects_reply() => Some(self.client.request(subject, payload).await?),
            _ => {
                self.client.publish(subject, payload).await?;
                None
            }
        };

        if let (Some(handler), Some(reply)) = (&message.response_handler, reply) {
            handler.on_response(&reply).await;
        }
        trace!(event = %message.event_name, strategy = %message.strategy, "sent");
        Ok(())
    }

    async fn unseen(&self) -> NatsResult<UnseenResponse> {
        let query = UnseenQuery {
            service_name: self.service_name.clone(),
            date_before: Utc::now(),
        };
        let subject = self.client.resolver().broker(BrokerSubject::Unseen);
        let reply: UnseenReply = decode(&self.client.request(subject, encode(&query)?).await?)?;
        debug!(status = ?reply.status, count = reply.messages.len(), "unseen reply");
        Ok(UnseenResponse {
            status: reply.status.into(),
            messages: reply.messages.into_iter().map(Into::into).collect(),
        })
    }

    async fn seen(&self, message_id: &str) -> NatsResult<()> {
        let notice = SeenNotice {
            service_name: self.service_name.clone(),
            message_id: message_id.to_owned(),
        };
        let subject = self.client.resolver().broker(BrokerSubject::Seen);
        let reply = self.client.request(subject, encode(&notice)?).await?;
        expect_ok(&reply, "seen notice")
    }
}

fn expect_ok(reply: &[u8], what: &str) -> NatsResult<()> {
    let reply: StatusReply = decode(reply)?;
    if reply.status.is_ok() {
        Ok(())
    } else {
        Err(NatsError::Rejected(what.to_owned()))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn send(&self, message: &OutboundMessage) -> DeliveryResult<()> {
        Ok(self.send_message(message).await?)
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> DeliveryResult<Box<dyn Subscription>> {
        let subject = self.client.resolver().event(channel)?.to_owned();
        let nats = self.client.nats_client().await?;
        let mut subscriber = nats
            .subscribe(subject.clone())
            .await
            .map_err(|e| NatsError::Transport(format!("subscribe to '{subject}' failed: {e}")))?;

        let token = CancellationToken::new();
        let channel = channel.to_owned();
        let stop = token.clone();
        let drain = async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    next = subscriber.next() => {
                        let Some(msg) = next else {
                            debug!(%channel, "subscription closed by server");
                            return;
                        };
                        handler.on_message(decode_inbound(&channel, &msg.payload)).await;
                        if let Some(reply) = msg.reply {
                            match encode(&StatusReply::ok()) {
                                Ok(ack) => {
                                    if let Err(err) = nats.publish(reply, ack.into()).await {
                                        warn!(%channel, error = %err, "failed to reply to request");
                                    }
                                }
                                Err(err) => warn!(%channel, error = %err, "failed to encode reply"),
                            }
                        }
                    }
                }
            }
            if let Err(err) = subscriber.unsubscribe().await {
                debug!(%channel, error = %err, "unsubscribe failed");
            }
        };

        Ok(Box::new(NatsSubscription {
            subject,
            token,
            task: Some(tokio::spawn(drain.in_current_span())),
        }))
    }
}

#[async_trait]
impl Broker for NatsTransport {
    async fn query_unseen(&self) -> DeliveryResult<UnseenResponse> {
        Ok(self.unseen().await?)
    }

    async fn mark_seen(&self, message_id: &str) -> DeliveryResult<()> {
        Ok(self.seen(message_id).await?)
    }
}

/// Handle to a running subscription task.
pub struct NatsSubscription {
    subject: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for NatsSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsSubscription")
            .field("subject", &self.subject)
            .field("active", &self.task.is_some())
            .finish()
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(&mut self) -> DeliveryResult<()> {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| {
                NatsError::Transport(format!("subscription task for '{}' failed: {e}", self.subject))
            })?;
        }
        Ok(())
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use courier_core::state::state_channel;

    use super::*;
    use crate::{
        config::{NatsConfig, NatsSecurityMode},
        subjects::SubjectResolver,
    };

    fn transport() -> NatsTransport {
        let config = NatsConfig {
            servers: vec!["nats://127.0.0.1:4222".into()],
            service_name: "shop".into(),
            subject_prefix: "courier".into(),
            security_mode: NatsSecurityMode::None,
            username: None,
            password: None,
            token: None,
            nkey_seed_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            creds_file_path: None,
            connect_timeout: None,
            connect_retry_max: 0,
            request_timeout: None,
        };
        let (notifier, _receiver) = state_channel();
        NatsTransport::new(
            NatsClient::new(config, SubjectResolver::with_defaults(), notifier),
            "shop",
        )
    }

    fn outbound(strategy: PublishStrategy, raw: bool) -> OutboundMessage {
        OutboundMessage {
            event_name: "orders.created".into(),
            body: r#"{"id":1}"#.into(),
            strategy,
            raw,
            response_handler: None,
        }
    }

    #[test]
    fn test_payload_envelope() {
        let payload = transport()
            .payload(&outbound(PublishStrategy::Direct, false))
            .unwrap();
        let envelope: MessageEnvelope = decode(&payload).unwrap();
        assert_eq!(envelope.event_name, "orders.created");
        assert_eq!(envelope.service_name, "shop");
        assert_eq!(envelope.body, r#"{"id":1}"#);
    }

    #[test]
    fn test_payload_raw() {
        let payload = transport()
            .payload(&outbound(PublishStrategy::Direct, true))
            .unwrap();
        assert_eq!(payload, br#"{"id":1}"#);

        // the broker needs an envelope to track the message
        let tracked = transport()
            .payload(&outbound(PublishStrategy::Tracked, true))
            .unwrap();
        assert!(decode::<MessageEnvelope>(&tracked).is_ok());
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok(br#"{"status":"OK"}"#, "seen notice").is_ok());
        assert!(matches!(
            expect_ok(br#"{"status":"ERROR"}"#, "seen notice"),
            Err(NatsError::Rejected(_))
        ));
        assert!(matches!(
            expect_ok(b"garbage", "seen notice"),
            Err(NatsError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_connection_is_retryable() {
        let err = transport()
            .send(&outbound(PublishStrategy::Direct, false))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_send_invalid_event_is_config_error() {
        let mut message = outbound(PublishStrategy::Direct, false);
        message.event_name = "orders.*".into();
        let err = transport().send(&message).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_broker_without_connection() {
        let transport = transport();
        assert!(transport.query_unseen().await.unwrap_err().is_retryable());
        assert!(transport.mark_seen("m-1").await.unwrap_err().is_retryable());
    }
}
