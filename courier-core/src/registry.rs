//! # Listener registry
//!
//! Maps channel names to their bound listener and keeps at most one live
//! transport subscription per channel. `register` and `re_register_all` are
//! serialized by one async mutex held for the whole operation, so a
//! re-registration never observes a half-inserted entry and never leaves a
//! duplicate subscription behind.
//!
//! Lookups (`listener_for_channel`) only read the listener map and never wait
//! on a re-registration in progress.

use std::{collections::BTreeMap, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, DeliveryResult, panic_message},
    listener::{ErrorStrategy, HandlerPolicy, ListenerEntry, MessageContext},
    metrics,
    seen::SeenAcknowledger,
    transport::{InboundHandler, InboundMessage, Subscription, Transport},
};

/// A [`ListenerEntry`] bound to the seen acknowledger. Used for both live
/// deliveries and recovered messages.
#[derive(Debug)]
pub struct BoundListener {
    entry: ListenerEntry,
    acks: SeenAcknowledger,
}

impl BoundListener {
    /// channel name
    pub fn channel(&self) -> &str {
        &self.entry.channel
    }

    /// handler policy
    pub fn policy(&self) -> HandlerPolicy {
        self.entry.policy
    }

    /// Run the listener on `message`.
    ///
    /// On failure the error handler is notified and the message is
    /// acknowledged only under [`ErrorStrategy::Acknowledge`]. Panics inside
    /// the listener are reported as handler failures.
    pub async fn handle(&self, message: &InboundMessage) -> DeliveryResult<()> {
        let outcome = AssertUnwindSafe(self.entry.listener.handle(&message.body))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(DeliveryError::Handler(format!("{err:#}"))),
            Err(panic) => Some(DeliveryError::Handler(format!(
                "listener panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let message_id = message.message_id.as_deref();
        let Some(err) = failure else {
            self.acks.acknowledge(self.entry.policy, message_id).await;
            return Ok(());
        };

        metrics::HANDLER_FAILURES.inc();
        self.entry
            .error_handler
            .on_error(&err, Some(&MessageContext::from(message)));
        match self.entry.error_strategy {
            ErrorStrategy::Acknowledge => {
                self.acks.acknowledge(self.entry.policy, message_id).await;
            }
            ErrorStrategy::Redeliver => {
                debug!(channel = %message.channel, ?message_id, "leaving failed message unseen");
            }
        }
        Err(err)
    }
}

#[async_trait]
impl InboundHandler for BoundListener {
    async fn on_message(&self, message: InboundMessage) {
        // failures were reported to the error handler already
        let _ = self.handle(&message).await;
    }
}

/// Channel to listener map plus the live subscriptions for it.
#[derive(Debug)]
pub struct ListenerRegistry {
    transport: Arc<dyn Transport>,
    acks: SeenAcknowledger,
    listeners: RwLock<BTreeMap<String, Arc<BoundListener>>>,
    subscriptions: Mutex<HashMap<String, Box<dyn Subscription>>>,
}

impl ListenerRegistry {
    /// empty registry subscribing through `transport`
    pub fn new(transport: Arc<dyn Transport>, acks: SeenAcknowledger) -> Self {
        Self {
            transport,
            acks,
            listeners: RwLock::new(BTreeMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `entry`, replacing any listener on the same channel, and
    /// subscribe it if its policy wants live delivery. A failed subscribe is
    /// logged and retried by the next [`re_register_all`](Self::re_register_all).
    pub async fn register(&self, entry: ListenerEntry) -> Arc<BoundListener> {
        let mut subs = self.subscriptions.lock().await;
        let channel = entry.channel.clone();
        let listener = Arc::new(BoundListener {
            entry,
            acks: self.acks.clone(),
        });
        let replaced = self
            .listeners
            .write()
            .insert(channel.clone(), Arc::clone(&listener))
            .is_some();
        info!(%channel, policy = %listener.policy(), replaced, "registered listener");

        if let Some(old) = subs.remove(&channel) {
            unsubscribe(&channel, old).await;
        }
        if listener.policy().subscribes_live() {
            match self.subscribe(&listener).await {
                Ok(sub) => {
                    subs.insert(channel, sub);
                }
                Err(err) => {
                    warn!(%channel, error = %err, "subscribe failed, will retry on reconnect");
                    listener.entry.error_handler.on_error(&err, None);
                }
            }
        }
        listener
    }

    /// Listener for `channel`. Fails with [`DeliveryError::UnknownChannel`]
    /// if nothing is registered; never touches the transport.
    pub fn listener_for_channel(&self, channel: &str) -> DeliveryResult<Arc<BoundListener>> {
        self.listeners
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| DeliveryError::UnknownChannel(channel.to_owned()))
    }

    /// Drop every live subscription and subscribe again. Running this any
    /// number of times leaves exactly one subscription per live channel.
    pub async fn re_register_all(&self) -> DeliveryResult<()> {
        let mut subs = self.subscriptions.lock().await;
        let listeners = self.listeners.read().values().cloned().collect::<Vec<_>>();

        let mut failed = 0usize;
        let mut live = 0usize;
        for listener in listeners {
            let channel = listener.channel().to_owned();
            if let Some(old) = subs.remove(&channel) {
                unsubscribe(&channel, old).await;
            }
            if !listener.policy().subscribes_live() {
                continue;
            }
            live += 1;
            match self.subscribe(&listener).await {
                Ok(sub) => {
                    subs.insert(channel, sub);
                }
                Err(err) => {
                    failed += 1;
                    warn!(%channel, error = %err, "re-subscribe failed");
                }
            }
        }

        info!(live, failed, "re-registered listeners");
        if failed > 0 {
            return Err(DeliveryError::Transport(format!(
                "{failed} of {live} subscriptions failed"
            )));
        }
        Ok(())
    }

    /// Unsubscribe everything, keeping the listeners registered.
    pub async fn unsubscribe_all(&self) {
        let mut subs = self.subscriptions.lock().await;
        for (channel, sub) in subs.drain() {
            unsubscribe(&channel, sub).await;
        }
    }

    /// registered channel names, sorted
    pub fn channels(&self) -> Vec<String> {
        self.listeners.read().keys().cloned().collect()
    }

    /// number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// true if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    async fn subscribe(&self, listener: &Arc<BoundListener>) -> DeliveryResult<Box<dyn Subscription>> {
        let handler: Arc<dyn InboundHandler> = listener.clone();
        let sub = self.transport.subscribe(listener.channel(), handler).await?;
        metrics::SUBSCRIPTIONS.inc();
        debug!(channel = listener.channel(), "subscribed");
        Ok(sub)
    }
}

async fn unsubscribe(channel: &str, mut sub: Box<dyn Subscription>) {
    if let Err(err) = sub.unsubscribe().await {
        warn!(%channel, error = %err, "failed to unsubscribe, dropping handle");
    }
}
