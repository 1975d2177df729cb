#![allow(dead_code)]
//! In-memory transport, broker and hooks for exercising the control plane.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use courier_core::{
    DeliveryError, DeliveryResult,
    async_trait,
    config::DeliveryConfig,
    listener::EventListener,
    pool::PoolConfig,
    state::{ConnectionRefresher, LifecycleHooks},
    transport::{
        Broker, InboundHandler, InboundMessage, OutboundMessage, ResponseStatus, Subscription,
        Transport, UnseenResponse,
    },
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Shared, ordered record of side effects across fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

#[derive(Default)]
struct TransportInner {
    sends: Mutex<Vec<OutboundMessage>>,
    send_attempts: AtomicUsize,
    failing_sends: AtomicU32,
    scripted_failures: Mutex<VecDeque<DeliveryError>>,
    down: AtomicBool,
    fail_subscribe: AtomicBool,
    subscribe_calls: AtomicUsize,
    live: Mutex<HashMap<String, usize>>,
    handlers: Mutex<HashMap<String, Arc<dyn InboundHandler>>>,
}

/// Transport that records sends and subscriptions.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<TransportInner>,
    journal: Journal,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            inner: Arc::default(),
            journal,
        }
    }

    /// fail the next `n` sends with a transport error
    pub fn fail_next_sends(&self, n: u32) {
        self.inner.failing_sends.store(n, Ordering::SeqCst);
    }

    /// fail the next send with `err`, queued after earlier scripted failures
    pub fn fail_next_send_with(&self, err: DeliveryError) {
        self.inner.scripted_failures.lock().push_back(err);
    }

    /// fail every send until set back to false
    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<OutboundMessage> {
        self.inner.sends.lock().clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.inner.send_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    /// live subscriptions on `channel`
    pub fn live(&self, channel: &str) -> usize {
        self.inner.live.lock().get(channel).copied().unwrap_or(0)
    }

    pub fn total_live(&self) -> usize {
        self.inner.live.lock().values().sum()
    }

    /// push a message through the live handler of its channel
    pub async fn deliver(&self, message: InboundMessage) -> bool {
        let handler = self.inner.handlers.lock().get(&message.channel).cloned();
        match handler {
            Some(handler) if self.live(&message.channel) > 0 => {
                handler.on_message(message).await;
                true
            }
            _ => false,
        }
    }
}

struct MockSubscription {
    channel: String,
    inner: Arc<TransportInner>,
    active: bool,
}

impl std::fmt::Debug for MockSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSubscription")
            .field("channel", &self.channel)
            .field("active", &self.active)
            .finish()
    }
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn unsubscribe(&mut self) -> DeliveryResult<()> {
        if std::mem::take(&mut self.active) {
            let mut live = self.inner.live.lock();
            if let Some(count) = live.get_mut(&self.channel) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &OutboundMessage) -> DeliveryResult<()> {
        self.inner.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(DeliveryError::NotConnected("transport down".into()));
        }
        if let Some(err) = self.inner.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        let failed = self
            .inner
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DeliveryError::Transport("send failed".into()));
        }
        self.inner.sends.lock().push(message.clone());
        self.journal.push(format!("send:{}", message.event_name));
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> DeliveryResult<Box<dyn Subscription>> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(DeliveryError::NotConnected("cannot subscribe".into()));
        }
        *self.inner.live.lock().entry(channel.to_owned()).or_default() += 1;
        self.inner
            .handlers
            .lock()
            .insert(channel.to_owned(), handler);
        self.journal.push(format!("subscribe:{channel}"));
        Ok(Box::new(MockSubscription {
            channel: channel.to_owned(),
            inner: Arc::clone(&self.inner),
            active: true,
        }))
    }
}

/// Broker answering scripted unseen responses.
#[derive(Debug, Default)]
pub struct MockBroker {
    responses: Mutex<VecDeque<DeliveryResult<UnseenResponse>>>,
    queries: AtomicUsize,
    seen: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockBroker {
    /// queue an `Ok` response with `messages`
    pub fn respond_ok(&self, messages: Vec<InboundMessage>) {
        self.responses.lock().push_back(Ok(UnseenResponse {
            status: ResponseStatus::Ok,
            messages,
        }));
    }

    /// queue an `Error` status response
    pub fn respond_rejected(&self) {
        self.responses.lock().push_back(Ok(UnseenResponse {
            status: ResponseStatus::Error,
            messages: vec![InboundMessage::new("ignored", "{}").with_id("ignored")],
        }));
    }

    /// queue a failed query
    pub fn respond_err(&self) {
        self.responses
            .lock()
            .push_back(Err(DeliveryError::Timeout("unseen query timed out".into())));
    }

    /// make queries wait until the returned notify fires
    pub fn hold_queries(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn query_unseen(&self) -> DeliveryResult<UnseenResponse> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(UnseenResponse {
                status: ResponseStatus::Ok,
                messages: Vec::new(),
            })
        })
    }

    async fn mark_seen(&self, message_id: &str) -> DeliveryResult<()> {
        self.seen.lock().push(message_id.to_owned());
        Ok(())
    }
}

/// Lifecycle hooks and refresher writing to a journal.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    journal: Journal,
    fail_initialize: Arc<AtomicBool>,
    panic_destroy: Arc<AtomicBool>,
    fail_refresh: Arc<AtomicBool>,
}

impl RecordingHooks {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    pub fn panic_destroy(&self) {
        self.panic_destroy.store(true, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self) {
        self.fail_refresh.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.journal.push("initialize");
        if self.fail_initialize.load(Ordering::SeqCst) {
            anyhow::bail!("application refused to initialize");
        }
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.journal.push("destroy");
        if self.panic_destroy.load(Ordering::SeqCst) {
            panic!("destroy hook exploded");
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionRefresher for RecordingHooks {
    async fn refresh(&self) -> anyhow::Result<()> {
        self.journal.push("refresh");
        if self.fail_refresh.load(Ordering::SeqCst) {
            anyhow::bail!("config provider unreachable");
        }
        Ok(())
    }
}

/// Listener appending `channel:body` to a journal, failing on bodies that
/// contain "fail" and panicking on bodies that contain "panic".
#[derive(Debug, Clone)]
pub struct RecordingListener {
    channel: String,
    journal: Journal,
}

impl RecordingListener {
    pub fn new(channel: &str, journal: Journal) -> Self {
        Self {
            channel: channel.to_owned(),
            journal,
        }
    }
}

#[async_trait]
impl EventListener for RecordingListener {
    async fn handle(&self, body: &str) -> anyhow::Result<()> {
        self.journal.push(format!("{}:{body}", self.channel));
        if body.contains("panic") {
            panic!("listener exploded on {body}");
        }
        if body.contains("fail") {
            anyhow::bail!("listener rejected {body}");
        }
        Ok(())
    }
}

/// Small pools and a fast backoff.
pub fn test_delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        publish_pool: PoolConfig::new(2, 4),
        seen_pool: PoolConfig::new(2, 16),
        recovery_pool: PoolConfig::new(2, 2),
        publish_backoff: Duration::from_secs(5),
        recovery_period: Duration::from_secs(20),
        shutdown_grace: Duration::from_secs(1),
        event_modes: Vec::new(),
    }
}
