//! Seen acknowledgement towards the broker.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::{listener::HandlerPolicy, metrics, pool::WorkerPool, transport::Broker};

/// Reports handled messages as seen, inline or on the seen pool depending on
/// the listener's [`HandlerPolicy`].
#[derive(Debug, Clone)]
pub struct SeenAcknowledger {
    broker: Arc<dyn Broker>,
    pool: Arc<WorkerPool>,
}

impl SeenAcknowledger {
    /// `pool` runs acknowledgements for `AsyncSeen` listeners.
    pub fn new(broker: Arc<dyn Broker>, pool: Arc<WorkerPool>) -> Self {
        Self { broker, pool }
    }

    /// Acknowledge `message_id` according to `policy`. Failures are logged
    /// only; an unacknowledged message comes back with the next recovery run.
    pub async fn acknowledge(&self, policy: HandlerPolicy, message_id: Option<&str>) {
        let Some(message_id) = message_id else {
            trace!(%policy, "message has no id, nothing to acknowledge");
            return;
        };
        match policy {
            HandlerPolicy::NatsOnly => {}
            HandlerPolicy::Full | HandlerPolicy::RecoveryOnly => {
                mark_seen(self.broker.as_ref(), message_id).await;
            }
            HandlerPolicy::AsyncSeen => {
                let broker = Arc::clone(&self.broker);
                let message_id = message_id.to_owned();
                self.pool
                    .execute(async move { mark_seen(broker.as_ref(), &message_id).await })
                    .await;
            }
        }
    }
}

async fn mark_seen(broker: &dyn Broker, message_id: &str) {
    match broker.mark_seen(message_id).await {
        Ok(()) => {
            metrics::SEEN_ACKS.inc();
            trace!(message_id, "acknowledged seen");
        }
        Err(err) => {
            metrics::SEEN_ACK_FAILURES.inc();
            warn!(message_id, error = %err, "failed to acknowledge seen, broker will redeliver");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        error::{DeliveryError, DeliveryResult},
        pool::PoolConfig,
        transport::UnseenResponse,
    };

    #[derive(Debug, Default)]
    struct RecordingBroker {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn query_unseen(&self) -> DeliveryResult<UnseenResponse> {
            Err(DeliveryError::Transport("unused".into()))
        }

        async fn mark_seen(&self, message_id: &str) -> DeliveryResult<()> {
            if self.fail {
                return Err(DeliveryError::Transport("down".into()));
            }
            self.seen.lock().push(message_id.to_owned());
            Ok(())
        }
    }

    fn acknowledger(broker: &Arc<RecordingBroker>) -> (SeenAcknowledger, Arc<WorkerPool>) {
        let pool = Arc::new(WorkerPool::new("test-seen", PoolConfig::new(2, 8)));
        let broker: Arc<dyn Broker> = Arc::clone(broker) as Arc<dyn Broker>;
        (SeenAcknowledger::new(broker, Arc::clone(&pool)), pool)
    }

    #[tokio::test]
    async fn test_policy_routing() {
        let broker = Arc::new(RecordingBroker::default());
        let (acks, pool) = acknowledger(&broker);

        acks.acknowledge(HandlerPolicy::Full, Some("full")).await;
        acks.acknowledge(HandlerPolicy::RecoveryOnly, Some("recovery")).await;
        acks.acknowledge(HandlerPolicy::NatsOnly, Some("nats")).await;
        acks.acknowledge(HandlerPolicy::Full, None).await;
        assert_eq!(*broker.seen.lock(), vec!["full", "recovery"]);

        acks.acknowledge(HandlerPolicy::AsyncSeen, Some("async")).await;
        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(*broker.seen.lock(), vec!["full", "recovery", "async"]);
    }

    #[tokio::test]
    async fn test_failure_is_absorbed() {
        let broker = Arc::new(RecordingBroker {
            fail: true,
            ..Default::default()
        });
        let (acks, _pool) = acknowledger(&broker);
        let before = metrics::SEEN_ACK_FAILURES.get();
        acks.acknowledge(HandlerPolicy::Full, Some("m-1")).await;
        assert!(metrics::SEEN_ACK_FAILURES.get() > before);
        assert!(broker.seen.lock().is_empty());
    }
}
