mod common;

use std::{sync::Arc, time::Duration};

use common::{Journal, MockBroker, MockTransport, RecordingHooks, RecordingListener, test_delivery_config};
use courier_core::{
    CourierClient,
    listener::{HandlerPolicy, ListenerEntry},
    publisher::{ExecutionMode, PublishRequest},
    recovery::RecoveryOutcome,
    state::state_channel,
    transport::{ConnectionState, InboundMessage},
};
use tokio_util::sync::CancellationToken;

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn connect_recover_publish_and_shut_down() {
    let journal = Journal::default();
    let transport = MockTransport::with_journal(journal.clone());
    let broker = Arc::new(MockBroker::default());
    broker.respond_ok(vec![InboundMessage::new("orders", "replayed").with_id("m-1")]);

    let token = CancellationToken::new();
    let client = CourierClient::new(
        test_delivery_config(),
        Arc::new(transport.clone()),
        broker.clone(),
        token.clone(),
    );
    client
        .register(ListenerEntry::new(
            "orders",
            RecordingListener::new("orders", journal.clone()),
        ))
        .await;
    client
        .register(
            ListenerEntry::new("audit", RecordingListener::new("audit", journal.clone()))
                .with_policy(HandlerPolicy::RecoveryOnly),
        )
        .await;

    let hooks = RecordingHooks::new(journal.clone());
    let (notifier, receiver) = state_channel();
    client.start(receiver, Arc::new(hooks.clone()), Arc::new(hooks));
    assert!(client.is_running());

    notifier.notify(ConnectionState::Connected);
    wait_for(|| journal.count("initialize") == 1).await;
    assert_eq!(transport.live("orders"), 1);
    assert_eq!(transport.live("audit"), 0);

    // first scheduled recovery tick fires right away
    wait_for(|| broker.seen() == vec!["m-1"]).await;
    assert!(journal.entries().contains(&"orders:replayed".to_owned()));

    // live delivery
    assert!(
        transport
            .deliver(InboundMessage::new("orders", "live").with_id("m-2"))
            .await
    );
    assert_eq!(broker.seen(), vec!["m-1", "m-2"]);

    client
        .publish(PublishRequest::new("orders.created", serde_json::json!({"id": 1})))
        .await
        .unwrap();
    client
        .publish(
            PublishRequest::new("orders.updated", serde_json::json!({"id": 1}))
                .with_mode(ExecutionMode::Async),
        )
        .await
        .unwrap();

    client.shutdown().await;
    assert!(!client.is_running());
    assert_eq!(transport.total_live(), 0);
    let events = transport
        .sends()
        .into_iter()
        .map(|m| m.event_name)
        .collect::<Vec<_>>();
    assert_eq!(events.len(), 2);
    assert!(events.contains(&"orders.created".to_owned()));
    assert!(events.contains(&"orders.updated".to_owned()));

    // the caller's token is untouched
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn recover_now_runs_outside_schedule() {
    let journal = Journal::default();
    let broker = Arc::new(MockBroker::default());
    let client = CourierClient::new(
        test_delivery_config(),
        Arc::new(MockTransport::default()),
        broker.clone(),
        CancellationToken::new(),
    );
    client
        .register(
            ListenerEntry::new("audit", RecordingListener::new("audit", journal.clone()))
                .with_policy(HandlerPolicy::RecoveryOnly),
        )
        .await;
    broker.respond_ok(vec![
        InboundMessage::new("audit", "one").with_id("m-1"),
        InboundMessage::new("audit", "two").with_id("m-2"),
    ]);

    let outcome = client.recover_now().await;

    assert_eq!(
        outcome,
        RecoveryOutcome::Completed {
            delivered: 2,
            failed: 0
        }
    );
    assert_eq!(journal.entries(), vec!["audit:one", "audit:two"]);
    client.shutdown().await;
}

#[tokio::test]
async fn cancelling_parent_token_stops_controller() {
    let token = CancellationToken::new();
    let client = CourierClient::new(
        test_delivery_config(),
        Arc::new(MockTransport::default()),
        Arc::new(MockBroker::default()),
        token.clone(),
    );
    let hooks = RecordingHooks::default();
    let (_notifier, receiver) = state_channel();
    client.start(receiver, Arc::new(hooks.clone()), Arc::new(hooks));
    assert!(client.is_running());

    token.cancel();
    wait_for(|| !client.is_running()).await;
}
