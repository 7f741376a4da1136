//! Integration tests for the NATS backend
//!
//! Run with: cargo test -p courier-broker --test nats_integration -- --ignored
//! Requires: docker run -p 4222:4222 nats:latest

use std::sync::Arc;
use std::time::Duration;

use courier_broker::options::{auto_ack, brokers};
use courier_broker::{handler_fn, Broker, Event, HandlerError, Message, NatsBroker};
use tokio::sync::mpsc;

#[tokio::test]
#[ignore]
async fn test_nats_publish_subscribe_roundtrip() {
    let broker = NatsBroker::new(vec![brokers(["nats://localhost:4222"])]);
    broker.connect().await.expect("Failed to connect to NATS");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |event: Arc<dyn Event>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((
                event.topic().to_string(),
                event.message().body.clone(),
                event.message().header.get("tenant").cloned(),
            ));
            Ok::<(), HandlerError>(())
        }
    });

    // Subscribe first
    let sub = broker
        .subscribe("courier.test.orders", Arc::new(handler), vec![auto_ack(true)])
        .await
        .expect("Failed to subscribe");

    broker
        .publish(
            "courier.test.orders",
            Message::new("order-1").with_header("tenant", "acme"),
            vec![],
        )
        .await
        .expect("Failed to publish");

    let (topic, body, tenant) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out")
        .expect("Handler dropped");
    assert_eq!(topic, "courier.test.orders");
    assert_eq!(body, bytes::Bytes::from("order-1"));
    assert_eq!(tenant.as_deref(), Some("acme"));

    sub.unsubscribe().await.expect("Failed to unsubscribe");
    broker.disconnect().await.expect("Failed to disconnect");
}

#[tokio::test]
#[ignore]
async fn test_nats_connect_is_idempotent() {
    let broker = NatsBroker::new(vec![brokers(["nats://localhost:4222"])]);
    broker.connect().await.expect("Failed to connect to NATS");
    broker.connect().await.expect("Second connect failed");
    broker.disconnect().await.expect("Failed to disconnect");
    broker.disconnect().await.expect("Second disconnect failed");
}
