//! Integration tests for [`RedpandaTransport`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Topic and consumer-group reconciliation
//! - Publish/receive round-trip with attributes
//! - Redelivery after NACK
//! - Dead-lettering past the retry age
//! - Close semantics
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//! - Can be flaky due to consumer-group rebalancing
//!
//! To run explicitly:
//! ```bash
//! cargo test -p courier-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use courier_core::dead_letter::{DEAD_LETTER_COUNT, ORIGINAL_MESSAGE_ID, ORIGINAL_TOPIC_ID};
use courier_core::transport::Transport;
use courier_core::{CancellationToken, Channel, ChannelError};
use courier_redpanda::RedpandaTransport;
use courier_runtime::ChannelService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    total: u32,
}

/// Start Kafka and return the container with its broker address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;

    (kafka, brokers)
}

/// Wait until the broker answers metadata requests.
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(transport) = RedpandaTransport::new(brokers) {
            if transport.topic_exists("warmup").await.is_ok() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

fn transport(brokers: &str) -> RedpandaTransport {
    RedpandaTransport::builder()
        .brokers(brokers)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create transport")
}

fn orders_service(brokers: &str, max_retry_age: Duration) -> ChannelService {
    ChannelService::builder()
        .channel(
            Channel::new("orders", "orders-topic")
                .with_subscription("orders-worker")
                .with_max_retry_age(max_retry_age),
        )
        .dead_letter(
            Channel::new("dead-letter", "dead-letter-topic").with_subscription("dead-letter-worker"),
        )
        .build(transport(brokers))
}

#[tokio::test]
#[ignore]
async fn test_reconcile_creates_topics_and_groups() {
    let (_kafka, brokers) = start_kafka().await;
    let service = orders_service(&brokers, Duration::from_secs(120));
    let probe = transport(&brokers);

    service.reconcile_all().await.expect("Failed to reconcile");
    // Second run finds everything in place
    service.reconcile_all().await.expect("Failed to reconcile twice");

    assert!(probe.topic_exists("orders-topic").await.expect("topic"));
    assert!(probe.topic_exists("dead-letter-topic").await.expect("topic"));
    assert!(probe.subscription_exists("orders-worker").await.expect("group"));

    service.delete_all().await.expect("Failed to delete");
    assert!(!probe.topic_exists("orders-topic").await.expect("topic"));
}

#[tokio::test]
#[ignore]
async fn test_publish_and_receive_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let service = orders_service(&brokers, Duration::from_secs(120));
    service.reconcile_all().await.expect("Failed to reconcile");

    let order = OrderPlaced {
        order_id: "order-1".to_string(),
        total: 42,
    };
    let message_id = service
        .publish_event("orders", "OrderPlaced", &order)
        .await
        .expect("Failed to publish");

    let ctx = CancellationToken::new();
    let envelopes = tokio::time::timeout(WAIT, service.receive_n(&ctx, "orders", 1))
        .await
        .expect("Timeout waiting for message")
        .expect("Failed to receive");

    assert_eq!(envelopes.len(), 1);
    let envelope = &envelopes[0];
    assert_eq!(envelope.id(), message_id);
    assert_eq!(envelope.attribute("event"), Some("OrderPlaced"));
    assert_eq!(envelope.payload::<OrderPlaced>().expect("payload"), order);
}

#[tokio::test]
#[ignore]
async fn test_nack_redelivers_message() {
    let (_kafka, brokers) = start_kafka().await;
    let service = orders_service(&brokers, Duration::from_secs(120));
    service.reconcile_all().await.expect("Failed to reconcile");

    service
        .publish_event("orders", "OrderPlaced", &"retry me")
        .await
        .expect("Failed to publish");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let rejected = Arc::new(AtomicBool::new(false));
    let ctx = CancellationToken::new();
    let receiver = {
        let service = service.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            service
                .receive(&ctx, "orders", move |_ctx, envelope| {
                    let tx = tx.clone();
                    let rejected = Arc::clone(&rejected);
                    async move {
                        let _ = tx.send(envelope.id().to_string());
                        // Reject the first attempt only
                        if rejected.swap(true, Ordering::SeqCst) {
                            envelope.ack();
                        } else {
                            envelope.nack();
                        }
                    }
                })
                .await
        })
    };

    let first = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timeout waiting for delivery")
        .expect("delivery");
    let second = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timeout waiting for redelivery")
        .expect("redelivery");
    assert_eq!(first, second);

    ctx.cancel();
    receiver
        .await
        .expect("receive task")
        .expect("receive returns cleanly");
}

#[tokio::test]
#[ignore]
async fn test_retryable_error_past_retry_age_dead_letters() {
    let (_kafka, brokers) = start_kafka().await;
    let service = orders_service(&brokers, Duration::from_millis(1));
    service.reconcile_all().await.expect("Failed to reconcile");

    service
        .publish_event("orders", "OrderPlaced", &"poison")
        .await
        .expect("Failed to publish");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ctx = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let receiver = {
        let service = service.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            service
                .receive(&ctx, "orders", move |_ctx, envelope| {
                    let tx = tx.clone();
                    async move {
                        let result = envelope.retryable_error("handler failed").await;
                        let _ = tx.send((envelope.id().to_string(), result.is_ok()));
                    }
                })
                .await
        })
    };

    let (original_id, dead_lettered) = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timeout waiting for delivery")
        .expect("delivery");
    assert!(dead_lettered);
    ctx.cancel();
    receiver.await.expect("receive task").expect("receive");

    let copies = tokio::time::timeout(
        WAIT,
        service.receive_n(&CancellationToken::new(), "dead-letter", 1),
    )
    .await
    .expect("Timeout waiting for dead letter")
    .expect("Failed to receive dead letter");

    let copy = &copies[0];
    assert_eq!(copy.attribute(ORIGINAL_MESSAGE_ID), Some(original_id.as_str()));
    assert_eq!(copy.attribute(ORIGINAL_TOPIC_ID), Some("orders-topic"));
    assert_eq!(copy.attribute(DEAD_LETTER_COUNT), Some("1"));
    assert_eq!(copy.payload::<String>().expect("payload"), "poison");
}

#[tokio::test]
#[ignore]
async fn test_close_rejects_further_operations() {
    let (_kafka, brokers) = start_kafka().await;
    let transport: Arc<dyn Transport> = Arc::new(transport(&brokers));
    let service = ChannelService::builder()
        .channel(Channel::new("orders", "orders-topic").with_subscription("orders-worker"))
        .build_shared(Arc::clone(&transport));
    service.reconcile_all().await.expect("Failed to reconcile");

    service.close().await.expect("Failed to close");

    let result = service.publish_event("orders", "OrderPlaced", &"late").await;
    assert!(matches!(result, Err(ChannelError::Closed)));

    let second = transport.close().await;
    assert!(second.is_err_and(|e| e.is_cancelled()));
}
