//! Consumer-group subscriptions.
//!
//! Each [`open`] call starts one consumer task that owns a `StreamConsumer`
//! for the subscription's group and forwards deliveries over a bounded
//! channel. Offsets are never committed by the task itself: the
//! [`KafkaAcknowledger`] of each delivery commits on ack and seeks back on
//! nack.

use crate::error;
use chrono::{DateTime, Utc};
use courier_core::message::{Delivery, RawMessage};
use courier_core::transport::{Acknowledger, DeliveryStream};
use courier_core::{CancellationToken, TransportError};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Session timeouts accepted by default broker settings.
const MIN_SESSION_TIMEOUT: Duration = Duration::from_secs(6);
const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything needed to start consuming a subscription.
pub(crate) struct Config<'a> {
    pub brokers: &'a str,
    pub topic_id: &'a str,
    pub subscription_id: &'a str,
    pub ack_deadline: Duration,
    pub buffer_size: usize,
}

/// Message ID of the record at `offset` in `partition`.
pub(crate) fn message_id(partition: i32, offset: i64) -> String {
    format!("{partition}-{offset}")
}

fn session_timeout(ack_deadline: Duration) -> Duration {
    ack_deadline.clamp(MIN_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT)
}

/// Start consuming and return the delivery stream.
///
/// The stream yields [`TransportError::Cancelled`] and ends once `shutdown`
/// fires.
pub(crate) fn open(
    config: &Config<'_>,
    shutdown: CancellationToken,
) -> Result<DeliveryStream, TransportError> {
    let session_timeout = session_timeout(config.ack_deadline);

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", config.brokers)
        .set("group.id", config.subscription_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest")
        .set("session.timeout.ms", session_timeout.as_millis().to_string())
        .set("enable.partition.eof", "false")
        .create()
        .map_err(|e| error::from_kafka(&e))?;

    consumer
        .subscribe(&[config.topic_id])
        .map_err(|e| error::from_kafka(&e))?;

    tracing::info!(
        topic = config.topic_id,
        consumer_group = config.subscription_id,
        session_timeout_ms = u64::try_from(session_timeout.as_millis()).unwrap_or(u64::MAX),
        buffer_size = config.buffer_size,
        "Subscribed to topic"
    );

    let consumer = Arc::new(consumer);
    let (tx, mut rx) = tokio::sync::mpsc::channel(config.buffer_size);

    let task_shutdown = shutdown.clone();
    tokio::spawn(async move {
        use futures::StreamExt;

        let mut stream = consumer.stream();

        loop {
            let next = tokio::select! {
                () = task_shutdown.cancelled() => break,
                () = tx.closed() => break,
                next = stream.next() => next,
            };
            let Some(result) = next else { break };

            let item = match result {
                Ok(message) => Ok(delivery(&consumer, &message)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to receive message");
                    Err(error::from_kafka(&e))
                }
            };

            if tx.send(item).await.is_err() {
                break;
            }
        }

        tracing::debug!("Consumer task exiting");
    });

    let stream = async_stream::stream! {
        while let Some(result) = rx.recv().await {
            yield result;
        }
        if shutdown.is_cancelled() {
            yield Err(TransportError::Cancelled(crate::CLOSING.to_string()));
        }
    };

    Ok(Box::pin(stream))
}

fn delivery(consumer: &Arc<StreamConsumer>, message: &BorrowedMessage<'_>) -> Delivery {
    let attributes: HashMap<String, String> = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    let publish_time = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    tracing::trace!(
        topic = message.topic(),
        partition = message.partition(),
        offset = message.offset(),
        "Received message"
    );

    let raw = RawMessage {
        id: message_id(message.partition(), message.offset()),
        data: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        attributes,
        publish_time,
    };

    let acker = KafkaAcknowledger {
        consumer: Arc::clone(consumer),
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        decided: AtomicBool::new(false),
    };

    Delivery::new(raw, Box::new(acker))
}

/// Commits or rewinds the offset of one delivered record.
struct KafkaAcknowledger {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
    decided: AtomicBool,
}

impl KafkaAcknowledger {
    fn decide(&self) -> bool {
        !self.decided.swap(true, Ordering::AcqRel)
    }
}

impl Acknowledger for KafkaAcknowledger {
    fn ack(&self) {
        if !self.decide() {
            return;
        }

        let mut offsets = TopicPartitionList::new();
        let committed = offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .and_then(|()| self.consumer.commit(&offsets, CommitMode::Async));

        if let Err(e) = committed {
            tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }

    fn nack(&self) {
        if !self.decide() {
            return;
        }

        if let Err(e) = self.consumer.seek(
            &self.topic,
            self.partition,
            Offset::Offset(self.offset),
            Duration::ZERO,
        ) {
            tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                error = %e,
                "Failed to rewind partition (message redelivered after rebalance)"
            );
        }
    }
}
