//! Redpanda transport for Courier channels.
//!
//! [`RedpandaTransport`] implements the [`Transport`] trait from
//! `courier-core` on top of rdkafka, so channels can run on Redpanda, Apache
//! Kafka, or any other Kafka-compatible broker.
//!
//! # Mapping
//!
//! | Channel concept | Kafka concept |
//! |---|---|
//! | topic | topic (`partitions` x `replication`) |
//! | subscription | consumer group reading one topic |
//! | create subscription | commit the current end offsets for the group |
//! | message ID | `"{partition}-{offset}"` |
//! | attributes | record headers |
//! | publish time | record timestamp |
//! | ack | commit `offset + 1` |
//! | nack | seek the partition back to the message |
//! | ack deadline | consumer session timeout |
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - A new subscription starts at the end of its topic, like a fresh
//!   publish/subscribe subscription
//! - Offsets are only committed when a handler acks
//! - A nack replays the partition from the nacked message, so later messages
//!   of that partition are delivered again too
//! - Commits are per partition, so acking a later message also moves past an
//!   earlier one that is still in flight; handlers MUST be idempotent
//!
//! # Example
//!
//! ```no_run
//! use courier_redpanda::RedpandaTransport;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedpandaTransport::builder()
//!     .brokers("localhost:9092")
//!     .partitions(3)
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod subscription;

use courier_core::message::OutboundMessage;
use courier_core::transport::{DeliveryStream, Transport, TransportFuture};
use courier_core::{CancellationToken, TransportError};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const CLOSING: &str = "the client connection is closing";
const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Redpanda / Kafka transport.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Topic layout**: Partitions and replication factor for created topics
/// - **Buffer size**: Deliveries buffered per subscription stream (default: 1000)
///
/// # Example
///
/// ```no_run
/// use courier_redpanda::RedpandaTransport;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let transport = RedpandaTransport::new("localhost:9092")?;
///
/// // Custom configuration
/// let transport = RedpandaTransport::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")  // Wait for all replicas
///     .compression("lz4")
///     .replication(3)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaTransport {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    brokers: String,
    timeout: Duration,
    partitions: i32,
    replication: i32,
    buffer_size: usize,
    /// Ack deadlines of subscriptions created through this transport
    ack_deadlines: Mutex<HashMap<String, Duration>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl RedpandaTransport {
    /// Create a transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Backend`] if the clients cannot be created.
    pub fn new(brokers: &str) -> Result<Self, TransportError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> RedpandaTransportBuilder {
        RedpandaTransportBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled(CLOSING.to_string()));
        }
        Ok(())
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new().operation_timeout(Some(self.timeout))
    }

    fn group_consumer(&self, group_id: &str) -> Result<BaseConsumer, TransportError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| error::from_kafka(&e))
    }

    fn ack_deadline(&self, subscription_id: &str) -> Duration {
        self.ack_deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscription_id)
            .copied()
            .unwrap_or(DEFAULT_ACK_DEADLINE)
    }
}

/// Run a blocking librdkafka call off the async runtime.
async fn blocking<T, F>(call: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| TransportError::Backend(format!("blocking task failed: {e}")))?
}

impl Transport for RedpandaTransport {
    fn topic_exists<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            self.ensure_open()?;
            let producer = self.producer.clone();
            let topic = topic_id.to_string();
            let timeout = self.timeout;

            blocking(move || {
                let metadata = producer
                    .client()
                    .fetch_metadata(Some(&topic), timeout)
                    .map_err(|e| error::from_kafka(&e))?;
                Ok(metadata
                    .topics()
                    .iter()
                    .any(|t| t.name() == topic && t.error().is_none()))
            })
            .await
        })
    }

    fn create_topic<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let new_topic = NewTopic::new(
                topic_id,
                self.partitions,
                TopicReplication::Fixed(self.replication),
            );

            let results = self
                .admin
                .create_topics(&[new_topic], &self.admin_options())
                .await
                .map_err(|e| error::from_kafka(&e))?;

            for result in results {
                if let Err((topic, code)) = result {
                    return Err(error::from_code(code, format!("create topic {topic}: {code}")));
                }
            }
            tracing::debug!(topic = topic_id, partitions = self.partitions, "Created Kafka topic");
            Ok(())
        })
    }

    fn delete_topic<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let results = self
                .admin
                .delete_topics(&[topic_id], &self.admin_options())
                .await
                .map_err(|e| error::from_kafka(&e))?;

            for result in results {
                if let Err((topic, code)) = result {
                    return Err(error::from_code(code, format!("delete topic {topic}: {code}")));
                }
            }
            Ok(())
        })
    }

    fn subscription_exists<'a>(&'a self, subscription_id: &'a str) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            self.ensure_open()?;
            let producer = self.producer.clone();
            let group = subscription_id.to_string();
            let timeout = self.timeout;

            blocking(move || {
                let groups = producer
                    .client()
                    .fetch_group_list(Some(&group), timeout)
                    .map_err(|e| error::from_kafka(&e))?;
                Ok(groups
                    .groups()
                    .iter()
                    .any(|g| g.name() == group && g.state() != "Dead"))
            })
            .await
        })
    }

    fn create_subscription<'a>(
        &'a self,
        topic_id: &'a str,
        subscription_id: &'a str,
        ack_deadline: Duration,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.subscription_exists(subscription_id).await? {
                return Err(TransportError::AlreadyExists(format!(
                    "subscription {subscription_id}"
                )));
            }

            let consumer = self.group_consumer(subscription_id)?;
            let topic = topic_id.to_string();
            let timeout = self.timeout;

            // Start the group at the current end of the topic
            blocking(move || {
                let metadata = consumer
                    .fetch_metadata(Some(&topic), timeout)
                    .map_err(|e| error::from_kafka(&e))?;
                let Some(partitions) = metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == topic && t.error().is_none())
                    .map(|t| t.partitions().iter().map(|p| p.id()).collect::<Vec<_>>())
                else {
                    return Err(TransportError::NotFound(format!("topic {topic}")));
                };

                let mut offsets = TopicPartitionList::new();
                for partition in partitions {
                    let (_low, high) = consumer
                        .fetch_watermarks(&topic, partition, timeout)
                        .map_err(|e| error::from_kafka(&e))?;
                    offsets
                        .add_partition_offset(&topic, partition, Offset::Offset(high))
                        .map_err(|e| error::from_kafka(&e))?;
                }
                consumer
                    .commit(&offsets, CommitMode::Sync)
                    .map_err(|e| error::from_kafka(&e))
            })
            .await?;

            self.ack_deadlines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(subscription_id.to_string(), ack_deadline);

            tracing::debug!(
                topic = topic_id,
                consumer_group = subscription_id,
                "Created Kafka consumer group"
            );
            Ok(())
        })
    }

    fn delete_subscription<'a>(&'a self, subscription_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let results = self
                .admin
                .delete_groups(&[subscription_id], &self.admin_options())
                .await
                .map_err(|e| error::from_kafka(&e))?;

            for result in results {
                if let Err((group, code)) = result {
                    return Err(error::from_code(
                        code,
                        format!("delete consumer group {group}: {code}"),
                    ));
                }
            }
            self.ack_deadlines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(subscription_id);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        topic_id: &'a str,
        message: OutboundMessage,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            self.ensure_open()?;

            let mut headers = OwnedHeaders::new_with_capacity(message.attributes.len());
            for (key, value) in &message.attributes {
                headers = headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                });
            }

            let record: FutureRecord<'_, (), Vec<u8>> = FutureRecord::to(topic_id)
                .payload(&message.data)
                .headers(headers);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::trace!(
                        topic = topic_id,
                        partition = partition,
                        offset = offset,
                        "Message published"
                    );
                    Ok(subscription::message_id(partition, offset))
                }
                Err((kafka_error, _)) => {
                    tracing::debug!(topic = topic_id, error = %kafka_error, "Publish failed");
                    Err(error::from_kafka(&kafka_error))
                }
            }
        })
    }

    fn receive<'a>(
        &'a self,
        topic_id: &'a str,
        subscription_id: &'a str,
    ) -> TransportFuture<'a, DeliveryStream> {
        Box::pin(async move {
            self.ensure_open()?;
            if !self.subscription_exists(subscription_id).await? {
                return Err(TransportError::NotFound(format!(
                    "subscription {subscription_id}"
                )));
            }

            subscription::open(
                &subscription::Config {
                    brokers: &self.brokers,
                    topic_id,
                    subscription_id,
                    ack_deadline: self.ack_deadline(subscription_id),
                    buffer_size: self.buffer_size,
                },
                self.shutdown.clone(),
            )
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(TransportError::Cancelled(CLOSING.to_string()));
            }
            self.shutdown.cancel();

            let producer = self.producer.clone();
            let timeout = self.timeout;
            blocking(move || producer.flush(timeout).map_err(|e| error::from_kafka(&e)))
                .await?;

            tracing::info!(brokers = %self.brokers, "Redpanda transport closed");
            Ok(())
        })
    }
}

/// Builder for configuring a [`RedpandaTransport`].
///
/// # Example
///
/// ```no_run
/// use courier_redpanda::RedpandaTransport;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RedpandaTransport::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaTransportBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    partitions: Option<i32>,
    replication: Option<i32>,
    buffer_size: Option<usize>,
}

impl RedpandaTransportBuilder {
    /// Set the broker addresses.
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Timeout for publishes and admin operations.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Partitions of topics created by the transport.
    ///
    /// Default: 1
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Replication factor of topics created by the transport.
    ///
    /// Default: 1
    #[must_use]
    pub const fn replication(mut self, replication: i32) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Deliveries buffered between the Kafka consumer and the subscriber.
    ///
    /// Default: 1000. Zero is treated as one.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Build the [`RedpandaTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Backend`] if brokers are not set or a client
    /// cannot be created.
    pub fn build(self) -> Result<RedpandaTransport, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::Backend("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| TransportError::Backend(format!("Failed to create producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| TransportError::Backend(format!("Failed to create admin client: {e}")))?;

        let partitions = self.partitions.unwrap_or(1).max(1);
        let replication = self.replication.unwrap_or(1).max(1);
        let buffer_size = self.buffer_size.unwrap_or(1000).max(1);

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            partitions,
            replication,
            buffer_size,
            "RedpandaTransport created successfully"
        );

        Ok(RedpandaTransport {
            producer,
            admin,
            brokers,
            timeout,
            partitions,
            replication,
            buffer_size,
            ack_deadlines: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }
}
