//! Transport abstraction for publish/subscribe backends.
//!
//! This module provides the [`Transport`] trait: the collaborator every channel
//! operation eventually talks to. A transport knows nothing about channels; it
//! manages topics and subscriptions by their backend IDs.
//!
//! # Architecture
//!
//! ```text
//!   ChannelService ──► Transport ──► topic ──► subscription
//!        │                                         │
//!        │ publish_event / dead-letter             │ receive
//!        ▼                                         ▼
//!   OutboundMessage                      Delivery { RawMessage, Acknowledger }
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a delivery that is NACK'ed, or dropped without a
//!   decision, is redelivered later
//! - **No ordering**: deliveries on the same subscription may arrive in any order
//! - **Concurrent**: the consumer may process several deliveries at once
//!
//! # Implementations
//!
//! - `InMemoryTransport` (courier-testing) - a fast, deterministic emulator
//! - `RedpandaTransport` (courier-redpanda) - Kafka-compatible brokers via rdkafka
//!
//! # Errors
//!
//! Implementations report [`TransportError::Cancelled`] for every operation
//! attempted after [`Transport::close`], and [`TransportError::NotFound`] /
//! [`TransportError::AlreadyExists`] where the backend distinguishes them.

use crate::error::TransportError;
use crate::message::{Delivery, OutboundMessage};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Stream of deliveries from a subscription.
///
/// The stream ends (or yields [`TransportError::Cancelled`]) once the
/// transport is closed. Dropping the stream stops receiving.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Acknowledgement handle for a single delivery.
///
/// Only the first call has an effect; later calls are ignored. A handle that is
/// dropped without either call lets the delivery be redelivered, like an
/// expired acknowledgement deadline.
pub trait Acknowledger: Send + Sync {
    /// Confirm processing; the message will not be redelivered.
    fn ack(&self);

    /// Reject processing; the message will be redelivered.
    fn nack(&self);
}

/// Trait for publish/subscribe backends.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures instead of using `async fn` so the service can
/// hold an `Arc<dyn Transport>` shared by all channels and receive loops.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one connection serves every
/// concurrent publish, receive loop and acknowledgement.
pub trait Transport: Send + Sync {
    /// Whether the topic exists.
    fn topic_exists<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, bool>;

    /// Create a topic.
    ///
    /// # Errors
    ///
    /// [`TransportError::AlreadyExists`] if the topic exists already.
    fn create_topic<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, ()>;

    /// Delete a topic.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotFound`] if the topic does not exist.
    fn delete_topic<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, ()>;

    /// Whether the subscription exists.
    fn subscription_exists<'a>(&'a self, subscription_id: &'a str) -> TransportFuture<'a, bool>;

    /// Create a subscription on an existing topic.
    ///
    /// A message that is neither ACK'ed nor NACK'ed within `ack_deadline` is
    /// redelivered.
    ///
    /// # Errors
    ///
    /// [`TransportError::AlreadyExists`] if the subscription exists already,
    /// [`TransportError::NotFound`] if the topic does not exist.
    fn create_subscription<'a>(
        &'a self,
        topic_id: &'a str,
        subscription_id: &'a str,
        ack_deadline: Duration,
    ) -> TransportFuture<'a, ()>;

    /// Delete a subscription.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotFound`] if the subscription does not exist.
    fn delete_subscription<'a>(&'a self, subscription_id: &'a str) -> TransportFuture<'a, ()>;

    /// Publish a message and wait until the backend has accepted it.
    ///
    /// Returns the message ID assigned by the backend.
    fn publish<'a>(
        &'a self,
        topic_id: &'a str,
        message: OutboundMessage,
    ) -> TransportFuture<'a, String>;

    /// Start receiving deliveries from a subscription of `topic_id`.
    fn receive<'a>(
        &'a self,
        topic_id: &'a str,
        subscription_id: &'a str,
    ) -> TransportFuture<'a, DeliveryStream>;

    /// Release the connection.
    ///
    /// # Errors
    ///
    /// A second call may report [`TransportError::Cancelled`] because the
    /// connection is already closing.
    fn close(&self) -> TransportFuture<'_, ()>;
}
