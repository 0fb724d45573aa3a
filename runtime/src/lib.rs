//! # Courier Runtime
//!
//! The channel service: reliable, named message channels over a
//! publish/subscribe [`Transport`].
//!
//! ## Core Components
//!
//! - **[`ChannelService`]**: publishes events, reconciles topology, dispatches
//!   deliveries to handlers, and shuts the transport down
//! - **[`Envelope`]**: a received message plus its acknowledgement and the
//!   retry / dead-letter decisions made on it
//! - **Lifecycle**: [`AppService`] and [`AppEnv`] for starting and stopping a
//!   process's services in order
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::{CancellationToken, Channel};
//! use courier_runtime::ChannelService;
//!
//! let service = ChannelService::builder()
//!     .channel(Channel::new("orders", "order-events").with_subscription("order-worker"))
//!     .dead_letter(Channel::new("dead-letter", "dead-letter-events"))
//!     .build(transport);
//!
//! service.reconcile_all().await?;
//! service.publish_event("orders", "OrderPlaced", &order).await?;
//!
//! let ctx = CancellationToken::new();
//! service
//!     .receive(&ctx, "orders", |_ctx, envelope| async move {
//!         match handle(&envelope).await {
//!             Ok(()) => envelope.ack(),
//!             Err(err) => envelope.try_retryable_error(&err).await,
//!         }
//!     })
//!     .await?;
//! ```

use courier_core::environment::{Clock, SystemClock};
use courier_core::error::translate_error;
use courier_core::message::OutboundMessage;
use courier_core::transport::Transport;
use courier_core::{CancellationToken, Channel, ChannelError, ChannelRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Exponential backoff for bootstrap operations
pub mod backoff;

/// Received messages and their disposition
pub mod envelope;

/// Service lifecycle (init / close) for a process
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

mod dispatcher;
mod topology;

pub use backoff::{BackoffPolicy, retry_with_backoff};
pub use envelope::{Disposition, Envelope};
pub use lifecycle::{AppEnv, AppService, LifecycleError};

use metrics::ChannelMetrics;

/// Ack deadline given to every subscription the service creates.
pub const ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Default maximum number of handlers running at once per `receive` call.
pub const DEFAULT_MAX_OUTSTANDING: usize = 1000;

/// Shared state behind every [`ChannelService`] clone and every [`Envelope`].
pub(crate) struct ServiceInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: ChannelRegistry,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) max_outstanding: usize,
    closed: AtomicBool,
    pub(crate) shutdown: CancellationToken,
}

impl ServiceInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Publish to a topic, recording metrics against `channel_id`.
    pub(crate) async fn publish(
        &self,
        channel_id: &str,
        topic_id: &str,
        message: OutboundMessage,
        operation: &'static str,
    ) -> Result<String, ChannelError> {
        self.ensure_open()?;

        let start = Instant::now();
        match self.transport.publish(topic_id, message).await {
            Ok(message_id) => {
                ChannelMetrics::record_publish(channel_id, start.elapsed());
                Ok(message_id)
            }
            Err(error) => {
                ChannelMetrics::record_publish_error(channel_id);
                Err(translate_error(error, operation, topic_id))
            }
        }
    }
}

/// Reliable named channels over a publish/subscribe transport.
///
/// Cheap to clone; all clones share the transport, the registry and the
/// closed state.
///
/// # Concurrency
///
/// Every operation may be called from any number of tasks at once. The
/// registry is fixed at construction, so lookups take no locks.
#[derive(Clone)]
pub struct ChannelService {
    pub(crate) inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for ChannelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelService")
            .field("channels", &self.inner.registry.len())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl ChannelService {
    /// Start configuring a service.
    #[must_use]
    pub fn builder() -> ChannelServiceBuilder {
        ChannelServiceBuilder::default()
    }

    /// The channel registry.
    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }

    /// Look up a channel by ID.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ChannelNotFound`] for unknown IDs.
    pub fn channel(&self, channel_id: &str) -> Result<&Channel, ChannelError> {
        self.inner.registry.lookup(channel_id)
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Publish a JSON-encoded event to a channel's topic.
    ///
    /// The payload is serialized with `serde_json` and sent with an `event`
    /// attribute carrying `event_name`. Waits until the transport accepts the
    /// message and returns the ID it assigned.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] for unknown channels
    /// - [`ChannelError::Marshal`] if the payload cannot be serialized
    /// - [`ChannelError::Closed`] after [`close`](Self::close)
    /// - [`ChannelError::Transport`] for any other publish failure
    #[tracing::instrument(skip(self, payload), name = "publish_event")]
    pub async fn publish_event<T>(
        &self,
        channel_id: &str,
        event_name: &str,
        payload: &T,
    ) -> Result<String, ChannelError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let channel = self.inner.registry.lookup(channel_id)?;
        let message = OutboundMessage::event(event_name, payload).map_err(|source| {
            ChannelError::Marshal {
                event: event_name.to_string(),
                topic: channel.topic_id.clone(),
                source,
            }
        })?;

        let message_id = self
            .inner
            .publish(channel_id, &channel.topic_id, message, "publish event to topic")
            .await?;

        tracing::debug!(topic = %channel.topic_id, message_id = %message_id, "Published event");
        Ok(message_id)
    }

    /// Publish an event, logging instead of returning the error.
    ///
    /// Returns the message ID on success.
    pub async fn try_publish_event<T>(
        &self,
        channel_id: &str,
        event_name: &str,
        payload: &T,
    ) -> Option<String>
    where
        T: Serialize + Sync + ?Sized,
    {
        match self.publish_event(channel_id, event_name, payload).await {
            Ok(message_id) => Some(message_id),
            Err(error) => {
                tracing::error!(
                    channel = channel_id,
                    event = event_name,
                    error = %error,
                    "Failed to publish event"
                );
                None
            }
        }
    }

    /// Close the service and its transport connection.
    ///
    /// Marks the service closed, stops every running `receive` loop with
    /// [`ChannelError::Closed`], then releases the transport. Operations
    /// started afterwards fail with [`ChannelError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns the transport's close error unchanged in a
    /// [`ChannelError::Transport`]; a second call typically reports that the
    /// connection is already closing. The service stays closed either way.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let already_closed = self.inner.closed.swap(true, Ordering::AcqRel);
        self.inner.shutdown.cancel();

        if !already_closed {
            tracing::info!(channels = self.inner.registry.len(), "Closing channel service");
        }

        self.inner.transport.close().await.map_err(|source| {
            tracing::warn!(error = %source, already_closed, "Transport close failed");
            ChannelError::Transport {
                operation: "close",
                resource: "transport".to_string(),
                source,
            }
        })?;

        tracing::info!("Channel service closed");
        Ok(())
    }
}

/// Builder for [`ChannelService`].
///
/// # Example
///
/// ```ignore
/// let service = ChannelService::builder()
///     .channel(Channel::new("orders", "order-events").with_subscription("order-worker"))
///     .channel(Channel::new("audit", "audit-events"))
///     .dead_letter(Channel::new("", "dead-letter-events"))
///     .max_outstanding(64)
///     .build(transport);
/// ```
#[derive(Default)]
pub struct ChannelServiceBuilder {
    registry: ChannelRegistry,
    clock: Option<Arc<dyn Clock>>,
    max_outstanding: Option<usize>,
}

impl ChannelServiceBuilder {
    /// Register a channel. A channel with the same ID replaces the earlier one.
    #[must_use]
    pub fn channel(mut self, channel: Channel) -> Self {
        self.registry.add_channel(channel);
        self
    }

    /// Register several channels.
    #[must_use]
    pub fn channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        for channel in channels {
            self.registry.add_channel(channel);
        }
        self
    }

    /// Set the dead-letter channel.
    ///
    /// An empty ID becomes `"dead-letter"`. The dead-letter channel is also a
    /// regular channel, so it can be published to and received from.
    #[must_use]
    pub fn dead_letter(mut self, channel: Channel) -> Self {
        self.registry.set_dead_letter(channel);
        self
    }

    /// Use `clock` for message-age decisions instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Maximum number of handlers running at once per `receive` call.
    ///
    /// Zero is treated as one.
    #[must_use]
    pub const fn max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = Some(max_outstanding);
        self
    }

    /// Build the service over `transport`.
    #[must_use]
    pub fn build(self, transport: impl Transport + 'static) -> ChannelService {
        self.build_shared(Arc::new(transport))
    }

    /// Build the service over a shared transport.
    #[must_use]
    pub fn build_shared(self, transport: Arc<dyn Transport>) -> ChannelService {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let max_outstanding = self.max_outstanding.unwrap_or(DEFAULT_MAX_OUTSTANDING).max(1);

        tracing::debug!(
            channels = self.registry.len(),
            dead_letter = self.registry.dead_letter().map(|c| c.id.as_str()),
            max_outstanding,
            "Built channel service"
        );

        ChannelService {
            inner: Arc::new(ServiceInner {
                transport,
                registry: self.registry,
                clock,
                max_outstanding,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use courier_testing::InMemoryTransport;

    fn service(transport: &InMemoryTransport) -> ChannelService {
        ChannelService::builder()
            .channel(Channel::new("orders", "order-events").with_subscription("order-worker"))
            .dead_letter(Channel::new("", "dead-letter-events"))
            .build(transport.clone())
    }

    #[test]
    fn builder_registers_channels_and_dead_letter() {
        let service = service(&InMemoryTransport::new());

        assert_eq!(service.registry().len(), 2);
        assert_eq!(
            service.registry().dead_letter().map(|c| c.id.as_str()),
            Some("dead-letter")
        );
        assert!(!service.is_closed());
    }

    #[test]
    fn zero_max_outstanding_becomes_one() {
        let service = ChannelService::builder()
            .max_outstanding(0)
            .build(InMemoryTransport::new());
        assert_eq!(service.inner.max_outstanding, 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_channel_fails_before_transport() {
        let transport = InMemoryTransport::new();
        let service = service(&transport);

        let result = service.publish_event("missing", "ev", "payload").await;

        assert!(matches!(result, Err(ChannelError::ChannelNotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn try_publish_logs_and_returns_none() {
        let transport = InMemoryTransport::new();
        let service = service(&transport);

        // Topic was never created
        assert!(service.try_publish_event("orders", "ev", "payload").await.is_none());
    }

    #[tokio::test]
    async fn close_twice_keeps_service_closed() {
        let transport = InMemoryTransport::new();
        let service = service(&transport);

        assert!(service.close().await.is_ok());
        let second = service.close().await;

        assert!(matches!(second, Err(ChannelError::Transport { operation: "close", .. })));
        assert!(service.is_closed());
        assert!(transport.is_closed());
    }
}
