//! Topic and subscription reconciliation.
//!
//! Idempotent: existing resources are left alone, missing ones are created,
//! and a concurrent creator winning the race counts as success. Deletion
//! treats absent resources as already deleted.
//!
//! Reconciliation stops at the first failure; resources created before it
//! stay in place.

use crate::{ACK_DEADLINE, ChannelService};
use courier_core::ChannelError;
use courier_core::error::translate_error;

impl ChannelService {
    /// Create `topic_id` unless it already exists.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] after [`close`](Self::close)
    /// - [`ChannelError::Transport`] if checking or creating the topic fails
    pub async fn ensure_topic(&self, topic_id: &str) -> Result<(), ChannelError> {
        self.inner.ensure_open()?;
        let transport = &self.inner.transport;

        let exists = transport
            .topic_exists(topic_id)
            .await
            .map_err(|e| translate_error(e, "check existence of topic", topic_id))?;
        if exists {
            tracing::debug!(topic = topic_id, "Topic already exists");
            return Ok(());
        }

        match transport.create_topic(topic_id).await {
            Ok(()) => tracing::info!(topic = topic_id, "Created topic"),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(topic = topic_id, "Topic created concurrently");
            }
            Err(e) => return Err(translate_error(e, "create topic", topic_id)),
        }
        Ok(())
    }

    /// Create `subscription_id` on `topic_id` unless it already exists.
    ///
    /// New subscriptions get a 10 second ack deadline. An existing
    /// subscription is not checked against `topic_id`.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] after [`close`](Self::close)
    /// - [`ChannelError::Transport`] if checking or creating the subscription fails
    pub async fn ensure_subscription(
        &self,
        topic_id: &str,
        subscription_id: &str,
    ) -> Result<(), ChannelError> {
        self.inner.ensure_open()?;
        let transport = &self.inner.transport;

        let exists = transport
            .subscription_exists(subscription_id)
            .await
            .map_err(|e| translate_error(e, "check existence of subscription", subscription_id))?;
        if exists {
            tracing::debug!(subscription = subscription_id, "Subscription already exists");
            return Ok(());
        }

        match transport
            .create_subscription(topic_id, subscription_id, ACK_DEADLINE)
            .await
        {
            Ok(()) => tracing::info!(
                topic = topic_id,
                subscription = subscription_id,
                ack_deadline_secs = ACK_DEADLINE.as_secs(),
                "Created subscription"
            ),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(subscription = subscription_id, "Subscription created concurrently");
            }
            Err(e) => return Err(translate_error(e, "create subscription", subscription_id)),
        }
        Ok(())
    }

    /// Make sure every registered channel's topic and subscription exist.
    ///
    /// Channels are visited in ID order. The dead-letter channel is included.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] after [`close`](Self::close), otherwise the
    /// first failure; earlier channels stay reconciled.
    #[tracing::instrument(skip(self), name = "reconcile_all")]
    pub async fn reconcile_all(&self) -> Result<(), ChannelError> {
        self.inner.ensure_open()?;
        for channel in self.inner.registry.channels() {
            tracing::debug!(channel = %channel.id, topic = %channel.topic_id, "Reconciling channel");
            self.ensure_topic(&channel.topic_id).await?;
            if let Some(subscription_id) = channel.subscription_id.as_deref() {
                self.ensure_subscription(&channel.topic_id, subscription_id)
                    .await?;
            }
        }

        tracing::info!(channels = self.inner.registry.len(), "Topology reconciled");
        Ok(())
    }

    /// Delete a channel's subscription (if any), then its topic.
    ///
    /// Resources that do not exist are skipped.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] for unknown channels
    /// - [`ChannelError::Closed`] after [`close`](Self::close)
    /// - [`ChannelError::Transport`] if a check or delete fails
    pub async fn delete_channel(&self, channel_id: &str) -> Result<(), ChannelError> {
        let channel = self.inner.registry.lookup(channel_id)?;
        self.inner.ensure_open()?;
        let transport = &self.inner.transport;

        if let Some(subscription_id) = channel.subscription_id.as_deref() {
            let exists = transport
                .subscription_exists(subscription_id)
                .await
                .map_err(|e| {
                    translate_error(e, "check existence of subscription", subscription_id)
                })?;
            if exists {
                match transport.delete_subscription(subscription_id).await {
                    Ok(()) => tracing::info!(subscription = subscription_id, "Deleted subscription"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        return Err(translate_error(e, "delete subscription", subscription_id));
                    }
                }
            }
        }

        let topic_id = channel.topic_id.as_str();
        let exists = transport
            .topic_exists(topic_id)
            .await
            .map_err(|e| translate_error(e, "check existence of topic", topic_id))?;
        if exists {
            match transport.delete_topic(topic_id).await {
                Ok(()) => tracing::info!(topic = topic_id, "Deleted topic"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(translate_error(e, "delete topic", topic_id)),
            }
        }

        Ok(())
    }

    /// Delete every registered channel's resources.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] after [`close`](Self::close), otherwise the
    /// first failure.
    #[tracing::instrument(skip(self), name = "delete_all")]
    pub async fn delete_all(&self) -> Result<(), ChannelError> {
        self.inner.ensure_open()?;
        for channel in self.inner.registry.channels() {
            self.delete_channel(&channel.id).await?;
        }
        Ok(())
    }
}
