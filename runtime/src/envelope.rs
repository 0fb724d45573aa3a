//! Received messages and what happens to them.
//!
//! An [`Envelope`] wraps one delivery. Exactly one of the following settles
//! it with the transport, and only the first one counts:
//!
//! - [`Envelope::ack`]: processed, never deliver again
//! - [`Envelope::nack`]: deliver again later
//! - [`Envelope::retryable_error`]: nack while the message is young, dead-letter
//!   once it is older than the channel's maximum retry age
//! - [`Envelope::dead_letter`]: republish to the dead-letter channel, then ack
//!   (or nack if the republish failed)
//!
//! Dropping an unsettled envelope leaves the message to the transport, which
//! redelivers it.

use crate::ServiceInner;
use crate::metrics::ChannelMetrics;
use courier_core::dead_letter::dead_letter_attributes;
use courier_core::message::{Delivery, OutboundMessage, RawMessage};
use courier_core::retry_policy::RetryDecision;
use courier_core::transport::Acknowledger;
use courier_core::{Channel, ChannelError, DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Where an envelope stands with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered, not yet settled.
    Received,
    /// Acknowledged; the transport will not deliver it again.
    Acked,
    /// Negatively acknowledged; the transport will deliver it again.
    Nacked,
    /// Being republished to the dead-letter channel.
    DeadLetterPending,
}

impl Disposition {
    /// Whether no further ack or nack can change this disposition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Nacked)
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Acked => 1,
            Self::Nacked => 2,
            Self::DeadLetterPending => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Acked,
            2 => Self::Nacked,
            3 => Self::DeadLetterPending,
            _ => Self::Received,
        }
    }
}

/// A received message bound to the channel it came from.
pub struct Envelope {
    message: RawMessage,
    channel_id: String,
    service: Weak<ServiceInner>,
    acker: Box<dyn Acknowledger>,
    state: AtomicU8,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("channel_id", &self.channel_id)
            .field("disposition", &self.disposition())
            .finish_non_exhaustive()
    }
}

impl Envelope {
    pub(crate) fn new(delivery: Delivery, channel_id: &str, service: &Arc<ServiceInner>) -> Self {
        Self {
            message: delivery.message,
            channel_id: channel_id.to_string(),
            service: Arc::downgrade(service),
            acker: delivery.acker,
            state: AtomicU8::new(Disposition::Received.as_u8()),
        }
    }

    /// Message ID assigned by the transport.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.message.id
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.message.data
    }

    /// Message attributes.
    #[must_use]
    pub const fn attributes(&self) -> &HashMap<String, String> {
        &self.message.attributes
    }

    /// A single attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.message.attribute(key)
    }

    /// When the message was first published.
    #[must_use]
    pub const fn publish_time(&self) -> DateTime<Utc> {
        self.message.publish_time
    }

    /// The underlying message.
    #[must_use]
    pub const fn message(&self) -> &RawMessage {
        &self.message
    }

    /// ID of the channel the message was received on.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The channel the message was received on.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] once the service has been dropped.
    pub fn channel(&self) -> Result<Channel, ChannelError> {
        let service = self.service()?;
        service.registry.lookup(&self.channel_id).cloned()
    }

    /// Current disposition.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        Disposition::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Decode the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unmarshal`] if the payload is not valid JSON
    /// for `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_slice(&self.message.data).map_err(|source| ChannelError::Unmarshal {
            message_id: self.message.id.clone(),
            source,
        })
    }

    /// Acknowledge the message. No effect if already settled.
    pub fn ack(&self) {
        if self.transition(Disposition::Received, Disposition::Acked) {
            self.acker.ack();
            ChannelMetrics::record_ack(&self.channel_id);
        } else {
            tracing::debug!(message_id = %self.message.id, "Ignoring ack of settled message");
        }
    }

    /// Return the message for redelivery. No effect if already settled.
    pub fn nack(&self) {
        if self.transition(Disposition::Received, Disposition::Nacked) {
            self.acker.nack();
            ChannelMetrics::record_nack(&self.channel_id);
        } else {
            tracing::debug!(message_id = %self.message.id, "Ignoring nack of settled message");
        }
    }

    /// Report a processing failure that may succeed on a later attempt.
    ///
    /// Nacks the message while its age (now minus publish time) is within the
    /// channel's maximum retry age; once it is older, routes it to the
    /// dead-letter channel with `cause` as the error.
    ///
    /// # Errors
    ///
    /// Only the dead-letter path can fail; see [`dead_letter`](Self::dead_letter).
    pub fn retryable_error(
        &self,
        cause: impl fmt::Display,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send + '_ {
        let cause = cause.to_string();
        async move {
            let service = self.service()?;
            let channel = service.registry.lookup(&self.channel_id)?;

            match RetryDecision::evaluate(
                self.message.publish_time,
                service.clock.now(),
                channel.max_retry_age,
            ) {
                RetryDecision::Redeliver => {
                    tracing::debug!(
                        message_id = %self.message.id,
                        channel = %self.channel_id,
                        error = %cause,
                        "Retryable error, message will be redelivered"
                    );
                    self.nack();
                    Ok(())
                }
                RetryDecision::DeadLetter => {
                    tracing::info!(
                        message_id = %self.message.id,
                        channel = %self.channel_id,
                        max_retry_age_secs = channel.max_retry_age.as_secs(),
                        "Message exceeded max retry age"
                    );
                    self.route_to_dead_letter(&service, cause).await
                }
            }
        }
    }

    /// Republish the message to the dead-letter channel.
    ///
    /// The copy keeps the original data and attributes and adds provenance
    /// attributes (`originalMessageID`, `originalTopicID`,
    /// `originalSubscriptionID`, `error`, `deadLetterCount`). The original is
    /// acked once the copy is accepted, and nacked if the republish fails.
    /// An envelope that was already acked keeps its disposition and its copy
    /// is still published. A nacked envelope, or one another call is already
    /// dead-lettering, publishes nothing.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NoDeadLetterChannel`] if none is configured; the
    ///   message is left unsettled
    /// - [`ChannelError::Closed`] if the service is closed
    /// - [`ChannelError::Transport`] if the republish fails
    pub fn dead_letter(
        &self,
        cause: impl fmt::Display,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send + '_ {
        let cause = cause.to_string();
        async move {
            let service = self.service()?;
            self.route_to_dead_letter(&service, cause).await
        }
    }

    /// [`retryable_error`](Self::retryable_error), logging instead of
    /// returning the error.
    pub fn try_retryable_error(
        &self,
        cause: impl fmt::Display,
    ) -> impl Future<Output = ()> + Send + '_ {
        let cause = cause.to_string();
        async move {
            if let Err(error) = self.retryable_error(cause).await {
                tracing::error!(
                    message_id = %self.message.id,
                    channel = %self.channel_id,
                    error = %error,
                    "Failed to handle retryable error"
                );
            }
        }
    }

    /// [`dead_letter`](Self::dead_letter), logging instead of returning the
    /// error.
    pub fn try_dead_letter(&self, cause: impl fmt::Display) -> impl Future<Output = ()> + Send + '_ {
        let cause = cause.to_string();
        async move {
            if let Err(error) = self.dead_letter(cause).await {
                tracing::error!(
                    message_id = %self.message.id,
                    channel = %self.channel_id,
                    error = %error,
                    "Failed to dead-letter message"
                );
            }
        }
    }

    async fn route_to_dead_letter(
        &self,
        service: &ServiceInner,
        cause: String,
    ) -> Result<(), ChannelError> {
        let Some(target) = service.registry.dead_letter() else {
            return Err(ChannelError::NoDeadLetterChannel);
        };
        let source = service.registry.lookup(&self.channel_id)?;

        let pending = self.transition(Disposition::Received, Disposition::DeadLetterPending);
        if !pending {
            let disposition = self.disposition();
            if matches!(disposition, Disposition::Nacked | Disposition::DeadLetterPending) {
                tracing::warn!(
                    message_id = %self.message.id,
                    channel = %self.channel_id,
                    disposition = ?disposition,
                    error = %cause,
                    "Message is already redelivered or being dead-lettered, skipping dead letter"
                );
                return Ok(());
            }
        }

        let attributes = dead_letter_attributes(&self.message, source, &cause);
        let copy = OutboundMessage::new(self.message.data.clone(), attributes);

        let result = service
            .publish(&target.id, &target.topic_id, copy, "publish dead letter to topic")
            .await;

        match result {
            Ok(dead_letter_id) => {
                if pending {
                    self.settle(Disposition::Acked);
                }
                ChannelMetrics::record_dead_letter(&self.channel_id);
                tracing::info!(
                    message_id = %self.message.id,
                    dead_letter_id = %dead_letter_id,
                    channel = %self.channel_id,
                    dead_letter_topic = %target.topic_id,
                    error = %cause,
                    "Routed message to dead-letter channel"
                );
                Ok(())
            }
            Err(error) => {
                if pending {
                    self.settle(Disposition::Nacked);
                }
                ChannelMetrics::record_dead_letter_error(&self.channel_id);
                tracing::warn!(
                    message_id = %self.message.id,
                    channel = %self.channel_id,
                    error = %error,
                    "Dead-letter publish failed, message will be redelivered"
                );
                Err(error)
            }
        }
    }

    /// Resolve a pending dead-letter route.
    fn settle(&self, to: Disposition) {
        if !self.transition(Disposition::DeadLetterPending, to) {
            return;
        }
        match to {
            Disposition::Acked => {
                self.acker.ack();
                ChannelMetrics::record_ack(&self.channel_id);
            }
            Disposition::Nacked => {
                self.acker.nack();
                ChannelMetrics::record_nack(&self.channel_id);
            }
            Disposition::Received | Disposition::DeadLetterPending => {}
        }
    }

    fn transition(&self, from: Disposition, to: Disposition) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn service(&self) -> Result<Arc<ServiceInner>, ChannelError> {
        self.service.upgrade().ok_or(ChannelError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_round_trips_through_u8() {
        for disposition in [
            Disposition::Received,
            Disposition::Acked,
            Disposition::Nacked,
            Disposition::DeadLetterPending,
        ] {
            assert_eq!(Disposition::from_u8(disposition.as_u8()), disposition);
        }
    }

    #[test]
    fn only_acked_and_nacked_are_terminal() {
        assert!(!Disposition::Received.is_terminal());
        assert!(!Disposition::DeadLetterPending.is_terminal());
        assert!(Disposition::Acked.is_terminal());
        assert!(Disposition::Nacked.is_terminal());
    }
}
