//! Channels and the channel registry.
//!
//! A [`Channel`] is a self-chosen application name bound to a transport topic
//! and, optionally, a subscription on that topic. Application code refers to
//! channels by name; only the registry knows the underlying resource IDs.
//!
//! The [`ChannelRegistry`] is built once while the service is configured and is
//! read-only afterwards, so it is shared between concurrent receive loops
//! without locking.

use crate::error::ChannelError;
use std::collections::BTreeMap;
use std::time::Duration;

/// Retry age assigned to channels registered without one.
pub const DEFAULT_MAX_RETRY_AGE: Duration = Duration::from_secs(120);

/// Channel ID used for the dead-letter channel when none is given.
pub const DEFAULT_DEAD_LETTER_ID: &str = "dead-letter";

/// A message channel: a topic and optionally a subscription.
///
/// A channel without a subscription is publish-only. Messages published to a
/// topic that has no subscription at all are dropped by most transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Application-level name, unique within a registry.
    pub id: String,
    /// Transport topic the channel publishes to.
    pub topic_id: String,
    /// Transport subscription the channel receives from, if any.
    pub subscription_id: Option<String>,
    /// Time since publishing within which a recoverable failure is still
    /// NACK'ed rather than dead-lettered.
    ///
    /// `Duration::ZERO` means "use [`DEFAULT_MAX_RETRY_AGE`]"; the registry
    /// fills it in on registration. The bound keeps a failing message from
    /// being redelivered for as long as the transport retains it.
    pub max_retry_age: Duration,
}

impl Channel {
    /// Create a publish-only channel.
    #[must_use]
    pub fn new(id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic_id: topic_id.into(),
            subscription_id: None,
            max_retry_age: Duration::ZERO,
        }
    }

    /// Attach a subscription so the channel can receive messages.
    #[must_use]
    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        let subscription_id = subscription_id.into();
        self.subscription_id = (!subscription_id.is_empty()).then_some(subscription_id);
        self
    }

    /// Set the maximum retry age.
    #[must_use]
    pub const fn with_max_retry_age(mut self, max_retry_age: Duration) -> Self {
        self.max_retry_age = max_retry_age;
        self
    }

    /// The subscription ID, or `""` for publish-only channels.
    #[must_use]
    pub fn subscription_or_empty(&self) -> &str {
        self.subscription_id.as_deref().unwrap_or_default()
    }
}

/// The set of registered channels plus the optional dead-letter channel.
///
/// # Example
///
/// ```
/// use courier_core::channel::{Channel, ChannelRegistry};
/// use std::time::Duration;
///
/// let mut registry = ChannelRegistry::new();
/// registry.add_channel(
///     Channel::new("payments", "payment-events")
///         .with_subscription("payment-worker")
///         .with_max_retry_age(Duration::from_secs(30)),
/// );
///
/// assert!(registry.lookup("payments").is_ok());
/// assert!(registry.lookup("unknown").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Channel>,
    dead_letter: Option<String>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel, replacing any channel with the same ID.
    ///
    /// A zero `max_retry_age` is replaced by [`DEFAULT_MAX_RETRY_AGE`].
    pub fn add_channel(&mut self, mut channel: Channel) {
        if channel.max_retry_age.is_zero() {
            channel.max_retry_age = DEFAULT_MAX_RETRY_AGE;
        }
        self.channels.insert(channel.id.clone(), channel);
    }

    /// Register `channel` and designate it as the dead-letter target.
    ///
    /// An empty ID becomes [`DEFAULT_DEAD_LETTER_ID`].
    pub fn set_dead_letter(&mut self, mut channel: Channel) {
        if channel.id.is_empty() {
            channel.id = DEFAULT_DEAD_LETTER_ID.to_string();
        }
        self.dead_letter = Some(channel.id.clone());
        self.add_channel(channel);
    }

    /// Look up a channel by ID.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ChannelNotFound`] if no channel has this ID.
    pub fn lookup(&self, id: &str) -> Result<&Channel, ChannelError> {
        self.channels
            .get(id)
            .ok_or_else(|| ChannelError::ChannelNotFound(id.to_string()))
    }

    /// The designated dead-letter channel, if one was configured.
    #[must_use]
    pub fn dead_letter(&self) -> Option<&Channel> {
        self.dead_letter.as_deref().and_then(|id| self.channels.get(id))
    }

    /// All channels (including the dead-letter channel), ordered by ID.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_channel_fills_default_retry_age() {
        let mut registry = ChannelRegistry::new();
        registry.add_channel(Channel::new("orders", "order-events"));

        let channel = registry.lookup("orders").ok();
        assert_eq!(
            channel.map(|c| c.max_retry_age),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn add_channel_keeps_explicit_retry_age() {
        let mut registry = ChannelRegistry::new();
        registry.add_channel(
            Channel::new("orders", "order-events").with_max_retry_age(Duration::from_secs(5)),
        );

        assert_eq!(
            registry.lookup("orders").map(|c| c.max_retry_age).ok(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn add_channel_overwrites_by_id() {
        let mut registry = ChannelRegistry::new();
        registry.add_channel(Channel::new("orders", "first"));
        registry.add_channel(Channel::new("orders", "second"));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup("orders").map(|c| c.topic_id.as_str()).ok(),
            Some("second")
        );
    }

    #[test]
    fn dead_letter_defaults_its_id() {
        let mut registry = ChannelRegistry::new();
        registry.set_dead_letter(Channel::new("", "dead-letter-topic"));

        let dead_letter = registry.dead_letter();
        assert_eq!(dead_letter.map(|c| c.id.as_str()), Some("dead-letter"));
        assert!(registry.lookup("dead-letter").is_ok());
    }

    #[test]
    fn dead_letter_keeps_explicit_id() {
        let mut registry = ChannelRegistry::new();
        registry.set_dead_letter(Channel::new("dlq", "dlq-topic"));

        assert_eq!(registry.dead_letter().map(|c| c.id.as_str()), Some("dlq"));
    }

    #[test]
    fn lookup_unknown_channel_fails() {
        let registry = ChannelRegistry::new();
        let err = registry.lookup("unknown").err();
        assert!(matches!(err, Some(ChannelError::ChannelNotFound(ref id)) if id == "unknown"));
    }

    #[test]
    fn empty_subscription_means_publish_only() {
        let channel = Channel::new("audit", "audit-events").with_subscription("");
        assert_eq!(channel.subscription_id, None);
        assert_eq!(channel.subscription_or_empty(), "");
    }
}
