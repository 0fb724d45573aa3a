//! Error types for channel operations.
//!
//! Two layers of errors exist:
//!
//! - [`TransportError`]: what a [`Transport`](crate::transport::Transport)
//!   backend reports, classified into a few backend-independent kinds.
//! - [`ChannelError`]: what the public channel operations return.
//!
//! Every transport error passes through [`translate_error`] before it reaches
//! a caller. Cancellation of the transport connection, whatever the backend
//! code, becomes the single [`ChannelError::Closed`] value, so callers test for
//! shutdown with `matches!(err, ChannelError::Closed)` instead of inspecting
//! messages.

use thiserror::Error;

/// Errors reported by a transport backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection was cancelled or is shutting down.
    #[error("connection cancelled: {0}")]
    Cancelled(String),

    /// The topic or subscription does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The topic or subscription already exists.
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// The backend is temporarily unreachable or stopped delivering.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

impl TransportError {
    /// Whether this error means the connection was cancelled or closed.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether this error means the resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this error means the resource already exists.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Errors returned by channel operations.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No channel is registered under this ID.
    #[error("channel \"{0}\" not found")]
    ChannelNotFound(String),

    /// The channel is publish-only and cannot receive.
    #[error("channel \"{0}\" does not have a subscription")]
    NoSubscription(String),

    /// Dead-lettering was requested but no dead-letter channel is configured.
    #[error("no dead-letter channel configured")]
    NoDeadLetterChannel,

    /// The service (or its transport connection) has been closed.
    #[error("channel service has been closed")]
    Closed,

    /// A transport operation failed for a reason other than shutdown.
    #[error("{operation} \"{resource}\" failed: {source}")]
    Transport {
        /// The operation that failed (e.g. "publish to topic")
        operation: &'static str,
        /// The topic or subscription involved
        resource: String,
        /// The backend error
        #[source]
        source: TransportError,
    },

    /// The payload could not be serialized before publishing.
    #[error("failed to marshal payload for event \"{event}\" on topic \"{topic}\": {source}")]
    Marshal {
        /// The event name
        event: String,
        /// The destination topic
        topic: String,
        /// The serialization error
        #[source]
        source: serde_json::Error,
    },

    /// A received payload could not be decoded.
    #[error("failed to unmarshal payload of message \"{message_id}\": {source}")]
    Unmarshal {
        /// The message ID
        message_id: String,
        /// The deserialization error
        #[source]
        source: serde_json::Error,
    },
}

impl ChannelError {
    /// Whether this is the canonical closed error.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether this error comes from channel configuration rather than I/O.
    ///
    /// Configuration errors surface immediately and are never worth retrying.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ChannelNotFound(_) | Self::NoSubscription(_) | Self::NoDeadLetterChannel
        )
    }
}

/// Translate a transport error into a [`ChannelError`].
///
/// Cancellation becomes [`ChannelError::Closed`]; every other error is wrapped
/// with the operation and resource it concerns, keeping the original error as
/// the source.
///
/// # Example
///
/// ```
/// use courier_core::error::{ChannelError, TransportError, translate_error};
///
/// let closed = translate_error(
///     TransportError::Cancelled("grpc: the client connection is closing".into()),
///     "publish to topic",
///     "order-events",
/// );
/// assert!(matches!(closed, ChannelError::Closed));
///
/// let wrapped = translate_error(
///     TransportError::Backend("permission denied".into()),
///     "delete topic",
///     "order-events",
/// );
/// assert_eq!(wrapped.to_string(), "delete topic \"order-events\" failed: permission denied");
/// ```
#[must_use]
pub fn translate_error(
    err: TransportError,
    operation: &'static str,
    resource: impl Into<String>,
) -> ChannelError {
    if err.is_cancelled() {
        return ChannelError::Closed;
    }

    ChannelError::Transport {
        operation,
        resource: resource.into(),
        source: err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn cancellation_maps_to_closed_regardless_of_message() {
        for message in ["context canceled", "client connection is closing", ""] {
            let err = translate_error(TransportError::Cancelled(message.into()), "receive", "sub");
            assert!(err.is_closed());
        }
    }

    #[test]
    fn other_errors_keep_their_source() {
        let err = translate_error(
            TransportError::NotFound("topic".into()),
            "publish to topic",
            "order-events",
        );

        assert!(!err.is_closed());
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("resource not found: topic"));
        assert!(matches!(
            err,
            ChannelError::Transport { source: TransportError::NotFound(_), .. }
        ));
    }

    #[test]
    fn configuration_errors_have_stable_messages() {
        assert_eq!(
            ChannelError::ChannelNotFound("unknown".into()).to_string(),
            "channel \"unknown\" not found"
        );
        assert_eq!(
            ChannelError::NoSubscription("without-subscription".into()).to_string(),
            "channel \"without-subscription\" does not have a subscription"
        );
        assert_eq!(
            ChannelError::NoDeadLetterChannel.to_string(),
            "no dead-letter channel configured"
        );
        assert!(ChannelError::NoDeadLetterChannel.is_configuration());
        assert!(!ChannelError::Closed.is_configuration());
    }
}
