//! Message types exchanged with the transport.
//!
//! - [`OutboundMessage`]: what gets published (data + attributes)
//! - [`RawMessage`]: what a subscription delivers (adds ID and publish time)
//! - [`Delivery`]: a raw message plus the handle that acknowledges it

use crate::transport::Acknowledger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Attribute carrying the event name of messages published with
/// [`OutboundMessage::event`].
pub const EVENT_ATTRIBUTE: &str = "event";

/// A message ready to be published to a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// The message payload.
    pub data: Vec<u8>,
    /// String attributes delivered alongside the payload.
    pub attributes: HashMap<String, String>,
}

impl OutboundMessage {
    /// Create a message from raw data and attributes.
    #[must_use]
    pub const fn new(data: Vec<u8>, attributes: HashMap<String, String>) -> Self {
        Self { data, attributes }
    }

    /// Create an event message: `payload` JSON-encoded, with the `event`
    /// attribute set to `event_name`.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload cannot be serialized
    /// (for instance a map with non-string keys).
    ///
    /// # Example
    ///
    /// ```
    /// use courier_core::message::OutboundMessage;
    ///
    /// let message = OutboundMessage::event("OrderPlaced", &"test message").unwrap();
    /// assert_eq!(message.data, b"\"test message\"");
    /// assert_eq!(message.attributes["event"], "OrderPlaced");
    /// ```
    pub fn event<T: Serialize + ?Sized>(
        event_name: &str,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_vec(payload)?;
        let attributes = HashMap::from([(EVENT_ATTRIBUTE.to_string(), event_name.to_string())]);
        Ok(Self { data, attributes })
    }
}

/// A message as delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Transport-assigned message ID.
    pub id: String,
    /// The message payload.
    pub data: Vec<u8>,
    /// String attributes (order is irrelevant).
    pub attributes: HashMap<String, String>,
    /// When the message was originally published.
    pub publish_time: DateTime<Utc>,
}

impl RawMessage {
    /// Value of an attribute, if present.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl fmt::Display for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawMessage {{ id: {}, size: {} bytes, attributes: {} }}",
            self.id,
            self.data.len(),
            self.attributes.len()
        )
    }
}

/// One delivery from a subscription: the message and its acknowledgement handle.
pub struct Delivery {
    /// The delivered message.
    pub message: RawMessage,
    /// Handle used to ACK or NACK this delivery.
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Pair a message with its acknowledgement handle.
    #[must_use]
    pub fn new(message: RawMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("acker", &"<acker>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn event_message_encodes_json_and_sets_event_attribute() {
        let message = OutboundMessage::event("ev1", &serde_json::json!({ "id": 7 }));
        let message = message.ok();

        assert_eq!(message.as_ref().map(|m| m.data.as_slice()), Some(&b"{\"id\":7}"[..]));
        assert_eq!(
            message.as_ref().and_then(|m| m.attributes.get("event")).map(String::as_str),
            Some("ev1")
        );
    }

    #[test]
    fn event_message_reports_marshal_failure() {
        // JSON object keys must be strings
        let payload: BTreeMap<(u8, u8), u8> = BTreeMap::from([((1, 2), 3)]);
        assert!(OutboundMessage::event("ev1", &payload).is_err());
    }

    #[test]
    fn raw_message_display() {
        let message = RawMessage {
            id: "42".into(),
            data: vec![1, 2, 3],
            attributes: HashMap::from([("event".into(), "ev1".into())]),
            publish_time: Utc::now(),
        };

        let display = format!("{message}");
        assert!(display.contains("42"));
        assert!(display.contains("3 bytes"));
        assert_eq!(message.attribute("event"), Some("ev1"));
    }
}
