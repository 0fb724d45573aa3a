//! # Courier Core
//!
//! Core traits and types for reliable message channels over a publish/subscribe
//! transport.
//!
//! This crate provides the pure, I/O-free building blocks that the runtime
//! crate wires together:
//!
//! ## Core Concepts
//!
//! - **Channel**: An application-level name bound to a transport topic and an
//!   optional subscription
//! - **Registry**: The immutable set of channels plus the optional dead-letter channel
//! - **Transport**: The publish/subscribe collaborator (topics, subscriptions,
//!   publish, receive, acknowledgement)
//! - **Retry decision**: Whether a failed message is redelivered or dead-lettered,
//!   based on its age
//! - **Dead-letter attributes**: Provenance attributes attached to dead-lettered copies
//!
//! ## Example
//!
//! ```
//! use courier_core::channel::{Channel, ChannelRegistry, DEFAULT_MAX_RETRY_AGE};
//!
//! let mut registry = ChannelRegistry::new();
//! registry.add_channel(Channel::new("orders", "order-events").with_subscription("order-worker"));
//! registry.set_dead_letter(Channel::new("", "dead-letter-events"));
//!
//! let orders = registry.lookup("orders").unwrap();
//! assert_eq!(orders.max_retry_age, DEFAULT_MAX_RETRY_AGE);
//! assert_eq!(registry.dead_letter().unwrap().id, "dead-letter");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Cooperative cancellation for receive loops
pub mod cancel;

/// Channels and the channel registry
pub mod channel;

/// Dead-letter provenance attributes and UTF-8 safe truncation
pub mod dead_letter;

/// Error types and transport error translation
pub mod error;

/// Inbound and outbound message types
pub mod message;

/// Age-based retry decision
pub mod retry_policy;

/// Transport abstraction for publish/subscribe backends
pub mod transport;

/// Environment module - Dependency injection traits
///
/// All time-dependent decisions (message age) go through the [`Clock`]
/// trait so tests can pin the current time.
///
/// [`Clock`]: environment::Clock
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use cancel::CancellationToken;
pub use channel::{Channel, ChannelRegistry};
pub use error::{ChannelError, TransportError, translate_error};
pub use message::{Delivery, OutboundMessage, RawMessage};
pub use transport::{Acknowledger, DeliveryStream, Transport};
