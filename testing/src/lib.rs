//! # Courier Testing
//!
//! Testing utilities for Courier message channels.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryTransport`]: a publish/subscribe emulator implementing
//!   [`Transport`](courier_core::transport::Transport)
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{InMemoryTransport, ManualClock, test_clock};
//! use courier_runtime::ChannelService;
//!
//! #[tokio::test]
//! async fn dead_letters_old_messages() {
//!     let clock = ManualClock::new(test_clock().now());
//!     let transport = InMemoryTransport::with_clock(clock.clone());
//!     let service = ChannelService::builder()
//!         .channel(Channel::new("orders", "order-events").with_subscription("order-worker"))
//!         .clock(clock.clone())
//!         .build(transport.clone());
//!
//!     service.reconcile_all().await?;
//!     // publish, advance the clock, receive, fail...
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

/// In-memory publish/subscribe emulator
pub mod transport;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the
    /// transport (publish times) and another to the service (message age),
    /// then advance both at once.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::ManualClock;
    /// use courier_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::new(chrono::Utc::now());
    /// let start = clock.now();
    /// clock.advance(Duration::from_secs(121));
    /// assert_eq!((clock.now() - start).num_seconds(), 121);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = time.checked_add_signed(by).unwrap_or(*time);
        }

        /// Set the clock to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use transport::InMemoryTransport;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(test_clock().now());
        let other = clock.clone();

        clock.advance(Duration::from_secs(60));

        assert_eq!(other.now(), clock.now());
        assert_eq!((other.now() - test_clock().now()).num_seconds(), 60);
    }
}
