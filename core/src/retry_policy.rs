//! Age-based retry decision for failed messages.
//!
//! When a handler fails with a recoverable error, the message is either NACK'ed
//! (the transport redelivers it) or dead-lettered. The decision depends only on
//! how long ago the message was first published:
//!
//! ```text
//! age = now - publish_time
//!
//! age <= max_retry_age  ──►  Redeliver   (NACK)
//! age >  max_retry_age  ──►  DeadLetter  (republish + ACK)
//! ```
//!
//! The bound keeps retry amplification in check: a message that keeps failing
//! leaves the normal retry path after `max_retry_age`, regardless of how long
//! the transport would keep redelivering it.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of evaluating a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// NACK and let the transport redeliver.
    Redeliver,
    /// Route to the dead-letter channel.
    DeadLetter,
}

impl RetryDecision {
    /// Decide what to do with a message published at `publish_time`.
    ///
    /// A publish time in the future (clock skew) counts as age zero.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_core::retry_policy::RetryDecision;
    /// use chrono::{Duration as ChronoDuration, Utc};
    /// use std::time::Duration;
    ///
    /// let now = Utc::now();
    /// let max_age = Duration::from_secs(120);
    ///
    /// let fresh = now - ChronoDuration::seconds(119);
    /// assert_eq!(RetryDecision::evaluate(fresh, now, max_age), RetryDecision::Redeliver);
    ///
    /// let stale = now - ChronoDuration::seconds(121);
    /// assert_eq!(RetryDecision::evaluate(stale, now, max_age), RetryDecision::DeadLetter);
    /// ```
    #[must_use]
    pub fn evaluate(
        publish_time: DateTime<Utc>,
        now: DateTime<Utc>,
        max_retry_age: Duration,
    ) -> Self {
        let age = (now - publish_time).to_std().unwrap_or(Duration::ZERO);
        if age > max_retry_age {
            Self::DeadLetter
        } else {
            Self::Redeliver
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    #[test]
    fn age_equal_to_max_is_redelivered() {
        let now = base_time();
        let published = now - chrono::Duration::seconds(120);
        assert_eq!(
            RetryDecision::evaluate(published, now, Duration::from_secs(120)),
            RetryDecision::Redeliver
        );
    }

    #[test]
    fn one_millisecond_past_max_is_dead_lettered() {
        let now = base_time();
        let published = now - chrono::Duration::milliseconds(120_001);
        assert_eq!(
            RetryDecision::evaluate(published, now, Duration::from_secs(120)),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn future_publish_time_is_redelivered() {
        let now = base_time();
        let published = now + chrono::Duration::seconds(30);
        assert_eq!(
            RetryDecision::evaluate(published, now, Duration::ZERO),
            RetryDecision::Redeliver
        );
    }

    proptest! {
        #[test]
        fn decision_matches_age_comparison(age_ms in 0_i64..1_000_000, max_ms in 0_u64..1_000_000) {
            let now = base_time();
            let published = now - chrono::Duration::milliseconds(age_ms);
            let decision = RetryDecision::evaluate(published, now, Duration::from_millis(max_ms));

            #[allow(clippy::cast_sign_loss)] // age_ms is non-negative
            let expected = if age_ms as u64 > max_ms {
                RetryDecision::DeadLetter
            } else {
                RetryDecision::Redeliver
            };
            prop_assert_eq!(decision, expected);
        }
    }
}
