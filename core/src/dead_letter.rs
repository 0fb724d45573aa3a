//! Dead-letter provenance attributes.
//!
//! A dead-lettered message is republished to the dead-letter topic with its
//! original data and attributes, plus attributes describing where it came from
//! and why it failed. The attribute names are part of the wire format shared
//! with downstream consumers:
//!
//! | attribute | value |
//! |---|---|
//! | `originalMessageID` | ID of the failed message |
//! | `originalTopicID` | topic of the source channel |
//! | `originalSubscriptionID` | subscription of the source channel, `""` if none |
//! | `error` | failure text, at most [`MAX_ERROR_ATTRIBUTE_BYTES`] bytes |
//! | `deadLetterCount` | `"1"`, incremented each time the same message is dead-lettered again |

use crate::channel::Channel;
use crate::message::RawMessage;
use std::collections::HashMap;

/// ID of the message that was dead-lettered.
pub const ORIGINAL_MESSAGE_ID: &str = "originalMessageID";

/// Topic the dead-lettered message was originally received from.
pub const ORIGINAL_TOPIC_ID: &str = "originalTopicID";

/// Subscription the dead-lettered message was originally received from.
pub const ORIGINAL_SUBSCRIPTION_ID: &str = "originalSubscriptionID";

/// Failure description.
pub const ERROR: &str = "error";

/// Number of times the message has been dead-lettered.
pub const DEAD_LETTER_COUNT: &str = "deadLetterCount";

/// Attribute values are limited to 1024 bytes by the transport.
pub const MAX_ERROR_ATTRIBUTE_BYTES: usize = 1024;

/// Truncate `s` to at most `max_bytes` bytes without splitting a code point.
///
/// The cut moves backwards from `max_bytes` to the closest character boundary,
/// so the result is always the longest valid prefix that fits.
///
/// # Example
///
/// ```
/// use courier_core::dead_letter::truncate_utf8;
///
/// assert_eq!(truncate_utf8("日本語", 2), "");
/// assert_eq!(truncate_utf8("日本語", 4), "日");
/// assert_eq!(truncate_utf8("日本語", 6), "日本");
/// assert_eq!(truncate_utf8("abc", 10), "abc");
/// ```
#[must_use]
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Next value of the `deadLetterCount` attribute.
///
/// A present, base-10 parseable count is incremented; anything else starts
/// at `"1"`.
#[must_use]
pub fn next_dead_letter_count(current: Option<&str>) -> String {
    current
        .and_then(|value| value.parse::<i64>().ok())
        .map_or_else(|| "1".to_string(), |count| count.saturating_add(1).to_string())
}

/// Build the attributes of the dead-letter copy of `message`.
///
/// The original attributes are cloned; `message` itself is never modified, so
/// concurrent routes of different messages never share a map.
#[must_use]
pub fn dead_letter_attributes(
    message: &RawMessage,
    source: &Channel,
    cause: &str,
) -> HashMap<String, String> {
    let mut attributes = message.attributes.clone();

    attributes.insert(ORIGINAL_MESSAGE_ID.to_string(), message.id.clone());
    attributes.insert(ORIGINAL_TOPIC_ID.to_string(), source.topic_id.clone());
    attributes.insert(
        ORIGINAL_SUBSCRIPTION_ID.to_string(),
        source.subscription_or_empty().to_string(),
    );
    attributes.insert(
        ERROR.to_string(),
        truncate_utf8(cause, MAX_ERROR_ATTRIBUTE_BYTES).to_string(),
    );

    let count = next_dead_letter_count(attributes.get(DEAD_LETTER_COUNT).map(String::as_str));
    attributes.insert(DEAD_LETTER_COUNT.to_string(), count);

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn message(attributes: &[(&str, &str)]) -> RawMessage {
        RawMessage {
            id: "msg-1".into(),
            data: b"\"test message\"".to_vec(),
            attributes: attributes
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            publish_time: Utc::now(),
        }
    }

    #[test]
    fn truncation_never_splits_a_code_point() {
        let cases = [
            (0, ""),
            (1, ""),
            (2, ""),
            (3, "日"),
            (4, "日"),
            (5, "日"),
            (6, "日本"),
            (9, "日本語"),
        ];
        for (max, expected) in cases {
            assert_eq!(truncate_utf8("日本語", max), expected, "max_bytes = {max}");
        }
    }

    #[test]
    fn count_starts_at_one_and_increments() {
        assert_eq!(next_dead_letter_count(None), "1");
        assert_eq!(next_dead_letter_count(Some("1")), "2");
        assert_eq!(next_dead_letter_count(Some("41")), "42");
        assert_eq!(next_dead_letter_count(Some("not-a-number")), "1");
    }

    #[test]
    fn attributes_carry_provenance() {
        let source = Channel::new("test-channel", "test-topic").with_subscription("test-subscription");
        let original = message(&[("event", "ev1")]);

        let attributes = dead_letter_attributes(&original, &source, "test error");

        assert_eq!(attributes["event"], "ev1");
        assert_eq!(attributes[ORIGINAL_MESSAGE_ID], "msg-1");
        assert_eq!(attributes[ORIGINAL_TOPIC_ID], "test-topic");
        assert_eq!(attributes[ORIGINAL_SUBSCRIPTION_ID], "test-subscription");
        assert_eq!(attributes[ERROR], "test error");
        assert_eq!(attributes[DEAD_LETTER_COUNT], "1");
        // The original is untouched
        assert_eq!(original.attributes.len(), 1);
    }

    #[test]
    fn attributes_for_publish_only_source_have_empty_subscription() {
        let source = Channel::new("audit", "audit-topic");
        let attributes = dead_letter_attributes(&message(&[]), &source, "boom");
        assert_eq!(attributes[ORIGINAL_SUBSCRIPTION_ID], "");
    }

    #[test]
    fn second_dead_letter_increments_count_and_replaces_error() {
        let source = Channel::new("dead-letter", "dead-letter-topic");
        let once = message(&[(DEAD_LETTER_COUNT, "1"), (ERROR, "test error")]);

        let attributes = dead_letter_attributes(&once, &source, "test error 2");

        assert_eq!(attributes[DEAD_LETTER_COUNT], "2");
        assert_eq!(attributes[ERROR], "test error 2");
    }

    #[test]
    fn long_errors_are_truncated_to_attribute_limit() {
        let source = Channel::new("c", "t");
        let cause = "é".repeat(600); // 1200 bytes, 2 bytes per char
        let attributes = dead_letter_attributes(&message(&[]), &source, &cause);
        assert_eq!(attributes[ERROR].len(), 1024);
    }

    proptest! {
        #[test]
        fn truncation_is_longest_fitting_prefix(s in "\\PC{0,64}", max in 0_usize..300) {
            let truncated = truncate_utf8(&s, max);

            prop_assert!(truncated.len() <= max);
            prop_assert!(s.starts_with(truncated));
            // Adding the next character would exceed the limit
            if let Some(next) = s[truncated.len()..].chars().next() {
                prop_assert!(truncated.len() + next.len_utf8() > max);
            }
        }
    }
}
