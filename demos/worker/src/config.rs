//! Configuration for the worker.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Partitions of topics the worker creates
    pub partitions: i32,
    /// Channel the worker consumes
    pub channel: ChannelConfig,
    /// Dead-letter channel
    pub dead_letter: ChannelConfig,
    /// Retry age after which failing messages are dead-lettered
    pub max_retry_age: Duration,
    /// Maximum handler invocations in flight
    pub max_outstanding: usize,
    /// Grace period for in-flight handlers on shutdown
    pub shutdown_timeout: Duration,
}

/// Topic and subscription of one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Topic ID
    pub topic: String,
    /// Subscription ID
    pub subscription: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparseable variables fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            brokers: env::var("COURIER_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
            partitions: parse_or("COURIER_PARTITIONS", 3),
            channel: ChannelConfig {
                topic: env::var("COURIER_TOPIC").unwrap_or_else(|_| "order-events".to_string()),
                subscription: env::var("COURIER_SUBSCRIPTION")
                    .unwrap_or_else(|_| "order-worker".to_string()),
            },
            dead_letter: ChannelConfig {
                topic: env::var("COURIER_DEAD_LETTER_TOPIC")
                    .unwrap_or_else(|_| "dead-letter-events".to_string()),
                subscription: env::var("COURIER_DEAD_LETTER_SUBSCRIPTION")
                    .unwrap_or_else(|_| "dead-letter-audit".to_string()),
            },
            max_retry_age: Duration::from_secs(parse_or("COURIER_MAX_RETRY_AGE_SECS", 120)),
            max_outstanding: parse_or("COURIER_MAX_OUTSTANDING", 100),
            shutdown_timeout: Duration::from_secs(parse_or("COURIER_SHUTDOWN_TIMEOUT_SECS", 30)),
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
