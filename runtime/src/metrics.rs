//! Prometheus metrics for channel traffic.
//!
//! Every counter is labelled with the `channel` it concerns:
//! - Publishes and publish failures
//! - Deliveries handed to handlers
//! - Acks, nacks and dead-letter routes
//! - Bootstrap retries
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // ... run the channel service ...
//!
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the process.
///
/// Installs the global recorder once and renders the text exposition format
/// on demand.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all channel metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves the exporter without a handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder hasn't been installed by this exporter.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "channel_messages_published_total",
        "Total number of messages published to a channel"
    );
    describe_counter!(
        "channel_publish_errors_total",
        "Total number of failed publishes"
    );
    describe_histogram!(
        "channel_publish_duration_seconds",
        "Time taken to publish a message"
    );
    describe_counter!(
        "channel_messages_received_total",
        "Total number of deliveries handed to handlers"
    );
    describe_counter!(
        "channel_messages_acked_total",
        "Total number of acknowledged messages"
    );
    describe_counter!(
        "channel_messages_nacked_total",
        "Total number of messages returned for redelivery"
    );
    describe_counter!(
        "channel_messages_dead_lettered_total",
        "Total number of messages routed to the dead-letter channel"
    );
    describe_counter!(
        "channel_dead_letter_errors_total",
        "Total number of failed dead-letter routes"
    );

    describe_counter!("bootstrap_retry_attempts_total", "Total number of bootstrap retry attempts");
    describe_counter!(
        "bootstrap_retry_successes_total",
        "Total number of operations that succeeded after a retry"
    );
    describe_counter!(
        "bootstrap_retry_exhausted_total",
        "Total number of operations that exhausted max retries"
    );
}

/// Channel traffic metrics recorder.
pub struct ChannelMetrics;

impl ChannelMetrics {
    /// Record a successful publish.
    pub fn record_publish(channel: &str, duration: Duration) {
        counter!("channel_messages_published_total", "channel" => channel.to_owned()).increment(1);
        histogram!("channel_publish_duration_seconds", "channel" => channel.to_owned())
            .record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_publish_error(channel: &str) {
        counter!("channel_publish_errors_total", "channel" => channel.to_owned()).increment(1);
    }

    /// Record a delivery handed to a handler.
    pub fn record_receive(channel: &str) {
        counter!("channel_messages_received_total", "channel" => channel.to_owned()).increment(1);
    }

    /// Record an ack.
    pub fn record_ack(channel: &str) {
        counter!("channel_messages_acked_total", "channel" => channel.to_owned()).increment(1);
    }

    /// Record a nack.
    pub fn record_nack(channel: &str) {
        counter!("channel_messages_nacked_total", "channel" => channel.to_owned()).increment(1);
    }

    /// Record a successful dead-letter route.
    pub fn record_dead_letter(channel: &str) {
        counter!("channel_messages_dead_lettered_total", "channel" => channel.to_owned())
            .increment(1);
    }

    /// Record a failed dead-letter route.
    pub fn record_dead_letter_error(channel: &str) {
        counter!("channel_dead_letter_errors_total", "channel" => channel.to_owned()).increment(1);
    }
}

/// Bootstrap retry metrics recorder.
pub struct BackoffMetrics;

impl BackoffMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("bootstrap_retry_attempts_total").increment(1);
    }

    /// Record an operation that succeeded after retrying.
    pub fn record_success() {
        counter!("bootstrap_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("bootstrap_retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn exporter_starts_without_handle() {
        let exporter = MetricsExporter::new();
        assert!(exporter.handle().is_none());
        assert!(exporter.render().is_none());
    }

    #[test]
    fn exporter_renders_channel_counters() {
        let mut exporter = MetricsExporter::new();
        exporter.install().expect("install should succeed or be skipped");

        ChannelMetrics::record_publish("orders", Duration::from_millis(5));
        ChannelMetrics::record_dead_letter("orders");

        // Another test may have installed the recorder first
        if let Some(rendered) = exporter.render() {
            assert!(rendered.contains("channel_messages_published_total"));
            assert!(rendered.contains("channel=\"orders\""));
        }
    }
}
