//! Courier Worker
//!
//! Example process consuming one channel from Redpanda.
//!
//! This binary:
//! - Reconciles the channel and dead-letter topology (retrying while the
//!   broker comes up)
//! - Consumes events, acking the ones it handles
//! - Nacks transient failures and dead-letters messages it can never handle
//! - Shuts down gracefully on Ctrl+C
//!
//! # Usage
//!
//! ```bash
//! # Start a broker
//! docker run -d -p 9092:9092 redpandadata/redpanda redpanda start --overprovisioned
//!
//! # Run the worker
//! cargo run -p courier-worker
//! ```

mod config;

use config::WorkerConfig;
use courier_core::{CancellationToken, Channel};
use courier_redpanda::RedpandaTransport;
use courier_runtime::metrics::MetricsExporter;
use courier_runtime::{AppEnv, BackoffPolicy, ChannelService, Envelope};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CHANNEL: &str = "orders";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier=debug,rdkafka=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(
        brokers = %config.brokers,
        topic = %config.channel.topic,
        subscription = %config.channel.subscription,
        "Configuration loaded"
    );

    let mut metrics = MetricsExporter::new();
    metrics.install()?;

    let transport = RedpandaTransport::builder()
        .brokers(&config.brokers)
        .partitions(config.partitions)
        .build()?;

    let service = ChannelService::builder()
        .channel(
            Channel::new(CHANNEL, &config.channel.topic)
                .with_subscription(&config.channel.subscription)
                .with_max_retry_age(config.max_retry_age),
        )
        .dead_letter(
            Channel::new("", &config.dead_letter.topic)
                .with_subscription(&config.dead_letter.subscription),
        )
        .max_outstanding(config.max_outstanding)
        .build(transport);

    let mut env = AppEnv::new().with_init_policy(
        BackoffPolicy::builder()
            .max_retries(10)
            .initial_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(10))
            .build(),
    );
    env.add_service(Arc::new(service.clone()));
    env.init().await?;

    let ctx = CancellationToken::new();
    let mut receiver = {
        let service = service.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { service.receive(&ctx, CHANNEL, handle).await })
    };

    tracing::info!("Worker is running, press Ctrl+C to shutdown");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down gracefully...");
            ctx.cancel();
            match tokio::time::timeout(config.shutdown_timeout, &mut receiver).await {
                Ok(joined) => joined??,
                Err(_) => {
                    tracing::warn!("In-flight handlers did not finish in time");
                    receiver.abort();
                }
            }
        }
        joined = &mut receiver => {
            if let Err(error) = joined? {
                tracing::error!(error = %error, "Receive loop stopped");
            }
        }
    }

    env.close().await?;

    if let Some(snapshot) = metrics.render() {
        tracing::debug!(metrics = %snapshot, "Final metrics");
    }
    Ok(())
}

/// Handle one order event.
///
/// Messages that are not JSON can never succeed and go straight to the
/// dead-letter channel. Events flagged `"transient": true` simulate a
/// downstream outage and are retried until they exceed the retry age.
async fn handle(_ctx: CancellationToken, envelope: Envelope) {
    let event: serde_json::Value = match envelope.payload() {
        Ok(event) => event,
        Err(error) => {
            envelope.try_dead_letter(&error).await;
            return;
        }
    };

    let name = envelope.attribute("event").unwrap_or("unknown");
    if event.get("transient").and_then(serde_json::Value::as_bool) == Some(true) {
        envelope
            .try_retryable_error(format!("downstream unavailable while handling {name}"))
            .await;
        return;
    }

    tracing::info!(message_id = envelope.id(), event = name, payload = %event, "Handled event");
    envelope.ack();
}
