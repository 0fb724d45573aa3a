//! Delivery dispatch to handlers.
//!
//! [`ChannelService::receive`] pulls deliveries from a channel's subscription
//! and runs the handler for each one on its own task, with at most
//! `max_outstanding` handlers running at once. Handlers decide the outcome
//! through the [`Envelope`] they are given; the dispatcher never acks or nacks
//! on their behalf.

use crate::metrics::ChannelMetrics;
use crate::{ChannelService, Envelope};
use courier_core::error::translate_error;
use courier_core::transport::DeliveryStream;
use courier_core::{CancellationToken, Channel, ChannelError, TransportError};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

const RECEIVE_OPERATION: &str = "receive from subscription";

impl ChannelService {
    /// Run `handler` for every message delivered on `channel_id` until `ctx`
    /// is cancelled or the service is closed.
    ///
    /// Handlers run concurrently, each on its own task, and receive a clone
    /// of `ctx` together with the [`Envelope`]. When receiving stops, the call
    /// waits for in-flight handlers to finish before returning.
    ///
    /// # Returns
    ///
    /// `Ok(())` once `ctx` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] for unknown channels
    /// - [`ChannelError::NoSubscription`] for publish-only channels
    /// - [`ChannelError::Closed`] if the service is or becomes closed
    /// - [`ChannelError::Transport`] if the subscription fails or stops
    ///   delivering
    #[tracing::instrument(skip(self, ctx, handler), name = "receive")]
    pub async fn receive<F, Fut>(
        &self,
        ctx: &CancellationToken,
        channel_id: &str,
        handler: F,
    ) -> Result<(), ChannelError>
    where
        F: Fn(CancellationToken, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (channel, subscription_id) = self.subscribed_channel(channel_id)?;
        let mut deliveries = self.open_stream(channel, subscription_id).await?;

        tracing::info!(
            channel = channel_id,
            subscription = subscription_id,
            max_outstanding = self.inner.max_outstanding,
            "Receiving messages"
        );

        let handler = Arc::new(handler);
        let permits = Arc::new(Semaphore::new(self.inner.max_outstanding));
        let mut in_flight = JoinSet::new();
        let shutdown = &self.inner.shutdown;

        let outcome = 'receive: loop {
            tokio::select! {
                biased;

                () = ctx.cancelled() => break 'receive Ok(()),
                () = shutdown.cancelled() => break 'receive Err(ChannelError::Closed),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_handler_exit(channel_id, joined);
                }
                next = deliveries.next() => {
                    let delivery = match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(error)) => {
                            break 'receive Err(translate_error(error, RECEIVE_OPERATION, subscription_id));
                        }
                        None => break 'receive Err(self.stream_ended(subscription_id)),
                    };

                    let permit = tokio::select! {
                        biased;

                        () = ctx.cancelled() => break 'receive Ok(()),
                        () = shutdown.cancelled() => break 'receive Err(ChannelError::Closed),
                        permit = Arc::clone(&permits).acquire_owned() => permit,
                    };
                    let Ok(permit) = permit else {
                        break 'receive Err(ChannelError::Closed);
                    };

                    ChannelMetrics::record_receive(channel_id);
                    let envelope = Envelope::new(delivery, channel_id, &self.inner);
                    let handler = Arc::clone(&handler);
                    let ctx = ctx.clone();
                    in_flight.spawn(async move {
                        handler(ctx, envelope).await;
                        drop(permit);
                    });
                }
            }
        };

        drop(deliveries);

        let pending = in_flight.len();
        if pending > 0 {
            tracing::debug!(channel = channel_id, pending, "Waiting for in-flight handlers");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_handler_exit(channel_id, joined);
        }

        match &outcome {
            Ok(()) => tracing::info!(channel = channel_id, "Stopped receiving"),
            Err(error) => {
                tracing::warn!(channel = channel_id, error = %error, "Receiving stopped with error");
            }
        }
        outcome
    }

    /// Receive up to `count` messages from `channel_id`, acknowledging each
    /// one as it arrives.
    ///
    /// Meant for tests and tooling. Messages are acked on receipt, so a
    /// caller that fails to process them cannot get them redelivered.
    ///
    /// # Returns
    ///
    /// The collected envelopes, fewer than `count` if `ctx` was cancelled
    /// first.
    ///
    /// # Errors
    ///
    /// Same as [`receive`](Self::receive).
    pub async fn receive_n(
        &self,
        ctx: &CancellationToken,
        channel_id: &str,
        count: usize,
    ) -> Result<Vec<Envelope>, ChannelError> {
        let (channel, subscription_id) = self.subscribed_channel(channel_id)?;
        let mut envelopes = Vec::with_capacity(count);
        if count == 0 {
            return Ok(envelopes);
        }

        let mut deliveries = self.open_stream(channel, subscription_id).await?;
        let shutdown = &self.inner.shutdown;

        while envelopes.len() < count {
            tokio::select! {
                biased;

                () = ctx.cancelled() => break,
                () = shutdown.cancelled() => return Err(ChannelError::Closed),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        ChannelMetrics::record_receive(channel_id);
                        let envelope = Envelope::new(delivery, channel_id, &self.inner);
                        envelope.ack();
                        envelopes.push(envelope);
                    }
                    Some(Err(error)) => {
                        return Err(translate_error(error, RECEIVE_OPERATION, subscription_id));
                    }
                    None => return Err(self.stream_ended(subscription_id)),
                },
            }
        }

        tracing::debug!(channel = channel_id, received = envelopes.len(), "Collected messages");
        Ok(envelopes)
    }

    fn subscribed_channel<'a>(
        &'a self,
        channel_id: &str,
    ) -> Result<(&'a Channel, &'a str), ChannelError> {
        let channel = self.inner.registry.lookup(channel_id)?;
        let subscription_id = channel
            .subscription_id
            .as_deref()
            .ok_or_else(|| ChannelError::NoSubscription(channel_id.to_string()))?;
        self.inner.ensure_open()?;
        Ok((channel, subscription_id))
    }

    async fn open_stream(
        &self,
        channel: &Channel,
        subscription_id: &str,
    ) -> Result<DeliveryStream, ChannelError> {
        self.inner
            .transport
            .receive(&channel.topic_id, subscription_id)
            .await
            .map_err(|e| translate_error(e, RECEIVE_OPERATION, subscription_id))
    }

    fn stream_ended(&self, subscription_id: &str) -> ChannelError {
        if self.inner.is_closed() {
            return ChannelError::Closed;
        }
        translate_error(
            TransportError::Unavailable("delivery stream ended".to_string()),
            RECEIVE_OPERATION,
            subscription_id,
        )
    }
}

fn log_handler_exit(channel_id: &str, joined: Result<(), JoinError>) {
    if let Err(error) = joined {
        if error.is_panic() {
            tracing::error!(channel = channel_id, error = %error, "Message handler panicked");
        }
    }
}
