//! In-memory publish/subscribe emulator.
//!
//! [`InMemoryTransport`] behaves like a hosted publish/subscribe service with
//! a single connection:
//!
//! - topics and subscriptions are explicit resources that must be created
//! - publishing fans a message out to every subscription of the topic
//! - a NACK'ed delivery, or one dropped without a decision, is queued again
//! - after [`Transport::close`] every operation fails with
//!   [`TransportError::Cancelled`] and open delivery streams end
//!
//! It also records what happened (published messages, ACKs, NACKs) and can be
//! told to fail the next publish to a topic, which is what service tests
//! assert against.

use courier_core::environment::{Clock, SystemClock};
use courier_core::error::TransportError;
use courier_core::message::{Delivery, OutboundMessage, RawMessage};
use courier_core::transport::{Acknowledger, DeliveryStream, Transport, TransportFuture};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

const CLOSING: &str = "the client connection is closing";

/// In-memory transport for fast, deterministic tests.
///
/// Clones share the same state.
///
/// # Example
///
/// ```
/// use courier_core::message::OutboundMessage;
/// use courier_core::transport::Transport;
/// use courier_testing::InMemoryTransport;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = InMemoryTransport::new();
/// transport.create_topic("orders").await?;
/// transport.create_subscription("orders", "order-worker", Duration::from_secs(10)).await?;
///
/// transport.publish("orders", OutboundMessage::event("OrderPlaced", &1)?).await?;
///
/// assert_eq!(transport.published("orders").len(), 1);
/// assert_eq!(transport.backlog_len("order-worker"), Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct State {
    closed: bool,
    topics: BTreeSet<String>,
    subscriptions: HashMap<String, Subscription>,
    published: Vec<(String, RawMessage)>,
    next_id: u64,
    publish_failures: HashMap<String, VecDeque<TransportError>>,
    acked: Vec<String>,
    nacked: Vec<String>,
}

struct Subscription {
    topic_id: String,
    ack_deadline: Duration,
    backlog: VecDeque<RawMessage>,
    notify: Arc<Notify>,
}

enum Next {
    Ready(RawMessage),
    Empty,
    Closed,
    Gone,
}

impl InMemoryTransport {
    /// Create an empty transport stamping publish times with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty transport stamping publish times with `clock`.
    #[must_use]
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                clock: Arc::new(clock),
            }),
        }
    }

    /// Make the next publish to `topic_id` fail with `error`.
    ///
    /// Failures queue up: calling this twice fails the next two publishes.
    pub fn fail_next_publish(&self, topic_id: &str, error: TransportError) {
        self.inner
            .state()
            .publish_failures
            .entry(topic_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Every message successfully published to `topic_id`, oldest first.
    #[must_use]
    pub fn published(&self, topic_id: &str) -> Vec<RawMessage> {
        self.inner
            .state()
            .published
            .iter()
            .filter(|(topic, _)| topic == topic_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// IDs of ACK'ed deliveries, in acknowledgement order.
    #[must_use]
    pub fn acked(&self) -> Vec<String> {
        self.inner.state().acked.clone()
    }

    /// IDs of NACK'ed deliveries, in acknowledgement order.
    #[must_use]
    pub fn nacked(&self) -> Vec<String> {
        self.inner.state().nacked.clone()
    }

    /// Messages waiting for delivery on a subscription.
    #[must_use]
    pub fn backlog_len(&self, subscription_id: &str) -> Option<usize> {
        self.inner
            .state()
            .subscriptions
            .get(subscription_id)
            .map(|sub| sub.backlog.len())
    }

    /// Acknowledgement deadline a subscription was created with.
    #[must_use]
    pub fn ack_deadline(&self, subscription_id: &str) -> Option<Duration> {
        self.inner
            .state()
            .subscriptions
            .get(subscription_id)
            .map(|sub| sub.ack_deadline)
    }

    /// Whether the topic currently exists.
    #[must_use]
    pub fn has_topic(&self, topic_id: &str) -> bool {
        self.inner.state().topics.contains(topic_id)
    }

    /// Whether the subscription currently exists.
    #[must_use]
    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        self.inner.state().subscriptions.contains_key(subscription_id)
    }

    /// Whether [`Transport::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("InMemoryTransport")
            .field("closed", &state.closed)
            .field("topics", &state.topics)
            .field("subscriptions", &state.subscriptions.len())
            .field("published", &state.published.len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, State>, TransportError> {
        let state = self.state();
        if state.closed {
            return Err(TransportError::Cancelled(CLOSING.to_string()));
        }
        Ok(state)
    }

    fn next_delivery(&self, subscription_id: &str) -> Next {
        let mut state = self.state();
        if state.closed {
            return Next::Closed;
        }
        match state.subscriptions.get_mut(subscription_id) {
            None => Next::Gone,
            Some(sub) => sub.backlog.pop_front().map_or(Next::Empty, Next::Ready),
        }
    }

    fn record_ack(&self, message_id: &str) {
        let mut state = self.state();
        if !state.closed {
            state.acked.push(message_id.to_string());
        }
    }

    fn redeliver(&self, subscription_id: &str, message: RawMessage, nacked: bool) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        if nacked {
            state.nacked.push(message.id.clone());
        }
        if let Some(sub) = state.subscriptions.get_mut(subscription_id) {
            sub.backlog.push_back(message);
            sub.notify.notify_waiters();
        }
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    subscription_id: String,
    message: RawMessage,
    done: AtomicBool,
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.inner.record_ack(&self.message.id);
        }
    }

    fn nack(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.inner
                .redeliver(&self.subscription_id, self.message.clone(), true);
        }
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        // An undecided delivery behaves like an expired ack deadline
        if !self.done.swap(true, Ordering::SeqCst) {
            self.inner
                .redeliver(&self.subscription_id, self.message.clone(), false);
        }
    }
}

impl Transport for InMemoryTransport {
    fn topic_exists<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, bool> {
        Box::pin(async move { Ok(self.inner.open_state()?.topics.contains(topic_id)) })
    }

    fn create_topic<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.open_state()?;
            if !state.topics.insert(topic_id.to_string()) {
                return Err(TransportError::AlreadyExists(format!("topic {topic_id}")));
            }
            Ok(())
        })
    }

    fn delete_topic<'a>(&'a self, topic_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.open_state()?;
            if !state.topics.remove(topic_id) {
                return Err(TransportError::NotFound(format!("topic {topic_id}")));
            }
            Ok(())
        })
    }

    fn subscription_exists<'a>(&'a self, subscription_id: &'a str) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .inner
                .open_state()?
                .subscriptions
                .contains_key(subscription_id))
        })
    }

    fn create_subscription<'a>(
        &'a self,
        topic_id: &'a str,
        subscription_id: &'a str,
        ack_deadline: Duration,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.open_state()?;
            if !state.topics.contains(topic_id) {
                return Err(TransportError::NotFound(format!("topic {topic_id}")));
            }
            if state.subscriptions.contains_key(subscription_id) {
                return Err(TransportError::AlreadyExists(format!(
                    "subscription {subscription_id}"
                )));
            }
            state.subscriptions.insert(
                subscription_id.to_string(),
                Subscription {
                    topic_id: topic_id.to_string(),
                    ack_deadline,
                    backlog: VecDeque::new(),
                    notify: Arc::new(Notify::new()),
                },
            );
            Ok(())
        })
    }

    fn delete_subscription<'a>(&'a self, subscription_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.open_state()?;
            let Some(sub) = state.subscriptions.remove(subscription_id) else {
                return Err(TransportError::NotFound(format!(
                    "subscription {subscription_id}"
                )));
            };
            sub.notify.notify_waiters();
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        topic_id: &'a str,
        message: OutboundMessage,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let publish_time = self.inner.clock.now();
            let mut state = self.inner.open_state()?;

            if let Some(error) = state
                .publish_failures
                .get_mut(topic_id)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            if !state.topics.contains(topic_id) {
                return Err(TransportError::NotFound(format!("topic {topic_id}")));
            }

            state.next_id += 1;
            let raw = RawMessage {
                id: state.next_id.to_string(),
                data: message.data,
                attributes: message.attributes,
                publish_time,
            };

            for sub in state
                .subscriptions
                .values_mut()
                .filter(|sub| sub.topic_id == topic_id)
            {
                sub.backlog.push_back(raw.clone());
                sub.notify.notify_waiters();
            }

            tracing::trace!(topic = %topic_id, message_id = %raw.id, "Published in-memory message");
            let id = raw.id.clone();
            state.published.push((topic_id.to_string(), raw));
            Ok(id)
        })
    }

    fn receive<'a>(
        &'a self,
        topic_id: &'a str,
        subscription_id: &'a str,
    ) -> TransportFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let notify = {
                let state = self.inner.open_state()?;
                match state.subscriptions.get(subscription_id) {
                    Some(sub) if sub.topic_id == topic_id => Arc::clone(&sub.notify),
                    _ => {
                        return Err(TransportError::NotFound(format!(
                            "subscription {subscription_id} on topic {topic_id}"
                        )));
                    },
                }
            };

            let inner = Arc::clone(&self.inner);
            let subscription_id = subscription_id.to_string();

            let stream = async_stream::stream! {
                loop {
                    // Register interest before looking, so a publish between the
                    // check and the wait is not missed.
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    match inner.next_delivery(&subscription_id) {
                        Next::Ready(message) => {
                            let acker = InMemoryAcker {
                                inner: Arc::clone(&inner),
                                subscription_id: subscription_id.clone(),
                                message: message.clone(),
                                done: AtomicBool::new(false),
                            };
                            yield Ok(Delivery::new(message, Box::new(acker)));
                        },
                        Next::Empty => notified.await,
                        Next::Closed => {
                            yield Err(TransportError::Cancelled(CLOSING.to_string()));
                            break;
                        },
                        Next::Gone => {
                            yield Err(TransportError::NotFound(format!("subscription {subscription_id}")));
                            break;
                        },
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.inner.state();
            if state.closed {
                return Err(TransportError::Cancelled(CLOSING.to_string()));
            }
            state.closed = true;
            for sub in state.subscriptions.values() {
                sub.notify.notify_waiters();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::test_clock;
    use futures::StreamExt;

    async fn transport_with_subscription() -> InMemoryTransport {
        let transport = InMemoryTransport::with_clock(test_clock());
        assert!(transport.create_topic("topic").await.is_ok());
        assert!(
            transport
                .create_subscription("topic", "sub", Duration::from_secs(10))
                .await
                .is_ok()
        );
        transport
    }

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let transport = transport_with_subscription().await;

        let topic = transport.create_topic("topic").await;
        let sub = transport
            .create_subscription("topic", "sub", Duration::from_secs(10))
            .await;

        assert!(matches!(topic, Err(TransportError::AlreadyExists(_))));
        assert!(matches!(sub, Err(TransportError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn subscription_requires_topic() {
        let transport = InMemoryTransport::new();
        let result = transport
            .create_subscription("missing", "sub", Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(TransportError::NotFound(_))));
    }

    #[tokio::test]
    async fn publish_assigns_ids_and_publish_time() {
        let transport = transport_with_subscription().await;

        let first = transport.publish("topic", OutboundMessage::default()).await;
        let second = transport.publish("topic", OutboundMessage::default()).await;

        assert_eq!(first.ok().as_deref(), Some("1"));
        assert_eq!(second.ok().as_deref(), Some("2"));
        let published = transport.published("topic");
        assert!(published.iter().all(|m| m.publish_time == test_clock().now()));
    }

    #[tokio::test]
    async fn nack_redelivers_and_ack_does_not() {
        let transport = transport_with_subscription().await;
        assert!(transport.publish("topic", OutboundMessage::default()).await.is_ok());

        let Ok(mut stream) = transport.receive("topic", "sub").await else {
            unreachable!("subscription exists");
        };

        let first = stream.next().await;
        let Some(Ok(delivery)) = first else {
            unreachable!("one message is queued");
        };
        delivery.acker.nack();
        assert_eq!(transport.nacked(), vec!["1".to_string()]);

        let again = stream.next().await;
        let Some(Ok(delivery)) = again else {
            unreachable!("nacked message is queued again");
        };
        assert_eq!(delivery.message.id, "1");
        delivery.acker.ack();
        delivery.acker.nack(); // ignored

        assert_eq!(transport.acked(), vec!["1".to_string()]);
        assert_eq!(transport.backlog_len("sub"), Some(0));
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let transport = transport_with_subscription().await;
        assert!(transport.publish("topic", OutboundMessage::default()).await.is_ok());

        let Ok(mut stream) = transport.receive("topic", "sub").await else {
            unreachable!("subscription exists");
        };
        drop(stream.next().await);

        assert_eq!(transport.backlog_len("sub"), Some(1));
        assert!(transport.nacked().is_empty());
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_operations() {
        let transport = transport_with_subscription().await;
        let Ok(mut stream) = transport.receive("topic", "sub").await else {
            unreachable!("subscription exists");
        };

        let waiter = tokio::spawn(async move { stream.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(transport.close().await.is_ok());
        let next = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(next, Ok(Ok(Some(Err(TransportError::Cancelled(_)))))));

        assert!(matches!(
            transport.topic_exists("topic").await,
            Err(TransportError::Cancelled(_))
        ));
        assert!(matches!(transport.close().await, Err(TransportError::Cancelled(_))));
    }

    #[tokio::test]
    async fn injected_publish_failure_is_returned_once() {
        let transport = transport_with_subscription().await;
        transport.fail_next_publish("topic", TransportError::Backend("boom".into()));

        let failed = transport.publish("topic", OutboundMessage::default()).await;
        let succeeded = transport.publish("topic", OutboundMessage::default()).await;

        assert!(matches!(failed, Err(TransportError::Backend(_))));
        assert!(succeeded.is_ok());
        assert_eq!(transport.published("topic").len(), 1);
    }
}
