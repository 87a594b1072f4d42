//! Message broker seam.
//!
//! Named queues carrying opaque byte payloads. Delivery through a
//! `Subscription` is at-least-once: a `Delivery` that is dropped without
//! being acknowledged goes back to the head of its queue.

pub mod codec;
pub mod memory;

use crate::core::{FeedError, Result};
use async_trait::async_trait;
use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use codec::WireFormat;
pub use memory::InMemoryBroker;

/// Names of the queues the feed pipeline uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub feed_request: String,
    /// Base name; each feed service instance replies on `"{feed_response}.{instance}"`
    pub feed_response: String,
    /// Queue this node's feed service takes invalidation notices from
    pub cache_invalidate: String,
    /// Invalidation queues of every feed service instance. When set, each
    /// notice is published to all of them instead of `cache_invalidate`.
    pub invalidation_fanout: Vec<String>,
}

impl QueueNames {
    /// Queues an invalidation notice must reach
    pub fn invalidation_targets(&self) -> Vec<&str> {
        if self.invalidation_fanout.is_empty() {
            vec![self.cache_invalidate.as_str()]
        } else {
            self.invalidation_fanout.iter().map(String::as_str).collect()
        }
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            feed_request: "postRequestQueue".to_string(),
            feed_response: "postResponseQueue".to_string(),
            cache_invalidate: "cacheUpdateQueue".to_string(),
            invalidation_fanout: Vec::new(),
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a message to the tail of `queue`
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()>;

    /// Start consuming `queue`; deliveries must be acknowledged
    async fn subscribe(&self, queue: &str) -> Result<Subscription>;

    /// Take one message from `queue`, waiting up to `timeout`.
    ///
    /// The message counts as acknowledged once returned.
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// Puts an unacknowledged message back on its queue
pub trait Requeue: Send + Sync {
    fn requeue(&self, payload: Vec<u8>, redeliveries: u32);
}

/// One message handed to a subscriber
pub struct Delivery {
    queue: String,
    payload: Vec<u8>,
    redeliveries: u32,
    requeue: Option<Arc<dyn Requeue>>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        payload: Vec<u8>,
        redeliveries: u32,
        requeue: Arc<dyn Requeue>,
    ) -> Self {
        Self {
            queue: queue.into(),
            payload,
            redeliveries,
            requeue: Some(requeue),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// How many times this message was handed out before and not acknowledged
    pub fn redeliveries(&self) -> u32 {
        self.redeliveries
    }

    /// Remove the message from the queue for good
    pub fn ack(mut self) {
        self.requeue = None;
    }

    /// Return the message to the head of its queue
    pub fn nack(self) {
        drop(self);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(requeue) = self.requeue.take() {
            requeue.requeue(std::mem::take(&mut self.payload), self.redeliveries + 1);
        }
    }
}

/// Source of deliveries behind a `Subscription`
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. Fails with `BrokerUnavailable` once the
    /// broker connection is lost; the subscription is dead after that.
    async fn next_delivery(&mut self) -> Result<Delivery>;
}

/// Lazy, unbounded sequence of deliveries from one queue
pub struct Subscription {
    queue: String,
    inner: Box<dyn DeliveryStream>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, inner: Box<dyn DeliveryStream>) -> Self {
        Self {
            queue: queue.into(),
            inner,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn next(&mut self) -> Result<Delivery> {
        self.inner.next_delivery().await
    }

    /// Deliveries as a stream. The stream yields the error that ends the
    /// subscription and then finishes.
    pub fn into_stream(self) -> impl Stream<Item = Result<Delivery>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.next().await {
                Ok(delivery) => Some((Ok(delivery), Some(subscription))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

/// Retry and reconnect policy of a push consumer
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Handler failures tolerated per message before it is dropped
    pub max_redeliveries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Push every message of `queue` to `handler` until stopped.
///
/// A message is acknowledged when the handler succeeds. When it fails the
/// message is requeued, up to `max_redeliveries` times, then dropped. If the
/// broker goes away the consumer backs off and subscribes again instead of
/// exiting.
pub fn spawn_consumer<H, Fut>(
    broker: Arc<dyn MessageBroker>,
    queue: impl Into<String>,
    options: ConsumerOptions,
    handler: H,
) -> ConsumerHandle
where
    H: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let queue = queue.into();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        let mut backoff = options.initial_backoff;

        'reconnect: loop {
            let subscribed = tokio::select! {
                _ = &mut stop_rx => break 'reconnect,
                subscribed = broker.subscribe(&queue) => subscribed,
            };

            match subscribed {
                Ok(mut subscription) => {
                    debug!(queue = %queue, "consumer subscribed");
                    backoff = options.initial_backoff;

                    loop {
                        let next = tokio::select! {
                            _ = &mut stop_rx => break 'reconnect,
                            next = subscription.next() => next,
                        };
                        match next {
                            Ok(delivery) => dispatch(&handler, delivery, &options).await,
                            Err(err) => {
                                warn!(queue = %queue, error = %err, "consumer lost its subscription");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        queue = %queue,
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "consumer failed to subscribe"
                    );
                }
            }

            tokio::select! {
                _ = &mut stop_rx => break 'reconnect,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(options.max_backoff);
        }

        info!(queue = %queue, "consumer stopped");
    });

    ConsumerHandle {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

async fn dispatch<H, Fut>(handler: &H, delivery: Delivery, options: &ConsumerOptions)
where
    H: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match handler(delivery.payload().to_vec()).await {
        Ok(()) => delivery.ack(),
        Err(err) if delivery.redeliveries() < options.max_redeliveries => {
            warn!(
                queue = %delivery.queue(),
                redeliveries = delivery.redeliveries(),
                error = %err,
                "message handler failed; requeueing"
            );
            delivery.nack();
        }
        Err(err) => {
            error!(
                queue = %delivery.queue(),
                redeliveries = delivery.redeliveries(),
                error = %err,
                "message handler failed too many times; dropping message"
            );
            delivery.ack();
        }
    }
}

/// Handle to a background consumer task
pub struct ConsumerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Signals the consumer to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| FeedError::ExecutionError(format!("consumer join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
