use super::{Delivery, DeliveryStream, MessageBroker, Requeue, Subscription};
use crate::core::{FeedError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

struct Envelope {
    payload: Vec<u8>,
    redeliveries: u32,
}

struct QueueState {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    published: AtomicU64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            published: AtomicU64::new(0),
        }
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, envelope: Envelope) {
        self.messages().push_back(envelope);
        self.notify.notify_one();
    }

    /// Wait for the head of the queue. Fails as soon as the broker is offline.
    async fn pop_wait(&self, broker: &BrokerShared) -> Result<Envelope> {
        loop {
            // Registered before checking so a concurrent push or outage is not missed
            let notified = self.notify.notified();
            broker.ensure_online()?;
            if let Some(envelope) = self.messages().pop_front() {
                return Ok(envelope);
            }
            notified.await;
        }
    }
}

impl Requeue for QueueState {
    fn requeue(&self, payload: Vec<u8>, redeliveries: u32) {
        self.messages().push_front(Envelope {
            payload,
            redeliveries,
        });
        self.notify.notify_one();
    }
}

struct BrokerShared {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    online: AtomicBool,
}

impl BrokerShared {
    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FeedError::BrokerUnavailable(
                "in-memory broker is offline".to_string(),
            ))
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(QueueState::new())),
        )
    }
}

/// Process-local broker with FIFO named queues
///
/// Queues are created on first use and competing subscribers on one queue
/// share its messages. `set_online(false)` simulates a lost broker
/// connection: every operation fails with `BrokerUnavailable` and live
/// subscriptions end, while queued messages are kept.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                queues: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
            }),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Release);
        if !online {
            let queues = self
                .shared
                .queues
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for queue in queues.values() {
                queue.notify.notify_waiters();
            }
        }
        info!(online, "in-memory broker connectivity changed");
    }

    /// Messages waiting in `queue`
    pub fn depth(&self, queue: &str) -> usize {
        self.shared.queue(queue).messages().len()
    }

    /// Messages ever published to `queue`, redeliveries excluded
    pub fn published_count(&self, queue: &str) -> u64 {
        self.shared.queue(queue).published.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        self.shared.ensure_online()?;
        let state = self.shared.queue(queue);
        state.published.fetch_add(1, Ordering::Relaxed);
        state.push(Envelope {
            payload,
            redeliveries: 0,
        });
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription> {
        self.shared.ensure_online()?;
        let stream = MemoryDeliveryStream {
            name: queue.to_string(),
            queue: self.shared.queue(queue),
            broker: Arc::clone(&self.shared),
        };
        Ok(Subscription::new(queue, Box::new(stream)))
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.shared.ensure_online()?;
        let state = self.shared.queue(queue);
        match tokio::time::timeout(timeout, state.pop_wait(&self.shared)).await {
            Ok(envelope) => envelope.map(|envelope| Some(envelope.payload)),
            Err(_) => Ok(None),
        }
    }
}

struct MemoryDeliveryStream {
    name: String,
    queue: Arc<QueueState>,
    broker: Arc<BrokerShared>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Result<Delivery> {
        let envelope = self.queue.pop_wait(&self.broker).await?;
        let requeue: Arc<dyn Requeue> = self.queue.clone();
        Ok(Delivery::new(
            self.name.clone(),
            envelope.payload,
            envelope.redeliveries,
            requeue,
        ))
    }
}
