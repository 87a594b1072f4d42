use super::cache::{CacheStats, FeedCache};
use super::message::{CacheInvalidation, FeedRequest, FeedResponse, FeedStatus};
use crate::broker::{ConsumerHandle, ConsumerOptions, MessageBroker, QueueNames, WireFormat, spawn_consumer};
use crate::core::{FeedError, Result, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FeedServiceOptions {
    /// Suffix of this instance's reply queue
    pub instance: String,
    pub response_timeout: Duration,
    pub max_page_size: u32,
    pub consumer: ConsumerOptions,
}

impl Default for FeedServiceOptions {
    fn default() -> Self {
        Self {
            instance: Uuid::new_v4().simple().to_string(),
            response_timeout: Duration::from_secs(5),
            max_page_size: 500,
            consumer: ConsumerOptions::default(),
        }
    }
}

/// A caller waiting for its feed response
struct PendingRequest {
    user_id: UserId,
    /// Taken by the reply consumer when the response arrives
    waiter: Option<oneshot::Sender<FeedResponse>>,
    /// Set when an invalidation for `user_id` lands while the request is open
    stale: Arc<AtomicBool>,
}

type PendingTable = HashMap<Uuid, PendingRequest>;

struct ServiceShared {
    broker: Arc<dyn MessageBroker>,
    codec: WireFormat,
    queues: QueueNames,
    reply_queue: String,
    cache: FeedCache,
    pending: Mutex<PendingTable>,
    closed: AtomicBool,
    response_timeout: Duration,
    max_page_size: u32,
}

impl ServiceShared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn on_response(&self, payload: Vec<u8>) -> Result<()> {
        let response: FeedResponse = match self.codec.decode(&payload) {
            Ok(response) => response,
            Err(err) => {
                warn!(queue = %self.reply_queue, error = %err, "dropping undecodable feed response");
                return Ok(());
            }
        };

        let waiter = self
            .pending()
            .get_mut(&response.request_id)
            .and_then(|pending| pending.waiter.take());
        match waiter {
            Some(waiter) => {
                if waiter.send(response).is_err() {
                    debug!("feed caller stopped waiting before its response arrived");
                }
            }
            None => debug!(
                request_id = %response.request_id,
                user_id = response.user_id,
                "discarding feed response nobody is waiting for"
            ),
        }
        Ok(())
    }

    async fn on_invalidation(&self, payload: Vec<u8>) -> Result<()> {
        let notice: CacheInvalidation = match self.codec.decode(&payload) {
            Ok(notice) => notice,
            Err(err) => {
                warn!(error = %err, "dropping undecodable cache invalidation");
                return Ok(());
            }
        };

        for pending in self.pending().values() {
            if pending.user_id == notice.user_id {
                pending.stale.store(true, Ordering::Release);
            }
        }
        let evicted = self.cache.evict(notice.user_id);
        debug!(user_id = notice.user_id, reason = ?notice.reason, evicted, "cache invalidation");
        Ok(())
    }
}

/// Removes a request from the pending table once its caller is done
struct PendingGuard<'a> {
    shared: &'a ServiceShared,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.request_id);
    }
}

/// Cache-aside front of the feed pipeline.
///
/// A cache miss publishes a `FeedRequest` naming this instance's reply queue
/// and waits, bounded by the response timeout, for the response carrying the
/// same request id. Responses are routed to their callers through a pending
/// table, so concurrent callers never see each other's feeds. A standing
/// subscriber evicts entries named by cache-invalidation notices.
pub struct FeedService {
    shared: Arc<ServiceShared>,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl FeedService {
    /// Start the reply and invalidation consumers. Must be called within a
    /// tokio runtime.
    pub fn start(
        broker: Arc<dyn MessageBroker>,
        codec: WireFormat,
        queues: QueueNames,
        cache: FeedCache,
        options: FeedServiceOptions,
    ) -> Self {
        let reply_queue = format!("{}.{}", queues.feed_response, options.instance);
        let shared = Arc::new(ServiceShared {
            broker: Arc::clone(&broker),
            codec,
            queues,
            reply_queue,
            cache,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            response_timeout: options.response_timeout,
            max_page_size: options.max_page_size,
        });

        let responses = {
            let shared = Arc::clone(&shared);
            spawn_consumer(
                Arc::clone(&broker),
                shared.reply_queue.clone(),
                options.consumer.clone(),
                move |payload| {
                    let shared = Arc::clone(&shared);
                    async move { shared.on_response(payload).await }
                },
            )
        };
        let invalidations = {
            let shared = Arc::clone(&shared);
            spawn_consumer(
                broker,
                shared.queues.cache_invalidate.clone(),
                options.consumer,
                move |payload| {
                    let shared = Arc::clone(&shared);
                    async move { shared.on_invalidation(payload).await }
                },
            )
        };

        info!(reply_queue = %shared.reply_queue, "feed service started");
        Self {
            shared,
            consumers: Mutex::new(vec![responses, invalidations]),
        }
    }

    /// One page of the friend feed of `user_id`.
    ///
    /// Served from the cache when it holds this exact page, otherwise
    /// computed by a feed worker. Fails with `FeedUnavailable` when no
    /// usable response arrives within the response timeout, or at once when
    /// a miss reaches a service that was shut down.
    pub async fn get_feed(&self, user_id: UserId, page_offset: u32, page_size: u32) -> Result<FeedResponse> {
        let shared = &self.shared;
        if page_size == 0 || page_size > shared.max_page_size {
            return Err(FeedError::InvalidRequest(format!(
                "page size {} outside 1..={}",
                page_size, shared.max_page_size
            )));
        }

        if let Some(cached) = shared.cache.get_page(user_id, page_offset, page_size) {
            debug!(user_id, page_offset, page_size, "feed cache hit");
            return Ok(cached);
        }

        if shared.closed.load(Ordering::Acquire) {
            return Err(FeedError::feed_unavailable(user_id, "feed service shut down"));
        }

        let request = FeedRequest::new(user_id, page_offset, page_size, shared.reply_queue.clone());
        let payload = shared.codec.encode(&request)?;
        let (waiter, response) = oneshot::channel();
        let stale = Arc::new(AtomicBool::new(false));
        shared.pending().insert(
            request.request_id,
            PendingRequest {
                user_id,
                waiter: Some(waiter),
                stale: Arc::clone(&stale),
            },
        );
        let _pending = PendingGuard {
            shared,
            request_id: request.request_id,
        };

        shared
            .broker
            .publish(&shared.queues.feed_request, payload)
            .await
            .map_err(|err| FeedError::feed_unavailable(user_id, err.to_string()))?;
        debug!(request_id = %request.request_id, user_id, "published feed request");

        let response = match tokio::time::timeout(shared.response_timeout, response).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(FeedError::feed_unavailable(user_id, "feed service shut down")),
            Err(_) => {
                warn!(
                    request_id = %request.request_id,
                    user_id,
                    timeout_ms = shared.response_timeout.as_millis() as u64,
                    "feed response timed out"
                );
                return Err(FeedError::feed_unavailable(
                    user_id,
                    format!("no response within {:?}", shared.response_timeout),
                ));
            }
        };

        match &response.status {
            FeedStatus::Ok => {
                // A notice for this user that arrived mid-flight may describe
                // data newer than this page
                if !stale.load(Ordering::Acquire) {
                    shared.cache.put(page_offset, response.clone());
                    if stale.load(Ordering::Acquire) {
                        shared.cache.evict(user_id);
                    }
                }
                Ok(response)
            }
            FeedStatus::Failed { reason } => Err(FeedError::feed_unavailable(user_id, reason.clone())),
        }
    }

    /// Whatever feed page is currently cached for `user_id`
    pub fn cached_feed(&self, user_id: UserId) -> Option<FeedResponse> {
        self.shared.cache.get(user_id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn reply_queue(&self) -> &str {
        &self.shared.reply_queue
    }

    /// Callers currently waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.pending().len()
    }

    /// Stop both consumers and fail every caller still waiting
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        let consumers = std::mem::take(&mut *self.consumers.lock()?);
        for consumer in consumers {
            consumer.stop().await?;
        }
        self.shared.pending().clear();
        info!(reply_queue = %self.shared.reply_queue, "feed service stopped");
        Ok(())
    }
}
