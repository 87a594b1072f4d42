use super::message::{FeedRequest, FeedResponse};
use crate::broker::{ConsumerHandle, ConsumerOptions, MessageBroker, QueueNames, WireFormat, spawn_consumer};
use crate::core::{FeedError, PostPage, Result, TxMode};
use crate::routing::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Where a worker is in handling its current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    ResolvingFriends,
    FetchingPage,
    PublishingResponse,
}

/// Computes friend feeds for requests taken from the feed-request queue.
///
/// Every decoded request gets exactly one response on its reply queue. A
/// data-access failure produces a `Failed` response instead of silence, so
/// the waiting caller does not sit out its whole timeout.
pub struct FeedWorker {
    name: String,
    router: Arc<Router>,
    broker: Arc<dyn MessageBroker>,
    codec: WireFormat,
    queues: QueueNames,
    max_page_size: u32,
    state: watch::Sender<WorkerState>,
}

impl FeedWorker {
    pub fn new(
        name: impl Into<String>,
        router: Arc<Router>,
        broker: Arc<dyn MessageBroker>,
        codec: WireFormat,
        queues: QueueNames,
        max_page_size: u32,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            name: name.into(),
            router,
            broker,
            codec,
            queues,
            max_page_size,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: WorkerState) {
        self.state.send_replace(next);
    }

    /// Handle one raw feed-request message.
    ///
    /// Undecodable payloads are logged and dropped. An error is returned only
    /// when the response could not be published, so the request is redelivered.
    pub async fn process(&self, payload: &[u8]) -> Result<()> {
        let request: FeedRequest = match self.codec.decode(payload) {
            Ok(request) => request,
            Err(err) => {
                error!(worker = %self.name, error = %err, "dropping undecodable feed request");
                return Ok(());
            }
        };

        let response = match self.resolve(&request).await {
            Ok(page) => FeedResponse::page(&request, page),
            Err(err) => {
                warn!(
                    worker = %self.name,
                    request_id = %request.request_id,
                    user_id = request.user_id,
                    error = %err,
                    "feed resolution failed; replying with failure"
                );
                FeedResponse::failed(&request, err.to_string())
            }
        };

        self.transition(WorkerState::PublishingResponse);
        let published = self.publish(&request, &response).await;
        self.transition(WorkerState::Idle);
        published
    }

    async fn resolve(&self, request: &FeedRequest) -> Result<PostPage> {
        if request.page_size == 0 || request.page_size > self.max_page_size {
            return Err(FeedError::InvalidRequest(format!(
                "page size {} outside 1..={}",
                request.page_size, self.max_page_size
            )));
        }

        self.transition(WorkerState::ResolvingFriends);
        let friends = {
            let mut conn = self.router.acquire(TxMode::ReadOnly).await?;
            conn.friend_ids(request.user_id).await?
        };
        if friends.is_empty() {
            debug!(worker = %self.name, user_id = request.user_id, "user has no friends; empty feed");
            return Ok(PostPage::empty());
        }

        self.transition(WorkerState::FetchingPage);
        let mut conn = self.router.acquire(TxMode::ReadOnly).await?;
        conn.posts_by_authors(&friends, request.page_offset, request.page_size)
            .await
    }

    async fn publish(&self, request: &FeedRequest, response: &FeedResponse) -> Result<()> {
        let reply_to = if request.reply_to.is_empty() {
            self.queues.feed_response.as_str()
        } else {
            request.reply_to.as_str()
        };
        let payload = self.codec.encode(response)?;
        self.broker.publish(reply_to, payload).await?;
        debug!(
            worker = %self.name,
            request_id = %request.request_id,
            reply_to,
            posts = response.posts.len(),
            "published feed response"
        );
        Ok(())
    }

    /// Consume the feed-request queue until the returned handle is stopped
    pub fn spawn(self: Arc<Self>, options: ConsumerOptions) -> ConsumerHandle {
        let broker = Arc::clone(&self.broker);
        let queue = self.queues.feed_request.clone();
        spawn_consumer(broker, queue, options, move |payload| {
            let worker = Arc::clone(&self);
            async move { worker.process(&payload).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::connection::config::PoolConfig;
    use crate::connection::memory::{MemoryNode, SocialStore};
    use crate::connection::pool_set::PoolSet;
    use crate::feed::message::FeedStatus;
    use crate::routing::SnapshotCell;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    const REPLY: &str = "replies";

    struct Fixture {
        worker: Arc<FeedWorker>,
        broker: InMemoryBroker,
        replica: MemoryNode,
    }

    async fn fixture() -> Fixture {
        let store = SocialStore::new();
        store.add_friend(7, 1);
        store.add_friend(7, 2);
        store.insert_post_at(1, "old", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        store.insert_post_at(2, "new", Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        store.insert_post_at(3, "stranger", Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap());

        let replica = MemoryNode::replica("read1", Arc::clone(&store));
        let pools = PoolSet::builder()
            .write(PoolConfig::default(), Arc::new(MemoryNode::primary("write", store)))
            .replica("read1", PoolConfig::default(), Arc::new(replica.clone()))
            .build()
            .await
            .unwrap();
        let router = Router::new(Arc::new(pools), Arc::new(SnapshotCell::default()));

        let broker = InMemoryBroker::new();
        let worker = FeedWorker::new(
            "worker-0",
            Arc::new(router),
            Arc::new(broker.clone()),
            WireFormat::Json,
            QueueNames::default(),
            100,
        );
        Fixture {
            worker: Arc::new(worker),
            broker,
            replica,
        }
    }

    async fn run(fx: &Fixture, request: &FeedRequest) -> FeedResponse {
        let payload = WireFormat::Json.encode(request).unwrap();
        fx.worker.process(&payload).await.unwrap();
        let reply = fx
            .broker
            .receive(REPLY, Duration::from_millis(100))
            .await
            .unwrap()
            .expect("worker published no response");
        WireFormat::Json.decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_feed_contains_friend_posts_newest_first() {
        let fx = fixture().await;
        let request = FeedRequest::new(7, 0, 50, REPLY);
        let response = run(&fx, &request).await;

        assert_eq!(response.request_id, request.request_id);
        assert!(response.is_ok());
        let contents: Vec<_> = response.posts.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["new", "old"]);
        assert_eq!(response.total_elements, 2);
        assert_eq!(fx.worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_offset_and_limit_applied() {
        let fx = fixture().await;
        let response = run(&fx, &FeedRequest::new(7, 1, 1, REPLY)).await;

        assert_eq!(response.posts.len(), 1);
        assert_eq!(response.posts[0].content, "old");
        assert_eq!(response.page_number, 1);
        assert_eq!(response.total_elements, 2);
    }

    #[tokio::test]
    async fn test_no_friends_gives_empty_page() {
        let fx = fixture().await;
        let response = run(&fx, &FeedRequest::new(99, 0, 10, REPLY)).await;
        assert!(response.is_ok());
        assert!(response.posts.is_empty());
        assert_eq!(response.total_elements, 0);
    }

    #[tokio::test]
    async fn test_data_error_still_replies() {
        let fx = fixture().await;
        fx.replica.set_failing(true);

        let request = FeedRequest::new(7, 0, 50, REPLY);
        let response = run(&fx, &request).await;
        assert_eq!(response.request_id, request.request_id);
        assert!(matches!(response.status, FeedStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_oversized_page_rejected_with_reply() {
        let fx = fixture().await;
        let response = run(&fx, &FeedRequest::new(7, 0, 1000, REPLY)).await;
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let fx = fixture().await;
        fx.worker.process(b"not a request").await.unwrap();
        assert_eq!(fx.broker.depth(REPLY), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let fx = fixture().await;
        let payload = WireFormat::Json
            .encode(&FeedRequest::new(7, 0, 50, REPLY))
            .unwrap();
        fx.broker.set_online(false);

        let result = fx.worker.process(&payload).await;
        assert!(matches!(result, Err(FeedError::BrokerUnavailable(_))));
        assert_eq!(fx.worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_state_machine_visits_every_stage() {
        let fx = fixture().await;
        fx.replica.set_delay(Duration::from_millis(20));
        let mut states = fx.worker.watch_state();

        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == WorkerState::Idle {
                    break;
                }
            }
            seen
        });

        run(&fx, &FeedRequest::new(7, 0, 50, REPLY)).await;
        // Publishing to the in-memory broker never yields, so that stage may
        // be overwritten by Idle before the watcher runs
        let seen = seen.await.unwrap();
        assert_eq!(
            &seen[..2],
            &[WorkerState::ResolvingFriends, WorkerState::FetchingPage]
        );
        assert_eq!(seen.last(), Some(&WorkerState::Idle));
    }

    #[tokio::test]
    async fn test_spawned_worker_answers_queue() {
        let fx = fixture().await;
        let handle = Arc::clone(&fx.worker).spawn(ConsumerOptions::default());

        let request = FeedRequest::new(7, 0, 50, REPLY);
        fx.broker
            .publish("postRequestQueue", WireFormat::Json.encode(&request).unwrap())
            .await
            .unwrap();

        let reply = fx
            .broker
            .receive(REPLY, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let response: FeedResponse = WireFormat::Json.decode(&reply).unwrap();
        assert_eq!(response.request_id, request.request_id);

        handle.stop().await.unwrap();
    }
}
