/// Feed pipeline tests
///
/// Feed service, feed workers and post writer talking through the in-memory broker
/// Run with: cargo test --test feed_pipeline_tests

use chrono::{TimeZone, Utc};
use replifeed::broker::{ConsumerHandle, ConsumerOptions};
use replifeed::feed::{
    CacheInvalidation, FeedCache, FeedServiceOptions, FeedStatus, InvalidationReason,
};
use replifeed::{
    FeedError, FeedRequest, FeedResponse, FeedService, FeedWorker, InMemoryBroker, MemoryNode,
    MessageBroker, PoolConfig, PoolSet, PostWriter, QueueNames, Router, SnapshotCell, SocialStore,
    WireFormat,
};
use std::sync::Arc;
use std::time::Duration;

const REQUESTS: &str = "postRequestQueue";
const INVALIDATIONS: &str = "cacheUpdateQueue";

struct Cluster {
    store: Arc<SocialStore>,
    replica: MemoryNode,
    router: Arc<Router>,
    broker: InMemoryBroker,
}

impl Cluster {
    fn shared_broker(&self) -> Arc<dyn MessageBroker> {
        Arc::new(self.broker.clone())
    }

    fn worker(&self, codec: WireFormat) -> (Arc<FeedWorker>, ConsumerHandle) {
        let worker = Arc::new(FeedWorker::new(
            "worker",
            Arc::clone(&self.router),
            self.shared_broker(),
            codec,
            QueueNames::default(),
            500,
        ));
        let handle = Arc::clone(&worker).spawn(ConsumerOptions::default());
        (worker, handle)
    }

    fn service(&self, codec: WireFormat, instance: &str, timeout: Duration) -> FeedService {
        self.service_with_queues(codec, instance, timeout, QueueNames::default())
    }

    fn service_with_queues(
        &self,
        codec: WireFormat,
        instance: &str,
        timeout: Duration,
        queues: QueueNames,
    ) -> FeedService {
        FeedService::start(
            self.shared_broker(),
            codec,
            queues,
            FeedCache::new(1000, Duration::from_secs(60)).unwrap(),
            FeedServiceOptions {
                instance: instance.to_string(),
                response_timeout: timeout,
                max_page_size: 500,
                consumer: ConsumerOptions {
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(50),
                    ..ConsumerOptions::default()
                },
            },
        )
    }

    fn writer(&self) -> PostWriter {
        self.writer_with_queues(QueueNames::default())
    }

    fn writer_with_queues(&self, queues: QueueNames) -> PostWriter {
        PostWriter::new(
            Arc::clone(&self.router),
            self.shared_broker(),
            WireFormat::Json,
            queues,
        )
    }
}

/// User 7 is friends with 1, 2 and 3; user 4 is a stranger
async fn cluster() -> Cluster {
    let store = SocialStore::new();
    for friend in [1, 2, 3] {
        store.add_friend(7, friend);
    }
    store.add_friend(8, 4);
    store.insert_post_at(1, "post by 1", Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
    store.insert_post_at(2, "post by 2", Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap());
    store.insert_post_at(3, "post by 3", Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    store.insert_post_at(4, "post by 4", Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

    let replica = MemoryNode::replica("read1", Arc::clone(&store));
    let pools = PoolSet::builder()
        .write(
            PoolConfig::default(),
            Arc::new(MemoryNode::primary("write", Arc::clone(&store))),
        )
        .replica("read1", PoolConfig::default(), Arc::new(replica.clone()))
        .build()
        .await
        .unwrap();
    let router = Arc::new(Router::new(Arc::new(pools), Arc::new(SnapshotCell::default())));

    Cluster {
        store,
        replica,
        router,
        broker: InMemoryBroker::new(),
    }
}

fn contents(response: &FeedResponse) -> Vec<&str> {
    response.posts.iter().map(|post| post.content.as_str()).collect()
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_round_trip_keeps_request_id() {
    let cluster = cluster().await;
    let (_worker, handle) = cluster.worker(WireFormat::Json);

    let request = FeedRequest::new(7, 0, 50, "replies");
    cluster
        .broker
        .publish(REQUESTS, WireFormat::Json.encode(&request).unwrap())
        .await
        .unwrap();

    let payload = cluster
        .broker
        .receive("replies", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("no feed response");
    let response: FeedResponse = WireFormat::Json.decode(&payload).unwrap();

    assert_eq!(response.request_id, request.request_id);
    assert_eq!(response.status, FeedStatus::Ok);
    assert_eq!(contents(&response), vec!["post by 2", "post by 3", "post by 1"]);
    assert_eq!(response.total_elements, 3);
    assert_eq!(response.page_size, 50);
    assert_eq!(response.page_number, 0);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeated_get_feed_publishes_one_request() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::Json);
    let service = cluster.service(WireFormat::Json, "a", Duration::from_secs(5));

    let first = service.get_feed(7, 0, 50).await.unwrap();
    let second = service.get_feed(7, 0, 50).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(cluster.broker.published_count(REQUESTS), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_response_times_out() {
    let cluster = cluster().await;
    let service = cluster.service(WireFormat::Json, "a", Duration::from_millis(5000));

    let started = tokio::time::Instant::now();
    let result = service.get_feed(7, 0, 50).await;
    let waited = started.elapsed();

    assert!(matches!(result, Err(FeedError::FeedUnavailable { user_id: 7, .. })));
    assert!(waited >= Duration::from_millis(5000));
    assert!(waited < Duration::from_millis(6000));
    assert_eq!(service.pending_requests(), 0);
}

#[tokio::test]
async fn test_invalidation_forces_new_request() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::Json);
    let service = cluster.service(WireFormat::Json, "a", Duration::from_secs(5));

    service.get_feed(7, 0, 50).await.unwrap();
    assert!(service.cached_feed(7).is_some());

    let notice = CacheInvalidation {
        user_id: 7,
        reason: InvalidationReason::FriendsChanged,
    };
    cluster
        .broker
        .publish(INVALIDATIONS, WireFormat::Json.encode(&notice).unwrap())
        .await
        .unwrap();
    wait_until(|| service.cached_feed(7).is_none()).await;

    service.get_feed(7, 0, 50).await.unwrap();
    assert_eq!(cluster.broker.published_count(REQUESTS), 2);
}

#[tokio::test]
async fn test_new_post_reaches_cached_feed() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::Json);
    let service = cluster.service(WireFormat::Json, "a", Duration::from_secs(5));
    let writer = cluster.writer();

    let before = service.get_feed(7, 0, 50).await.unwrap();
    assert_eq!(before.total_elements, 3);

    writer.create_post(2, "fresh news").await.unwrap();
    wait_until(|| service.cached_feed(7).is_none()).await;

    let after = service.get_feed(7, 0, 50).await.unwrap();
    assert_eq!(after.total_elements, 4);
    assert_eq!(after.posts[0].content, "fresh news");
}

#[tokio::test]
async fn test_friend_change_reaches_cached_feed() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::Json);
    let service = cluster.service(WireFormat::Json, "a", Duration::from_secs(5));
    let writer = cluster.writer();

    service.get_feed(7, 0, 50).await.unwrap();
    writer.add_friend(7, 4).await.unwrap();
    wait_until(|| service.cached_feed(7).is_none()).await;

    let after = service.get_feed(7, 0, 50).await.unwrap();
    assert_eq!(contents(&after)[0], "post by 4");
    assert!(cluster.store.friend_ids(7).contains(&4));
}

#[tokio::test]
async fn test_worker_failure_fails_fast() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::Json);
    let service = cluster.service(WireFormat::Json, "a", Duration::from_secs(5));
    cluster.replica.set_failing(true);

    let started = std::time::Instant::now();
    let result = service.get_feed(7, 0, 50).await;

    assert!(matches!(result, Err(FeedError::FeedUnavailable { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(service.cached_feed(7).is_none());

    cluster.replica.set_failing(false);
    assert!(service.get_feed(7, 0, 50).await.is_ok());
}

#[tokio::test]
async fn test_instances_only_see_their_own_responses() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::Json);
    let a = Arc::new(cluster.service(WireFormat::Json, "a", Duration::from_secs(5)));
    let b = Arc::new(cluster.service(WireFormat::Json, "b", Duration::from_secs(5)));

    let mut calls = Vec::new();
    for round in 0..10u32 {
        for (service, user_id) in [(Arc::clone(&a), 7), (Arc::clone(&b), 8)] {
            calls.push(tokio::spawn(async move {
                (user_id, service.get_feed(user_id, 0, 10 + round).await)
            }));
        }
    }

    for call in calls {
        let (user_id, response) = call.await.unwrap();
        let response = response.unwrap();
        assert_eq!(response.user_id, user_id);
        let expected = if user_id == 7 { "post by 2" } else { "post by 4" };
        assert_eq!(response.posts[0].content, expected);
    }
    assert_eq!(a.pending_requests(), 0);
    assert_eq!(b.pending_requests(), 0);
}

#[tokio::test]
async fn test_messagepack_pipeline() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::MessagePack);
    let service = cluster.service(WireFormat::MessagePack, "a", Duration::from_secs(5));

    let response = service.get_feed(7, 1, 2).await.unwrap();
    assert_eq!(contents(&response), vec!["post by 3", "post by 1"]);
    assert_eq!(response.total_elements, 3);
}

#[tokio::test]
async fn test_pipeline_recovers_after_broker_outage() {
    let cluster = cluster().await;
    let options = ConsumerOptions {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..ConsumerOptions::default()
    };
    let worker = Arc::new(FeedWorker::new(
        "worker",
        Arc::clone(&cluster.router),
        cluster.shared_broker(),
        WireFormat::Json,
        QueueNames::default(),
        500,
    ));
    let _handle = Arc::clone(&worker).spawn(options);
    let service = cluster.service(WireFormat::Json, "a", Duration::from_secs(2));

    cluster.broker.set_online(false);
    assert!(matches!(
        service.get_feed(7, 0, 50).await,
        Err(FeedError::FeedUnavailable { .. })
    ));

    tokio::time::sleep(Duration::from_millis(30)).await;
    cluster.broker.set_online(true);

    let response = service.get_feed(7, 0, 50).await.unwrap();
    assert_eq!(response.total_elements, 3);
}

#[tokio::test]
async fn test_invalidation_reaches_every_instance() {
    let cluster = cluster().await;
    let (_worker, _handle) = cluster.worker(WireFormat::Json);
    let own_queue = |queue: &str| QueueNames {
        cache_invalidate: queue.to_string(),
        ..QueueNames::default()
    };
    let a = cluster.service_with_queues(WireFormat::Json, "a", Duration::from_secs(5), own_queue("invalidate.a"));
    let b = cluster.service_with_queues(WireFormat::Json, "b", Duration::from_secs(5), own_queue("invalidate.b"));
    let writer = cluster.writer_with_queues(QueueNames {
        invalidation_fanout: vec!["invalidate.a".to_string(), "invalidate.b".to_string()],
        ..QueueNames::default()
    });

    a.get_feed(7, 0, 50).await.unwrap();
    b.get_feed(7, 0, 50).await.unwrap();
    assert!(a.cached_feed(7).is_some());
    assert!(b.cached_feed(7).is_some());

    writer.create_post(1, "seen by both").await.unwrap();
    wait_until(|| a.cached_feed(7).is_none() && b.cached_feed(7).is_none()).await;

    assert_eq!(a.get_feed(7, 0, 50).await.unwrap().posts[0].content, "seen by both");
    assert_eq!(b.get_feed(7, 0, 50).await.unwrap().posts[0].content, "seen by both");
}
