use super::message::{CacheInvalidation, InvalidationReason};
use crate::broker::{MessageBroker, QueueNames, WireFormat};
use crate::core::{FeedError, PostSummary, Result, TxMode, UserId};
use crate::routing::Router;
use std::sync::Arc;
use tracing::{info, warn};

/// Longest post body the schema accepts, in characters
pub const MAX_POST_LENGTH: usize = 1000;

/// Write path of the social graph.
///
/// Every statement goes to the write pool. After a successful write the
/// users whose feeds changed are announced on every invalidation queue.
pub struct PostWriter {
    router: Arc<Router>,
    broker: Arc<dyn MessageBroker>,
    codec: WireFormat,
    queues: QueueNames,
}

impl PostWriter {
    pub fn new(router: Arc<Router>, broker: Arc<dyn MessageBroker>, codec: WireFormat, queues: QueueNames) -> Self {
        Self {
            router,
            broker,
            codec,
            queues,
        }
    }

    /// Store a post and invalidate the feed of everyone who sees it
    pub async fn create_post(&self, author_id: UserId, content: &str) -> Result<PostSummary> {
        let content = content.trim();
        if content.is_empty() {
            return Err(FeedError::InvalidRequest("post content is empty".to_string()));
        }
        let length = content.chars().count();
        if length > MAX_POST_LENGTH {
            return Err(FeedError::InvalidRequest(format!(
                "post content has {} characters, limit is {}",
                length, MAX_POST_LENGTH
            )));
        }

        let (post, followers) = {
            let mut conn = self.router.acquire(TxMode::ReadWrite).await?;
            let post = conn.insert_post(author_id, content).await?;
            let followers = conn.follower_ids(author_id).await?;
            (post, followers)
        };
        info!(post_id = post.id, author_id, followers = followers.len(), "post created");

        for follower in followers {
            self.invalidate(follower, InvalidationReason::PostCreated).await;
        }
        Ok(post)
    }

    /// Add `friend_id` to the friend list of `user_id`
    pub async fn add_friend(&self, user_id: UserId, friend_id: UserId) -> Result<()> {
        if user_id == friend_id {
            return Err(FeedError::InvalidRequest(format!(
                "user {} cannot befriend themselves",
                user_id
            )));
        }

        {
            let mut conn = self.router.acquire(TxMode::ReadWrite).await?;
            conn.add_friend(user_id, friend_id).await?;
        }
        info!(user_id, friend_id, "friend added");

        self.invalidate(user_id, InvalidationReason::FriendsChanged).await;
        Ok(())
    }

    /// The write already committed; a lost notice only delays freshness until the TTL.
    async fn invalidate(&self, user_id: UserId, reason: InvalidationReason) {
        let notice = CacheInvalidation { user_id, reason };
        let payload = match self.codec.encode(&notice) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(user_id, ?reason, error = %err, "failed to encode cache invalidation");
                return;
            }
        };
        for queue in self.queues.invalidation_targets() {
            if let Err(err) = self.broker.publish(queue, payload.clone()).await {
                warn!(user_id, ?reason, queue, error = %err, "failed to publish cache invalidation");
            }
        }
    }
}
