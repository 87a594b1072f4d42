pub mod config;
pub mod memory;
pub mod pool;
pub mod pool_set;

use crate::core::{PostPage, PostSummary, Result, UserId};
use async_trait::async_trait;
use config::PoolConfig;
use std::collections::BTreeSet;

/// An open session against one database node.
///
/// Both the write node and the replicas share one schema, so every
/// implementation must answer the read operations identically no matter
/// which pool the connection came from. Write operations fail on read-only
/// nodes.
#[async_trait]
pub trait NodeConnection: Send {
    /// Trivial round trip (`SELECT 1`), used by the latency prober.
    async fn ping(&mut self) -> Result<()>;

    /// IDs of the users `user_id` has befriended.
    async fn friend_ids(&mut self, user_id: UserId) -> Result<BTreeSet<UserId>>;

    /// IDs of the users that have befriended `user_id`, i.e. whose feed contains
    /// `user_id`'s posts.
    async fn follower_ids(&mut self, user_id: UserId) -> Result<BTreeSet<UserId>>;

    /// One window of posts authored by any of `author_ids`, newest first.
    async fn posts_by_authors(
        &mut self,
        author_ids: &BTreeSet<UserId>,
        offset: u32,
        limit: u32,
    ) -> Result<PostPage>;

    async fn insert_post(&mut self, author_id: UserId, content: &str) -> Result<PostSummary>;

    async fn add_friend(&mut self, user_id: UserId, friend_id: UserId) -> Result<()>;

    /// Whether the session can still be handed out again.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Opens connections to one database node.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn NodeConnection>>;
}
