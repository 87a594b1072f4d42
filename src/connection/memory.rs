//! In-memory social graph node.
//!
//! A `SocialStore` holds friendships and posts. Several `MemoryNode`s can
//! share one store to model a primary and its replicas with instant
//! replication. Each node can be slowed down or broken on demand, which is
//! what the latency prober and the routing tests rely on.

use super::{NodeConnection, NodeConnector, config::PoolConfig};
use crate::core::{FeedError, PostId, PostPage, PostSummary, Result, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredPost {
    id: PostId,
    author_id: UserId,
    content: String,
    created_at: DateTime<Utc>,
}

impl StoredPost {
    fn summary(&self) -> PostSummary {
        PostSummary {
            id: self.id,
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    friends: HashMap<UserId, BTreeSet<UserId>>,
    posts: Vec<StoredPost>,
    next_post_id: PostId,
}

/// Shared friendships and posts
#[derive(Debug, Default)]
pub struct SocialStore {
    state: RwLock<StoreState>,
}

impl SocialStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that `user_id` has befriended `friend_id`
    pub fn add_friend(&self, user_id: UserId, friend_id: UserId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.friends.entry(user_id).or_default().insert(friend_id);
    }

    pub fn insert_post(&self, author_id: UserId, content: &str) -> PostSummary {
        self.insert_post_at(author_id, content, Utc::now())
    }

    /// Insert a post with an explicit creation time
    pub fn insert_post_at(
        &self,
        author_id: UserId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> PostSummary {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.next_post_id += 1;
        let post = StoredPost {
            id: state.next_post_id,
            author_id,
            content: content.to_string(),
            created_at,
        };
        let summary = post.summary();
        state.posts.push(post);
        summary
    }

    pub fn friend_ids(&self, user_id: UserId) -> BTreeSet<UserId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.friends.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn follower_ids(&self, user_id: UserId) -> BTreeSet<UserId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .friends
            .iter()
            .filter(|(_, friends)| friends.contains(&user_id))
            .map(|(follower, _)| *follower)
            .collect()
    }

    pub fn posts_by_authors(
        &self,
        author_ids: &BTreeSet<UserId>,
        offset: u32,
        limit: u32,
    ) -> PostPage {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<&StoredPost> = state
            .posts
            .iter()
            .filter(|post| author_ids.contains(&post.author_id))
            .collect();
        // Newest first; ids break ties so paging is deterministic
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        PostPage {
            total_elements: matching.len() as u64,
            posts: matching
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(StoredPost::summary)
                .collect(),
        }
    }

    pub fn post_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.posts.len()
    }
}

#[derive(Debug)]
struct NodeState {
    name: String,
    store: Arc<SocialStore>,
    read_only: bool,
    delay_ms: AtomicU64,
    failing: AtomicBool,
    unreachable: AtomicBool,
    connections_opened: AtomicUsize,
}

/// One database node backed by a `SocialStore`
#[derive(Debug, Clone)]
pub struct MemoryNode {
    state: Arc<NodeState>,
}

impl MemoryNode {
    /// A writable node
    pub fn primary(name: impl Into<String>, store: Arc<SocialStore>) -> Self {
        Self::with_mode(name, store, false)
    }

    /// A read-only node; writes fail with `DataAccess`
    pub fn replica(name: impl Into<String>, store: Arc<SocialStore>) -> Self {
        Self::with_mode(name, store, true)
    }

    fn with_mode(name: impl Into<String>, store: Arc<SocialStore>, read_only: bool) -> Self {
        Self {
            state: Arc::new(NodeState {
                name: name.into(),
                store,
                read_only,
                delay_ms: AtomicU64::new(0),
                failing: AtomicBool::new(false),
                unreachable: AtomicBool::new(false),
                connections_opened: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn store(&self) -> &Arc<SocialStore> {
        &self.state.store
    }

    /// Added to every statement executed on this node
    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make every statement fail
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::Relaxed);
    }

    /// Make new connections fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::Relaxed);
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NodeConnector for MemoryNode {
    async fn connect(&self, _config: &PoolConfig) -> Result<Box<dyn NodeConnection>> {
        if self.state.unreachable.load(Ordering::Relaxed) {
            return Err(FeedError::ConnectionError(format!(
                "node '{}' is unreachable",
                self.state.name
            )));
        }
        self.state.connections_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection {
            node: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    node: Arc<NodeState>,
}

impl MemoryConnection {
    /// Simulated statement round trip
    async fn round_trip(&self) -> Result<()> {
        let delay = self.node.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.node.failing.load(Ordering::Relaxed) {
            return Err(FeedError::DataAccess(format!(
                "node '{}' failed to execute statement",
                self.node.name
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.node.read_only {
            return Err(FeedError::DataAccess(format!(
                "cannot execute write on read-only node '{}'",
                self.node.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<()> {
        self.round_trip().await
    }

    async fn friend_ids(&mut self, user_id: UserId) -> Result<BTreeSet<UserId>> {
        self.round_trip().await?;
        Ok(self.node.store.friend_ids(user_id))
    }

    async fn follower_ids(&mut self, user_id: UserId) -> Result<BTreeSet<UserId>> {
        self.round_trip().await?;
        Ok(self.node.store.follower_ids(user_id))
    }

    async fn posts_by_authors(
        &mut self,
        author_ids: &BTreeSet<UserId>,
        offset: u32,
        limit: u32,
    ) -> Result<PostPage> {
        self.round_trip().await?;
        Ok(self.node.store.posts_by_authors(author_ids, offset, limit))
    }

    async fn insert_post(&mut self, author_id: UserId, content: &str) -> Result<PostSummary> {
        self.ensure_writable()?;
        self.round_trip().await?;
        Ok(self.node.store.insert_post(author_id, content))
    }

    async fn add_friend(&mut self, user_id: UserId, friend_id: UserId) -> Result<()> {
        self.ensure_writable()?;
        self.round_trip().await?;
        self.node.store.add_friend(user_id, friend_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_posts_by_authors_newest_first_with_paging() {
        let store = SocialStore::new();
        store.insert_post_at(1, "old", at(1));
        store.insert_post_at(2, "newest", at(9));
        store.insert_post_at(3, "not a friend", at(5));
        store.insert_post_at(1, "middle", at(4));

        let authors: BTreeSet<UserId> = [1, 2].into_iter().collect();
        let page = store.posts_by_authors(&authors, 0, 2);
        assert_eq!(page.total_elements, 3);
        let contents: Vec<&str> = page.posts.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["newest", "middle"]);

        let next = store.posts_by_authors(&authors, 2, 2);
        assert_eq!(next.posts.len(), 1);
        assert_eq!(next.posts[0].content, "old");
    }

    #[test]
    fn test_follower_ids() {
        let store = SocialStore::new();
        store.add_friend(10, 1);
        store.add_friend(11, 1);
        store.add_friend(11, 2);

        let followers: Vec<UserId> = store.follower_ids(1).into_iter().collect();
        assert_eq!(followers, vec![10, 11]);
        assert!(store.follower_ids(99).is_empty());
    }

    #[tokio::test]
    async fn test_replica_rejects_writes() {
        let store = SocialStore::new();
        let replica = MemoryNode::replica("read1", Arc::clone(&store));
        let mut conn = replica.connect(&PoolConfig::default()).await.unwrap();

        assert!(matches!(
            conn.insert_post(1, "hello").await,
            Err(FeedError::DataAccess(_))
        ));
        assert_eq!(store.post_count(), 0);
    }

    #[tokio::test]
    async fn test_replica_sees_primary_writes() {
        let store = SocialStore::new();
        let primary = MemoryNode::primary("write", Arc::clone(&store));
        let replica = MemoryNode::replica("read1", store);

        let mut writer = primary.connect(&PoolConfig::default()).await.unwrap();
        writer.add_friend(7, 8).await.unwrap();

        let mut reader = replica.connect(&PoolConfig::default()).await.unwrap();
        let friends = reader.friend_ids(7).await.unwrap();
        assert!(friends.contains(&8));
    }

    #[tokio::test]
    async fn test_failing_node() {
        let node = MemoryNode::replica("read2", SocialStore::new());
        let mut conn = node.connect(&PoolConfig::default()).await.unwrap();
        node.set_failing(true);
        assert!(conn.ping().await.is_err());
        node.set_failing(false);
        assert!(conn.ping().await.is_ok());
    }
}
