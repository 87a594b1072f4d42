// ============================================================================
// Replifeed Library
// ============================================================================

//! Latency-aware read routing over a write node and read replicas, and a
//! friend-feed pipeline that computes feeds behind a message broker with a
//! cache in front.

pub mod app;
pub mod broker;
pub mod config;
pub mod connection;
pub mod core;
pub mod feed;
pub mod routing;

// Re-export main types for convenience
pub use app::FeedNode;
pub use config::AppConfig;
pub use core::{FeedError, PostId, PostPage, PostSummary, Result, TxMode, UserId};

// Re-export connection API
pub use connection::{
    NodeConnection, NodeConnector,
    config::PoolConfig,
    memory::{MemoryNode, SocialStore},
    pool::{ConnectionPool, PoolGuard, PoolStats},
    pool_set::{PoolId, PoolSet, ReplicaHandle},
};

// Re-export routing and messaging API
pub use broker::{InMemoryBroker, MessageBroker, QueueNames, WireFormat};
pub use feed::{FeedRequest, FeedResponse, FeedService, FeedWorker, PostWriter};
pub use routing::{LatencyProber, LatencySnapshot, Router, RoutingDecision, SnapshotCell};
