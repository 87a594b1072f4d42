//! Asynchronous feed retrieval: the worker that computes friend feeds, the
//! cache-aside service in front of it, and the write path that invalidates
//! cached feeds.

pub mod cache;
pub mod message;
pub mod service;
pub mod worker;
pub mod writer;

pub use cache::{CacheStats, FeedCache};
pub use message::{CacheInvalidation, FeedRequest, FeedResponse, FeedStatus, InvalidationReason};
pub use service::{FeedService, FeedServiceOptions};
pub use worker::{FeedWorker, WorkerState};
pub use writer::{MAX_POST_LENGTH, PostWriter};
