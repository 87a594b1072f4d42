use super::message::FeedResponse;
use crate::core::{FeedError, Result, UserId};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct CacheEntry {
    response: FeedResponse,
    page_offset: u32,
    stored_at: Instant,
}

/// Hit/miss counters of a `FeedCache`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded feed cache keyed by user.
///
/// Holds one page per user. Entries expire `ttl` after they were stored and
/// the least recently used entry is evicted once `capacity` is reached.
pub struct FeedCache {
    entries: Mutex<LruCache<UserId, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FeedCache {
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| FeedError::ConfigError("feed cache capacity must be > 0".to_string()))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<UserId, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, user_id: UserId, accept: impl Fn(&CacheEntry) -> bool) -> Option<FeedResponse> {
        let mut entries = self.entries();
        let expired = match entries.get(&user_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                return accept(entry).then(|| entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&user_id);
        }
        None
    }

    /// Cached feed of `user_id`, whatever page it holds
    pub fn get(&self, user_id: UserId) -> Option<FeedResponse> {
        self.lookup(user_id, |_| true)
    }

    /// Cached page for a request. Counts as a hit only if the entry holds
    /// exactly this `(page_offset, page_size)` window.
    pub fn get_page(&self, user_id: UserId, page_offset: u32, page_size: u32) -> Option<FeedResponse> {
        let found = self.lookup(user_id, |entry| {
            entry.page_offset == page_offset && entry.response.page_size == page_size
        });
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, page_offset: u32, response: FeedResponse) {
        let user_id = response.user_id;
        self.entries().put(
            user_id,
            CacheEntry {
                response,
                page_offset,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop the entry of `user_id`; returns whether one was present
    pub fn evict(&self, user_id: UserId) -> bool {
        self.entries().pop(&user_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
