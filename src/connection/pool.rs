use super::{NodeConnection, NodeConnector, config::PoolConfig};
use crate::core::{FeedError, Result};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Connection pool
///
/// Manages a bounded set of connections to a single database node.
/// At most `max_connections` connections are checked out at any time;
/// `acquire` waits up to `connect_timeout` for a free slot.
///
/// Cloning is cheap: clones share the same underlying pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    /// Pool name used in logs and errors (e.g. "write", "read1")
    name: String,
    /// Pool configuration
    config: PoolConfig,
    /// Opens new connections to the node
    connector: Arc<dyn NodeConnector>,
    /// Connections waiting to be reused
    idle: Mutex<VecDeque<PooledConnection>>,
    /// One permit per connection that may be checked out
    permits: Arc<Semaphore>,
    /// Total number of open connections (idle + checked out)
    total_connections: AtomicUsize,
    /// Next connection ID
    next_id: AtomicU64,
    /// Checked out connections by ID
    checkouts: Mutex<HashMap<u64, Checkout>>,
    /// Number of checkouts reported as leaked so far
    leaks_reported: AtomicU64,
    closed: AtomicBool,
}

/// A connection owned by the pool
struct PooledConnection {
    id: u64,
    connection: Box<dyn NodeConnection>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(id: u64, connection: Box<dyn NodeConnection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }

    fn is_reusable(&self, config: &PoolConfig) -> bool {
        self.connection.is_valid()
            && !self.is_expired(config.max_lifetime)
            && !self.is_idle_too_long(config.idle_timeout)
    }
}

struct Checkout {
    since: Instant,
    reported: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionPool {
    /// Create a new pool and open `min_connections` connections up front
    pub async fn new(
        name: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self> {
        let name = name.into();
        config
            .validate()
            .map_err(|err| FeedError::ConfigError(format!("pool '{}': {}", name, err)))?;

        let shared = Arc::new(PoolShared {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            name,
            config,
            connector,
            idle: Mutex::new(VecDeque::new()),
            total_connections: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            checkouts: Mutex::new(HashMap::new()),
            leaks_reported: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let pool = Self { shared };

        // Pre-create minimum connections
        pool.ensure_min_connections().await?;

        debug!(
            pool = %pool.shared.name,
            url = %pool.shared.config.to_url(),
            max = pool.shared.config.max_connections,
            "connection pool ready"
        );

        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a connection
    ///
    /// Reuses an idle connection when one is still within its idle and
    /// lifetime limits, otherwise opens a new one. Fails with
    /// `PoolExhausted` when no slot frees up within `connect_timeout`.
    pub async fn acquire(&self) -> Result<PoolGuard> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(FeedError::PoolClosed(shared.name.clone()));
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            shared.config.connect_timeout,
            Arc::clone(&shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FeedError::PoolClosed(shared.name.clone())),
            Err(_) => {
                return Err(FeedError::PoolExhausted {
                    pool: shared.name.clone(),
                    waited: started.elapsed(),
                });
            }
        };

        let mut pooled = match shared.take_idle() {
            Some(pooled) => pooled,
            None => shared.open().await?,
        };
        pooled.last_used = Instant::now();

        lock(&shared.checkouts).insert(
            pooled.id,
            Checkout {
                since: Instant::now(),
                reported: false,
            },
        );

        Ok(PoolGuard {
            pooled: Some(pooled),
            shared: Arc::clone(shared),
            _permit: permit,
        })
    }

    /// Ensure minimum number of connections
    async fn ensure_min_connections(&self) -> Result<()> {
        while self.shared.total_connections.load(Ordering::SeqCst) < self.shared.config.min_connections
        {
            let pooled = self.shared.open().await?;
            lock(&self.shared.idle).push_back(pooled);
        }
        Ok(())
    }

    /// Drop idle connections past their idle timeout or max lifetime
    pub fn evict_stale(&self) -> usize {
        let config = &self.shared.config;
        let mut idle = lock(&self.shared.idle);
        let before = idle.len();
        idle.retain(|pooled| pooled.is_reusable(config));
        let removed = before - idle.len();

        if removed > 0 {
            self.shared
                .total_connections
                .fetch_sub(removed, Ordering::SeqCst);
            debug!(pool = %self.shared.name, removed, "evicted stale idle connections");
        }
        removed
    }

    /// Report checkouts held longer than the leak detection threshold
    ///
    /// Each checkout is reported at most once. Returns the number of newly
    /// reported leaks.
    pub fn detect_leaks(&self) -> usize {
        let Some(threshold) = self.shared.config.leak_detection_threshold else {
            return 0;
        };

        let mut newly_reported = 0;
        let mut checkouts = lock(&self.shared.checkouts);
        for (id, checkout) in checkouts.iter_mut() {
            if checkout.reported {
                continue;
            }
            let held = checkout.since.elapsed();
            if held > threshold {
                checkout.reported = true;
                newly_reported += 1;
                warn!(
                    pool = %self.shared.name,
                    connection_id = *id,
                    held_ms = held.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "connection leak detection triggered: connection checked out past threshold"
                );
            }
        }

        self.shared
            .leaks_reported
            .fetch_add(newly_reported as u64, Ordering::Relaxed);
        newly_reported
    }

    /// One housekeeping pass: stale eviction plus leak detection
    pub fn maintain(&self) {
        self.evict_stale();
        self.detect_leaks();
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle = lock(&self.shared.idle).len();
        let total = self.shared.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            max_connections: self.shared.config.max_connections,
            leaks_reported: self.shared.leaks_reported.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the pool
    ///
    /// Idle connections are dropped immediately; checked out connections are
    /// dropped when their guard is released. Returns `false` if the pool was
    /// already closed.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.shared.permits.close();
        let drained = {
            let mut idle = lock(&self.shared.idle);
            let drained = idle.len();
            idle.clear();
            drained
        };
        self.shared
            .total_connections
            .fetch_sub(drained, Ordering::SeqCst);

        info!(pool = %self.shared.name, drained, "connection pool closed");
        true
    }
}

impl PoolShared {
    /// Pop the first reusable idle connection, discarding stale ones on the way
    fn take_idle(&self) -> Option<PooledConnection> {
        let mut idle = lock(&self.idle);
        while let Some(pooled) = idle.pop_front() {
            if pooled.is_reusable(&self.config) {
                return Some(pooled);
            }
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
        None
    }

    async fn open(&self) -> Result<PooledConnection> {
        let connection =
            match tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.config))
                .await
            {
                Ok(Ok(connection)) => connection,
                Ok(Err(err)) => {
                    return Err(FeedError::ConnectionError(format!(
                        "pool '{}': {}",
                        self.name, err
                    )));
                }
                Err(_) => {
                    return Err(FeedError::ConnectionError(format!(
                        "pool '{}': connect timed out after {:?}",
                        self.name, self.config.connect_timeout
                    )));
                }
            };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection::new(id, connection))
    }

    fn release(&self, mut pooled: PooledConnection) {
        let checkout = lock(&self.checkouts).remove(&pooled.id);
        if let Some(checkout) = checkout.filter(|checkout| checkout.reported) {
            info!(
                pool = %self.name,
                connection_id = pooled.id,
                held_ms = checkout.since.elapsed().as_millis() as u64,
                "previously reported leaked connection returned"
            );
        }

        if self.closed.load(Ordering::Acquire)
            || !pooled.connection.is_valid()
            || pooled.is_expired(self.config.max_lifetime)
        {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        pooled.last_used = Instant::now();
        lock(&self.idle).push_back(pooled);
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
    pub leaks_reported: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} active, {} idle, max {}, {} leaks reported",
            self.active_connections,
            self.total_connections,
            self.idle_connections,
            self.max_connections,
            self.leaks_reported
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped
pub struct PoolGuard {
    pooled: Option<PooledConnection>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    /// Name of the pool this connection belongs to
    pub fn pool_name(&self) -> &str {
        &self.shared.name
    }

    pub fn connection_id(&self) -> u64 {
        self.pooled.as_ref().map_or(0, |pooled| pooled.id)
    }
}

impl Deref for PoolGuard {
    type Target = dyn NodeConnection;

    fn deref(&self) -> &Self::Target {
        self.pooled
            .as_ref()
            .map(|pooled| pooled.connection.as_ref())
            .expect("Connection already returned to pool")
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.pooled
            .as_mut()
            .map(|pooled| pooled.connection.as_mut())
            .expect("Connection already returned to pool")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.shared.release(pooled);
        }
    }
}
