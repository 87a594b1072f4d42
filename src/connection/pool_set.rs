use super::{
    NodeConnector,
    config::PoolConfig,
    pool::{ConnectionPool, PoolGuard, PoolStats},
};
use crate::core::{FeedError, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

pub const WRITE_POOL: &str = "write";

/// Identifies one pool of the set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolId {
    Write,
    Replica(String),
}

impl PoolId {
    pub fn replica(id: impl Into<String>) -> Self {
        PoolId::Replica(id.into())
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolId::Write => f.write_str(WRITE_POOL),
            PoolId::Replica(id) => f.write_str(id),
        }
    }
}

/// A read replica: its identifier and its pool
///
/// The mapping from identifier to pool is fixed once the set is built.
#[derive(Clone)]
pub struct ReplicaHandle {
    id: String,
    pool: ConnectionPool,
}

impl ReplicaHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// The write pool plus the read replica pools, in configuration order
pub struct PoolSet {
    write: ConnectionPool,
    replicas: Vec<ReplicaHandle>,
    closed: AtomicBool,
}

impl PoolSet {
    pub fn builder() -> PoolSetBuilder {
        PoolSetBuilder::default()
    }

    pub fn write(&self) -> &ConnectionPool {
        &self.write
    }

    /// Replicas in configuration order
    pub fn replicas(&self) -> &[ReplicaHandle] {
        &self.replicas
    }

    pub fn replica(&self, id: &str) -> Option<&ReplicaHandle> {
        self.replicas.iter().find(|replica| replica.id == id)
    }

    pub fn pool(&self, id: &PoolId) -> Result<&ConnectionPool> {
        match id {
            PoolId::Write => Ok(&self.write),
            PoolId::Replica(replica_id) => self
                .replica(replica_id)
                .map(ReplicaHandle::pool)
                .ok_or_else(|| FeedError::UnknownPool(replica_id.clone())),
        }
    }

    /// Check out a connection from the given pool
    pub async fn acquire(&self, id: &PoolId) -> Result<PoolGuard> {
        self.pool(id)?.acquire().await
    }

    /// Stats for every pool, write pool first
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        std::iter::once((WRITE_POOL.to_string(), self.write.stats()))
            .chain(
                self.replicas
                    .iter()
                    .map(|replica| (replica.id.clone(), replica.pool.stats())),
            )
            .collect()
    }

    pub fn log_stats(&self) {
        for (pool, stats) in self.stats() {
            info!(pool = %pool, stats = %stats, "connection pool stats");
        }
    }

    /// Housekeeping pass over every pool
    pub fn maintain(&self) {
        self.write.maintain();
        for replica in &self.replicas {
            replica.pool.maintain();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every pool. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.write.close();
        for replica in &self.replicas {
            replica.pool.close();
        }
        info!(replicas = self.replicas.len(), "all connection pools closed");
    }

    /// Spawn the background task that runs `maintain` every
    /// `housekeeping_interval` and `log_stats` every `stats_interval`.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        housekeeping_interval: Duration,
        stats_interval: Duration,
    ) -> MaintenanceWorker {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let pools = Arc::clone(self);

        let join_handle = tokio::spawn(async move {
            let mut housekeeping = tokio::time::interval(housekeeping_interval);
            let mut stats = tokio::time::interval(stats_interval);
            // Skip the immediate first ticks
            housekeeping.tick().await;
            stats.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = housekeeping.tick() => pools.maintain(),
                    _ = stats.tick() => pools.log_stats(),
                }
            }
        });

        MaintenanceWorker {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

impl Drop for PoolSet {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds a `PoolSet`, opening each pool once
#[derive(Default)]
pub struct PoolSetBuilder {
    write: Option<(PoolConfig, Arc<dyn NodeConnector>)>,
    replicas: Vec<(String, PoolConfig, Arc<dyn NodeConnector>)>,
}

impl PoolSetBuilder {
    pub fn write(mut self, config: PoolConfig, connector: Arc<dyn NodeConnector>) -> Self {
        self.write = Some((config, connector));
        self
    }

    pub fn replica(
        mut self,
        id: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn NodeConnector>,
    ) -> Self {
        self.replicas.push((id.into(), config, connector));
        self
    }

    pub async fn build(self) -> Result<PoolSet> {
        let (write_config, write_connector) = self
            .write
            .ok_or_else(|| FeedError::ConfigError("write pool is not configured".to_string()))?;

        if self.replicas.is_empty() {
            return Err(FeedError::ConfigError(
                "at least one read replica must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (id, _, _) in &self.replicas {
            if id.trim().is_empty() || id == WRITE_POOL {
                return Err(FeedError::ConfigError(format!(
                    "invalid replica id '{}'",
                    id
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(FeedError::ConfigError(format!(
                    "duplicate replica id '{}'",
                    id
                )));
            }
        }

        let write = ConnectionPool::new(WRITE_POOL, write_config, write_connector).await?;
        let mut replicas = Vec::with_capacity(self.replicas.len());
        for (id, config, connector) in self.replicas {
            let pool = ConnectionPool::new(id.clone(), config, connector).await?;
            replicas.push(ReplicaHandle { id, pool });
        }

        Ok(PoolSet {
            write,
            replicas,
            closed: AtomicBool::new(false),
        })
    }
}

/// Background pool housekeeping task
pub struct MaintenanceWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| FeedError::ExecutionError(format!("pool maintenance join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
