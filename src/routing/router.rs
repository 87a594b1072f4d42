use super::snapshot::SnapshotCell;
use crate::connection::pool::{ConnectionPool, PoolGuard};
use crate::connection::pool_set::{PoolId, PoolSet};
use crate::core::{FeedError, Result, TxMode};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Where one database operation goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    Write,
    Read(String),
}

impl RoutingDecision {
    pub fn pool_id(&self) -> PoolId {
        match self {
            RoutingDecision::Write => PoolId::Write,
            RoutingDecision::Read(id) => PoolId::Replica(id.clone()),
        }
    }
}

impl fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingDecision::Write => f.write_str("write"),
            RoutingDecision::Read(id) => write!(f, "read:{}", id),
        }
    }
}

/// Latency-aware read/write router
///
/// Read-write operations always go to the single write pool. Read-only
/// operations go to the replica with the lowest latency in the most recently
/// published snapshot, or to the default replica when no replica has a
/// usable measurement. Reads never fall back to the write pool.
pub struct Router {
    pools: Arc<PoolSet>,
    snapshots: Arc<SnapshotCell>,
    default_replica: String,
}

impl Router {
    /// Router whose fallback is the first configured replica
    pub fn new(pools: Arc<PoolSet>, snapshots: Arc<SnapshotCell>) -> Self {
        let default_replica = pools
            .replicas()
            .first()
            .map(|replica| replica.id().to_string())
            .unwrap_or_default();
        Self {
            pools,
            snapshots,
            default_replica,
        }
    }

    /// Override the fallback replica
    pub fn with_default_replica(mut self, replica_id: &str) -> Result<Self> {
        if self.pools.replica(replica_id).is_none() {
            return Err(FeedError::UnknownPool(replica_id.to_string()));
        }
        self.default_replica = replica_id.to_string();
        Ok(self)
    }

    pub fn default_replica(&self) -> &str {
        &self.default_replica
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    /// Pick a target for an operation in the given transaction mode
    pub fn decide(&self, mode: TxMode) -> RoutingDecision {
        let decision = match mode {
            TxMode::ReadWrite => RoutingDecision::Write,
            TxMode::ReadOnly => {
                let snapshot = self.snapshots.load();
                let replica = snapshot
                    .fastest()
                    .filter(|id| self.pools.replica(id).is_some())
                    .unwrap_or(self.default_replica.as_str());
                RoutingDecision::Read(replica.to_string())
            }
        };
        debug!(?mode, decision = %decision, "routed operation");
        decision
    }

    /// Pool handle for an operation in the given transaction mode
    pub fn route(&self, mode: TxMode) -> Result<&ConnectionPool> {
        self.pools.pool(&self.decide(mode).pool_id())
    }

    /// Check out a connection for an operation in the given transaction mode
    pub async fn acquire(&self, mode: TxMode) -> Result<PoolGuard> {
        self.route(mode)?.acquire().await
    }
}
