use super::snapshot::{LatencySample, LatencySnapshot, SnapshotCell};
use crate::connection::pool::ConnectionPool;
use crate::connection::pool_set::PoolSet;
use crate::core::{FeedError, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Periodically measures the round trip time of every read replica and
/// publishes the results as a new `LatencySnapshot`.
///
/// The prober is the only writer of the snapshot cell.
pub struct LatencyProber {
    pools: Arc<PoolSet>,
    snapshots: Arc<SnapshotCell>,
    probe_timeout: Duration,
    generation: AtomicU64,
}

impl LatencyProber {
    pub fn new(pools: Arc<PoolSet>, snapshots: Arc<SnapshotCell>, probe_timeout: Duration) -> Self {
        Self {
            pools,
            snapshots,
            probe_timeout,
            generation: AtomicU64::new(0),
        }
    }

    /// Probe every replica once and publish the resulting snapshot.
    ///
    /// Replicas are probed concurrently. A failed or timed out probe yields
    /// the sentinel latency; no error escapes.
    pub async fn probe_once(&self) -> Arc<LatencySnapshot> {
        let previous = self.snapshots.load();
        let probes = self.pools.replicas().iter().map(|replica| async move {
            let sample = self.measure(replica.pool()).await;
            (replica.id().to_string(), sample)
        });
        let entries = join_all(probes).await;

        for (id, sample) in &entries {
            let was_reachable = previous
                .sample(id)
                .is_none_or(|previous| !previous.is_unreachable());
            if sample.is_unreachable() && was_reachable {
                warn!(replica = %id, "replica probe failed; marking as unreachable");
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = LatencySnapshot::new(generation, entries);
        debug!(
            generation,
            latencies = ?snapshot.iter().map(|(id, s)| (id, s.millis)).collect::<Vec<_>>(),
            "updated replica latencies"
        );

        self.snapshots.publish(snapshot);
        self.snapshots.load()
    }

    async fn measure(&self, pool: &ConnectionPool) -> LatencySample {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, async {
            let mut conn = pool.acquire().await?;
            conn.ping().await
        })
        .await
        .unwrap_or_else(|_| {
            Err(FeedError::ConnectionError(format!(
                "probe timed out after {:?}",
                self.probe_timeout
            )))
        });

        match outcome {
            Ok(()) => LatencySample::measured(started.elapsed().as_millis() as u64, started),
            Err(err) => {
                debug!(pool = %pool.name(), error = %err, "latency probe failed");
                LatencySample::unreachable(started)
            }
        }
    }

    /// Run `probe_once` immediately and then every `interval` until stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ProberHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                }
            }
        });

        ProberHandle {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

/// Handle to the background probing task
pub struct ProberHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ProberHandle {
    /// Signals the prober to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| FeedError::ExecutionError(format!("latency prober join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::PoolConfig;
    use crate::connection::memory::{MemoryNode, SocialStore};
    use crate::routing::snapshot::SENTINEL_LATENCY_MS;

    struct Fixture {
        pools: Arc<PoolSet>,
        read1: MemoryNode,
        read2: MemoryNode,
        read3: MemoryNode,
    }

    async fn fixture() -> Fixture {
        let store = SocialStore::new();
        let read1 = MemoryNode::replica("read1", Arc::clone(&store));
        let read2 = MemoryNode::replica("read2", Arc::clone(&store));
        let read3 = MemoryNode::replica("read3", Arc::clone(&store));
        let fast_fail = PoolConfig::default().connect_timeout(Duration::from_millis(100));

        let pools = PoolSet::builder()
            .write(
                PoolConfig::default(),
                Arc::new(MemoryNode::primary("write", store)),
            )
            .replica("read1", fast_fail.clone(), Arc::new(read1.clone()))
            .replica("read2", fast_fail.clone(), Arc::new(read2.clone()))
            .replica("read3", fast_fail, Arc::new(read3.clone()))
            .build()
            .await
            .unwrap();

        Fixture {
            pools: Arc::new(pools),
            read1,
            read2,
            read3,
        }
    }

    #[tokio::test]
    async fn test_probe_records_every_replica() {
        let fx = fixture().await;
        let cell = Arc::new(SnapshotCell::default());
        let prober = LatencyProber::new(Arc::clone(&fx.pools), Arc::clone(&cell), Duration::from_secs(1));

        fx.read1.set_delay(Duration::from_millis(40));
        fx.read3.set_failing(true);

        let snapshot = prober.probe_once().await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.generation(), 1);
        assert!(snapshot.latency_ms("read1").unwrap() >= 40);
        assert!(snapshot.latency_ms("read2").unwrap() < SENTINEL_LATENCY_MS);
        assert_eq!(snapshot.latency_ms("read3"), Some(SENTINEL_LATENCY_MS));
        assert_eq!(snapshot.fastest(), Some("read2"));
    }

    #[tokio::test]
    async fn test_unreachable_replica_gets_sentinel() {
        let fx = fixture().await;
        let cell = Arc::new(SnapshotCell::default());
        let prober = LatencyProber::new(Arc::clone(&fx.pools), Arc::clone(&cell), Duration::from_secs(1));

        fx.read2.set_unreachable(true);
        let snapshot = prober.probe_once().await;
        assert_eq!(snapshot.latency_ms("read2"), Some(SENTINEL_LATENCY_MS));
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn test_slow_probe_times_out_to_sentinel() {
        let fx = fixture().await;
        let cell = Arc::new(SnapshotCell::default());
        let prober =
            LatencyProber::new(Arc::clone(&fx.pools), Arc::clone(&cell), Duration::from_millis(50));

        fx.read1.set_delay(Duration::from_millis(500));
        let snapshot = prober.probe_once().await;
        assert_eq!(snapshot.latency_ms("read1"), Some(SENTINEL_LATENCY_MS));
    }

    #[tokio::test]
    async fn test_spawned_prober_publishes_and_stops() {
        let fx = fixture().await;
        let cell = Arc::new(SnapshotCell::default());
        let prober = Arc::new(LatencyProber::new(
            Arc::clone(&fx.pools),
            Arc::clone(&cell),
            Duration::from_secs(1),
        ));

        let handle = prober.spawn(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await.unwrap();

        let generation = cell.load().generation();
        assert!(generation >= 2, "expected several probe cycles, got {}", generation);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cell.load().generation(), generation);
    }
}
