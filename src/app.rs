//! Wiring of one feed node: pools, prober, router, workers, service and writer.

use crate::broker::{ConsumerHandle, ConsumerOptions, MessageBroker};
use crate::config::AppConfig;
use crate::connection::NodeConnector;
use crate::connection::config::PoolConfig;
use crate::connection::pool_set::{MaintenanceWorker, PoolSet, WRITE_POOL};
use crate::core::Result;
use crate::feed::{FeedCache, FeedService, FeedServiceOptions, FeedWorker, PostWriter};
use crate::routing::{LatencyProber, ProberHandle, Router, SnapshotCell};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Background tasks owned by a running node
struct Background {
    prober: ProberHandle,
    maintenance: MaintenanceWorker,
    workers: Vec<ConsumerHandle>,
}

/// A running feed node
pub struct FeedNode {
    config: AppConfig,
    pools: Arc<PoolSet>,
    snapshots: Arc<SnapshotCell>,
    prober: Arc<LatencyProber>,
    router: Arc<Router>,
    workers: Vec<Arc<FeedWorker>>,
    service: Arc<FeedService>,
    writer: Arc<PostWriter>,
    background: Mutex<Option<Background>>,
}

impl FeedNode {
    /// Open every pool, take a first latency measurement and start the
    /// background tasks.
    ///
    /// `connector` is asked once per pool, with the pool name (`"write"` or
    /// the replica id) and its settings.
    pub async fn start<C>(config: AppConfig, connector: C, broker: Arc<dyn MessageBroker>) -> Result<Self>
    where
        C: Fn(&str, &PoolConfig) -> Result<Arc<dyn NodeConnector>>,
    {
        let mut builder = PoolSet::builder().write(config.write.clone(), connector(WRITE_POOL, &config.write)?);
        for (id, pool_config) in &config.replicas {
            builder = builder.replica(id, pool_config.clone(), connector(id, pool_config)?);
        }
        let pools = Arc::new(builder.build().await?);

        let snapshots = Arc::new(SnapshotCell::default());
        let prober = Arc::new(LatencyProber::new(
            Arc::clone(&pools),
            Arc::clone(&snapshots),
            config.probe_timeout,
        ));
        prober.probe_once().await;

        let router = Arc::new(
            Router::new(Arc::clone(&pools), Arc::clone(&snapshots))
                .with_default_replica(&config.default_replica)?,
        );

        let workers: Vec<_> = (0..config.workers)
            .map(|index| {
                Arc::new(FeedWorker::new(
                    format!("{}-worker-{}", config.instance, index),
                    Arc::clone(&router),
                    Arc::clone(&broker),
                    config.wire_format,
                    config.queues.clone(),
                    config.max_page_size,
                ))
            })
            .collect();

        let cache = FeedCache::new(config.cache_capacity, config.cache_ttl)?;
        let service = Arc::new(FeedService::start(
            Arc::clone(&broker),
            config.wire_format,
            config.queues.clone(),
            cache,
            FeedServiceOptions {
                instance: config.instance.clone(),
                response_timeout: config.response_timeout,
                max_page_size: config.max_page_size,
                consumer: ConsumerOptions::default(),
            },
        ));

        let writer = Arc::new(PostWriter::new(
            Arc::clone(&router),
            Arc::clone(&broker),
            config.wire_format,
            config.queues.clone(),
        ));

        let background = Background {
            prober: Arc::clone(&prober).spawn(config.probe_interval),
            maintenance: pools.spawn_maintenance(config.housekeeping_interval, config.stats_interval),
            workers: workers
                .iter()
                .map(|worker| Arc::clone(worker).spawn(ConsumerOptions::default()))
                .collect(),
        };

        info!(
            instance = %config.instance,
            replicas = config.replicas.len(),
            workers = config.workers,
            wire_format = %config.wire_format,
            "feed node started"
        );

        Ok(Self {
            config,
            pools,
            snapshots,
            prober,
            router,
            workers,
            service,
            writer,
            background: Mutex::new(Some(background)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCell> {
        &self.snapshots
    }

    pub fn prober(&self) -> &Arc<LatencyProber> {
        &self.prober
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn workers(&self) -> &[Arc<FeedWorker>] {
        &self.workers
    }

    pub fn service(&self) -> &Arc<FeedService> {
        &self.service
    }

    pub fn writer(&self) -> &Arc<PostWriter> {
        &self.writer
    }

    /// Stop every background task and close the pools. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let background = self.background.lock()?.take();
        let Some(background) = background else {
            return Ok(());
        };

        self.service.shutdown().await?;
        for worker in background.workers {
            worker.stop().await?;
        }
        background.prober.stop().await?;
        background.maintenance.stop().await?;
        self.pools.close();

        info!(instance = %self.config.instance, "feed node stopped");
        Ok(())
    }
}
