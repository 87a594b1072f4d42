use anyhow::{Context, Result};
use clap::Parser;
use replifeed::{
    AppConfig, FeedError, FeedNode, InMemoryBroker, MemoryNode, MessageBroker, NodeConnector,
    SocialStore, UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Runs a feed node against an in-memory cluster seeded with a small social graph
#[derive(Parser, Debug)]
#[command(name = "replifeed")]
#[command(about = "Latency-routed friend feed demo over an in-memory cluster")]
struct Args {
    /// Users in the seeded social graph
    #[arg(long, default_value_t = 20)]
    users: i64,

    /// Feed requests to serve before exiting; 0 runs until Ctrl-C
    #[arg(long, default_value_t = 0)]
    rounds: u64,

    /// Pause between feed requests
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Page size of each feed request
    #[arg(long, default_value_t = 10)]
    page_size: u32,

    /// Replica to slow down, to watch reads move away from it
    #[arg(long)]
    slow_replica: Option<String>,

    /// Delay added to every statement on the slow replica
    #[arg(long, default_value_t = 50)]
    slow_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let store = seed(args.users.max(3));

    let mut nodes = HashMap::new();
    nodes.insert("write".to_string(), MemoryNode::primary("write", Arc::clone(&store)));
    for (id, _) in &config.replicas {
        nodes.insert(id.clone(), MemoryNode::replica(id.clone(), Arc::clone(&store)));
    }
    if let Some(slow) = &args.slow_replica {
        let node = nodes
            .get(slow)
            .with_context(|| format!("unknown replica '{}'", slow))?;
        node.set_delay(Duration::from_millis(args.slow_ms));
    }

    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let node = FeedNode::start(
        config,
        |name, _config| {
            let node = nodes
                .get(name)
                .cloned()
                .ok_or_else(|| FeedError::UnknownPool(name.to_string()))?;
            let connector: Arc<dyn NodeConnector> = Arc::new(node);
            Ok(connector)
        },
        broker,
    )
    .await
    .context("failed to start feed node")?;

    tokio::select! {
        _ = serve(&node, &args) => {}
        _ = shutdown_signal() => info!("shutdown requested"),
    }

    node.shutdown().await.context("failed to stop feed node")?;
    Ok(())
}

/// Ring-shaped friend graph where every user also follows the user two ahead
fn seed(users: i64) -> Arc<SocialStore> {
    let store = SocialStore::new();
    for user in 1..=users {
        store.add_friend(user, user % users + 1);
        store.add_friend(user, (user + 1) % users + 1);
        store.insert_post(user, &format!("hello from user {}", user));
    }
    info!(users, posts = store.post_count(), "seeded social graph");
    store
}

async fn serve(node: &FeedNode, args: &Args) {
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut round = 0u64;

    while args.rounds == 0 || round < args.rounds {
        ticker.tick().await;
        let user: UserId = (round as i64) % args.users.max(3) + 1;

        if round % 5 == 4 {
            let content = format!("update {} from user {}", round, user);
            if let Err(err) = node.writer().create_post(user, &content).await {
                warn!(user, error = %err, "failed to create post");
            }
        }

        match node.service().get_feed(user, 0, args.page_size).await {
            Ok(feed) => info!(
                user,
                posts = feed.posts.len(),
                total = feed.total_elements,
                newest = feed.posts.first().map(|post| post.content.as_str()).unwrap_or("-"),
                "served feed"
            ),
            Err(err) => error!(user, error = %err, "feed request failed"),
        }

        if round % 10 == 9 {
            let snapshot = node.snapshots().load();
            for (replica, sample) in snapshot.iter() {
                info!(replica, latency_ms = sample.millis, "replica latency");
            }
            let stats = node.service().cache_stats();
            info!(entries = stats.entries, hits = stats.hits, misses = stats.misses, "feed cache");
        }
        round += 1;
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("replifeed=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to install ctrl+c handler");
        std::future::pending::<()>().await;
    }
}
