//! Latency-aware routing of database operations between the write node and
//! the read replicas.

pub mod prober;
pub mod router;
pub mod snapshot;

pub use prober::{LatencyProber, ProberHandle};
pub use router::{Router, RoutingDecision};
pub use snapshot::{LatencySample, LatencySnapshot, SENTINEL_LATENCY_MS, SnapshotCell};
