use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Instant;

/// Latency recorded for a replica whose probe failed.
///
/// Always loses a comparison against a measured latency.
pub const SENTINEL_LATENCY_MS: u64 = u64::MAX;

/// One probe result for one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub millis: u64,
    pub probed_at: Instant,
}

impl LatencySample {
    /// A successful measurement. Clamped below the sentinel.
    pub fn measured(millis: u64, probed_at: Instant) -> Self {
        Self {
            millis: millis.min(SENTINEL_LATENCY_MS - 1),
            probed_at,
        }
    }

    pub fn unreachable(probed_at: Instant) -> Self {
        Self {
            millis: SENTINEL_LATENCY_MS,
            probed_at,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        self.millis == SENTINEL_LATENCY_MS
    }
}

/// Immutable view of every replica's latency after one probe cycle
///
/// Entries keep replica configuration order, which is also the tie-break
/// order when picking the fastest replica.
#[derive(Debug, Clone, Default)]
pub struct LatencySnapshot {
    generation: u64,
    entries: Vec<(String, LatencySample)>,
}

impl LatencySnapshot {
    pub fn new(generation: u64, entries: Vec<(String, LatencySample)>) -> Self {
        Self {
            generation,
            entries,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot from plain millisecond values, all probed now
    pub fn from_millis<'a>(generation: u64, latencies: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        let now = Instant::now();
        Self::new(
            generation,
            latencies
                .into_iter()
                .map(|(id, millis)| {
                    let sample = if millis == SENTINEL_LATENCY_MS {
                        LatencySample::unreachable(now)
                    } else {
                        LatencySample::measured(millis, now)
                    };
                    (id.to_string(), sample)
                })
                .collect(),
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sample(&self, replica_id: &str) -> Option<&LatencySample> {
        self.entries
            .iter()
            .find(|(id, _)| id == replica_id)
            .map(|(_, sample)| sample)
    }

    pub fn latency_ms(&self, replica_id: &str) -> Option<u64> {
        self.sample(replica_id).map(|sample| sample.millis)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LatencySample)> {
        self.entries.iter().map(|(id, sample)| (id.as_str(), sample))
    }

    /// Replica with the strictly smallest latency; the first one wins ties.
    ///
    /// `None` when the snapshot is empty or every replica is unreachable.
    pub fn fastest(&self) -> Option<&str> {
        let mut best: Option<(&str, u64)> = None;
        for (id, sample) in &self.entries {
            if sample.is_unreachable() {
                continue;
            }
            match best {
                Some((_, best_ms)) if sample.millis >= best_ms => {}
                _ => best = Some((id.as_str(), sample.millis)),
            }
        }
        best.map(|(id, _)| id)
    }
}

/// Holder of the current snapshot
///
/// Publishing swaps the whole snapshot in one step; readers never block
/// and never see a partially updated set.
#[derive(Debug)]
pub struct SnapshotCell {
    current: ArcSwap<LatencySnapshot>,
}

impl SnapshotCell {
    pub fn new(initial: LatencySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<LatencySnapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: LatencySnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new(LatencySnapshot::empty())
    }
}
