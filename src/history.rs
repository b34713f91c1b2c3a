//! Bounded per-market probability history.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::lmsr_core::{self, Pools, Probabilities};

/// Default number of snapshots kept per market.
pub const HISTORY_LIMIT: usize = 40;

/// Remote snapshots closer than this to a local one may be duplicates.
pub const DEDUP_WINDOW_MS: i64 = 2000;
/// Per-outcome probability distance under which two snapshots match.
pub const DEDUP_PROB_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub probabilities: Probabilities,
}

impl MarketSnapshot {
    /// Snapshot of the spot prices implied by `pools`.
    pub fn from_pools(pools: &Pools, timestamp: i64) -> Self {
        let b = lmsr_core::liquidity_b_for(pools);
        Self {
            timestamp,
            probabilities: lmsr_core::prices(pools, b),
        }
    }

    pub fn is_duplicate_of(&self, other: &MarketSnapshot) -> bool {
        let p = &self.probabilities;
        let q = &other.probabilities;
        (self.timestamp - other.timestamp).abs() < DEDUP_WINDOW_MS
            && (p.home - q.home).abs() < DEDUP_PROB_EPSILON
            && (p.draw - q.draw).abs() < DEDUP_PROB_EPSILON
            && (p.away - q.away).abs() < DEDUP_PROB_EPSILON
    }
}

/// Where a held snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOrigin {
    /// Recorded here after an optimistic mutation.
    Local,
    /// Received from the authoritative store.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Entry {
    snapshot: MarketSnapshot,
    origin: SnapshotOrigin,
}

/// FIFO ring of snapshots; the oldest entry is evicted once `capacity` is hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    capacity: usize,
    entries: VecDeque<Entry>,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_LIMIT)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, snapshot: MarketSnapshot, origin: SnapshotOrigin) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry { snapshot, origin });
    }

    /// Append a locally generated snapshot.
    pub fn record(&mut self, snapshot: MarketSnapshot) {
        self.push(snapshot, SnapshotOrigin::Local);
    }

    /// Append a snapshot computed from post-mutation pools.
    pub fn record_pools(&mut self, pools: &Pools, timestamp: i64) -> MarketSnapshot {
        let snapshot = MarketSnapshot::from_pools(pools, timestamp);
        self.record(snapshot);
        snapshot
    }

    /// Merge a snapshot pushed by the authoritative store.
    ///
    /// Returns `false` when it duplicates a locally recorded entry, i.e. the
    /// optimistic snapshot of the same trade. Remote entries are never
    /// compared with each other.
    pub fn ingest_remote(&mut self, snapshot: MarketSnapshot) -> bool {
        let duplicate = self
            .entries
            .iter()
            .filter(|e| e.origin == SnapshotOrigin::Local)
            .any(|e| e.snapshot.is_duplicate_of(&snapshot));
        if duplicate {
            return false;
        }
        self.push(snapshot, SnapshotOrigin::Remote);
        true
    }

    /// Replace the contents with store-provided `snapshots`, keeping the newest `capacity` in time order.
    pub fn replace(&mut self, mut snapshots: Vec<MarketSnapshot>) {
        snapshots.sort_by_key(|s| s.timestamp);
        let skip = snapshots.len().saturating_sub(self.capacity);
        self.entries = snapshots
            .into_iter()
            .skip(skip)
            .map(|snapshot| Entry {
                snapshot,
                origin: SnapshotOrigin::Remote,
            })
            .collect();
    }

    pub fn latest(&self) -> Option<&MarketSnapshot> {
        self.entries.back().map(|e| &e.snapshot)
    }

    pub fn latest_origin(&self) -> Option<SnapshotOrigin> {
        self.entries.back().map(|e| e.origin)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarketSnapshot> {
        self.entries.iter().map(|e| &e.snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
