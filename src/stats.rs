//! Per-replica counters exposed to operational tooling.
//!
//! Counters are monotonic for the lifetime of a replica queue and are never
//! reset by role changes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a replica queue.
#[derive(Debug, Default)]
pub struct ReplicaStats {
    events_enqueued: AtomicU64,
    events_dispatched: AtomicU64,
    events_removed_by_qrm: AtomicU64,
    events_dropped: AtomicU64,
    markers_inserted: AtomicU64,
}

impl ReplicaStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removed_by_qrm(&self, count: u64) {
        self.events_removed_by_qrm.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_marker(&self) {
        self.markers_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    pub fn events_removed_by_qrm(&self) -> u64 {
        self.events_removed_by_qrm.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_removed_by_qrm: self.events_removed_by_qrm.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            markers_inserted: self.markers_inserted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a replica's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_enqueued: u64,
    /// Meaningful while the replica is Primary. Includes markers.
    pub events_dispatched: u64,
    /// Meaningful while the replica is Secondary.
    pub events_removed_by_qrm: u64,
    pub events_dropped: u64,
    pub markers_inserted: u64,
}

/// Counters kept by the QRM coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrmStats {
    pub broadcasts: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
}
