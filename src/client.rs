//! Client-side duplicate detection.
//!
//! After a failover the new Primary may resend entries its predecessor had
//! already delivered. The client drops them by identity: per producer it keeps
//! the highest sequence seen plus a window of recent sequences, so a replay
//! can be told apart from a reordering.

use crate::types::{MemberId, QueueEvent};
use lru::LruCache;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;

/// Recent sequences remembered per producer.
const RECENT_WINDOW: usize = 1024;

/// Classification of a received event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    Fresh,
    /// Already seen; safe to discard.
    Duplicate,
    /// Continuity boundary from a newly promoted Primary.
    Marker,
    /// Lower than the last sequence from this producer but never seen. The
    /// protocol never reorders one producer's events, so this is a fault.
    OutOfOrder { last_seen: u64 },
}

/// Running counts kept by a tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub fresh: u64,
    pub duplicates: u64,
    pub markers: u64,
    pub out_of_order: u64,
}

#[derive(Debug, Default)]
struct ProducerStream {
    last: u64,
    /// Everything at or below this was applied through a resync.
    floor: u64,
    recent: BTreeSet<u64>,
}

impl ProducerStream {
    fn remember(&mut self, sequence: u64) {
        self.recent.insert(sequence);
        if self.recent.len() > RECENT_WINDOW {
            self.recent.pop_first();
        }
        self.last = self.last.max(sequence);
    }

    fn classify(&self, sequence: u64) -> Observation {
        if sequence > self.last {
            return Observation::Fresh;
        }
        let below_window = self.recent.len() == RECENT_WINDOW
            && self.recent.first().map_or(false, |oldest| sequence < *oldest);
        if sequence <= self.floor || below_window || self.recent.contains(&sequence) {
            Observation::Duplicate
        } else {
            Observation::OutOfOrder {
                last_seen: self.last,
            }
        }
    }
}

/// Remembers recent sequences per producer, bounded by an LRU of producers.
pub struct ClientEventTracker {
    streams: LruCache<MemberId, ProducerStream>,
    stats: TrackerStats,
}

impl ClientEventTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            streams: LruCache::new(capacity),
            stats: TrackerStats::default(),
        }
    }

    /// Classify an event and remember it if fresh.
    pub fn observe(&mut self, event: &QueueEvent) -> Observation {
        if event.is_marker() {
            self.stats.markers += 1;
            return Observation::Marker;
        }

        let producer = event.identity.producing_member;
        let sequence = event.identity.sequence;
        let stream = self
            .streams
            .get_or_insert_mut(producer, ProducerStream::default);

        let observation = stream.classify(sequence);
        match observation {
            Observation::Fresh => {
                stream.remember(sequence);
                self.stats.fresh += 1;
            }
            Observation::OutOfOrder { .. } => {
                stream.remember(sequence);
                self.stats.out_of_order += 1;
            }
            Observation::Duplicate => self.stats.duplicates += 1,
            Observation::Marker => {}
        }
        observation
    }

    /// Record that a full-image resync covered everything up to `sequence`.
    pub fn resync(&mut self, producer: MemberId, sequence: u64) {
        let stream = self
            .streams
            .get_or_insert_mut(producer, ProducerStream::default);
        stream.floor = stream.floor.max(sequence);
        stream.last = stream.last.max(sequence);
    }

    pub fn last_sequence(&mut self, producer: MemberId) -> Option<u64> {
        self.streams.get(&producer).map(|s| s.last)
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }
}
