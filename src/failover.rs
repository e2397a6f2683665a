//! Primary election, promotion and redundancy recovery.
//!
//! Roles are eventually consistent: each replica holds its own belief and no
//! lock spans members. A promotion inserts a marker at the head of the new
//! Primary's undispatched entries so the client can see the handover.

use crate::error::Result;
use crate::queue::{QueueImage, Replica, ReplicaSet};
use crate::subscriptions::SubscriptionId;
use crate::types::{MemberId, QueueEvent, Role};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Outcome of handling a member failure for one subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Promotion {
    pub subscription: SubscriptionId,
    pub previous: MemberId,
    /// None when no live replica was left to promote.
    pub promoted: Option<MemberId>,
}

/// Elects and promotes Primaries. Lowest live member id wins.
#[derive(Debug, Default)]
pub struct FailoverController {
    promotions: AtomicU64,
}

impl FailoverController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of promotions performed.
    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    /// Return the live Primary, electing one if there is none.
    pub fn elect(&self, set: &ReplicaSet) -> Option<Replica> {
        if let Some(primary) = set.primary() {
            return Some(primary);
        }

        let candidate = set.replicas().into_iter().find(|r| r.is_live());
        match candidate {
            Some(replica) => {
                self.promote(set, &replica);
                Some(replica)
            }
            None => {
                warn!(subscription = %set.id(), "no live replica to elect as primary");
                None
            }
        }
    }

    /// Make `replica` Primary and mark the continuity boundary.
    pub fn promote(&self, set: &ReplicaSet, replica: &Replica) {
        replica.queue.set_role(Role::Primary);
        let marker = QueueEvent::marker(replica.member_id(), replica.member.next_marker_sequence());
        replica.queue.insert_marker(marker);
        self.promotions.fetch_add(1, Ordering::Relaxed);

        info!(
            subscription = %set.id(),
            member = %replica.member_id(),
            pending = replica.queue.undispatched_len(),
            "promoted replica to primary"
        );
    }

    /// React to `failed` going down. Only matters where it was Primary.
    pub fn handle_member_failure(&self, set: &ReplicaSet, failed: MemberId) -> Option<Promotion> {
        let replica = set.get(failed)?;
        if replica.role() != Role::Primary || set.primary().is_some() {
            return None;
        }

        let promoted = self.elect(set).map(|r| r.member_id());
        Some(Promotion {
            subscription: set.id(),
            previous: failed,
            promoted,
        })
    }

    /// Bring a recovered replica back as a Secondary with fresh contents.
    ///
    /// If no live Primary remains, an election runs afterwards and may pick
    /// the recovered replica.
    pub fn handle_member_recovery(&self, set: &ReplicaSet, recovered: &Replica) -> Result<usize> {
        recovered.queue.set_role(Role::Secondary);
        recovered.queue.clear();
        let seeded = self.seed_from_peers(set, recovered)?;

        if set.primary().is_none() {
            self.elect(set);
        }
        Ok(seeded)
    }

    /// Seed `target` from an image of the Primary (or the lowest live peer).
    ///
    /// `target` must already be in the set so it receives new events while
    /// the image is in flight.
    pub fn seed_from_peers(&self, set: &ReplicaSet, target: &Replica) -> Result<usize> {
        let source = set
            .primary()
            .filter(|p| p.member_id() != target.member_id())
            .or_else(|| set.live_peers(target.member_id()).into_iter().next());

        let source = match source {
            Some(source) => source,
            None => {
                debug!(
                    subscription = %set.id(),
                    member = %target.member_id(),
                    "no peer to copy queue image from"
                );
                return Ok(0);
            }
        };

        let image = QueueImage {
            subscription: set.id().0,
            source: source.member_id(),
            events: source.queue.image_events(),
        };
        let frame = image.encode()?;
        let received = QueueImage::decode(&frame)?;
        let seeded = target.queue.seed(received.events)?;

        debug!(
            subscription = %set.id(),
            from = %source.member_id(),
            to = %target.member_id(),
            bytes = frame.len(),
            seeded,
            "seeded replica from queue image"
        );
        Ok(seeded)
    }
}
