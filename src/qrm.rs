//! Queue-removal messages from the Primary to its peers.
//!
//! Broadcasts are fire-and-forget. A message to a member that is down is
//! dropped, never retried; a peer promoted later may therefore still hold a
//! few entries its client already saw, which the client absorbs by identity.

use crate::queue::ReplicaSet;
use crate::stats::QrmStats;
use crate::types::{EventIdentity, MemberId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Sends dispatched identities to every other replica of a subscription.
#[derive(Debug, Default)]
pub struct QrmCoordinator {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    /// Fault injection: number of upcoming broadcasts to lose entirely.
    lose_next: AtomicU64,
}

impl QrmCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lose the next `count` broadcasts, as if the network dropped them.
    pub fn lose_next_broadcasts(&self, count: u64) {
        self.lose_next.store(count, Ordering::SeqCst);
    }

    fn take_loss(&self) -> bool {
        self.lose_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Broadcast `identities` from `sender` to the other replicas in `set`.
    ///
    /// Returns the number of replicas that applied the message. Peers that
    /// also believe they are Primary still apply it; removal is idempotent.
    pub fn broadcast_removal(
        &self,
        set: &ReplicaSet,
        sender: MemberId,
        identities: &[EventIdentity],
    ) -> usize {
        if identities.is_empty() {
            return 0;
        }
        self.broadcasts.fetch_add(1, Ordering::Relaxed);

        let peers: Vec<_> = set
            .replicas()
            .into_iter()
            .filter(|r| r.member_id() != sender)
            .collect();

        if self.take_loss() {
            self.dropped.fetch_add(peers.len() as u64, Ordering::Relaxed);
            warn!(
                subscription = %set.id(),
                member = %sender,
                events = identities.len(),
                "queue removal broadcast lost"
            );
            return 0;
        }

        let batch: HashSet<EventIdentity> = identities.iter().cloned().collect();
        let mut delivered = 0;
        for peer in peers {
            if !peer.is_live() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subscription = %set.id(),
                    member = %peer.member_id(),
                    "dropping queue removal for unreachable member"
                );
                continue;
            }
            let removed = peer.queue.apply_qrm(&batch);
            debug!(
                subscription = %set.id(),
                from = %sender,
                to = %peer.member_id(),
                requested = batch.len(),
                removed,
                "applied queue removal"
            );
            delivered += 1;
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> QrmStats {
        QrmStats {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            messages_delivered: self.delivered.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
