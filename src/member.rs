//! Hosting members and the replica queues they own.

use crate::queue::ReplicaQueue;
use crate::subscriptions::SubscriptionId;
use crate::types::MemberId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A server process hosting replica queues.
///
/// Only the member itself mutates its queues' entry sequences; other members
/// reach them through QRM and image transfer.
pub struct Member {
    id: MemberId,
    live: AtomicBool,
    next_marker: AtomicU64,
    replicas: RwLock<HashMap<SubscriptionId, Arc<ReplicaQueue>>>,
    /// Subscriptions released while this member was down.
    stale: RwLock<BTreeSet<SubscriptionId>>,
}

impl Member {
    pub fn new(id: MemberId) -> Self {
        Self {
            id,
            live: AtomicBool::new(true),
            next_marker: AtomicU64::new(1),
            replicas: RwLock::new(HashMap::new()),
            stale: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    /// Next sequence for a marker inserted by this member.
    pub fn next_marker_sequence(&self) -> u64 {
        self.next_marker.fetch_add(1, Ordering::SeqCst)
    }

    pub fn attach(&self, queue: Arc<ReplicaQueue>) {
        self.replicas.write().insert(queue.subscription_id(), queue);
    }

    pub fn detach(&self, subscription: SubscriptionId) -> Option<Arc<ReplicaQueue>> {
        self.replicas.write().remove(&subscription)
    }

    pub fn replica(&self, subscription: SubscriptionId) -> Option<Arc<ReplicaQueue>> {
        self.replicas.read().get(&subscription).cloned()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }

    /// Remember a subscription to release once this member is reachable again.
    pub(crate) fn mark_stale(&self, subscription: SubscriptionId) {
        self.stale.write().insert(subscription);
    }

    /// Release every queue whose subscription went away while this member was down.
    pub(crate) fn purge_stale(&self) -> usize {
        let stale: Vec<SubscriptionId> = std::mem::take(&mut *self.stale.write())
            .into_iter()
            .collect();
        let mut purged = 0;
        for id in stale {
            if let Some(queue) = self.detach(id) {
                queue.release();
                purged += 1;
            }
        }
        purged
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("replicas", &self.replica_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::subscriptions::{Subscription, SubscriptionConfig};
    use crate::types::Role;

    #[test]
    fn test_marker_sequences_increase() {
        let member = Member::new(MemberId(1));
        assert_eq!(member.next_marker_sequence(), 1);
        assert_eq!(member.next_marker_sequence(), 2);
    }

    #[test]
    fn test_purge_stale() {
        let member = Member::new(MemberId(1));
        let sub = Arc::new(Subscription::new(
            SubscriptionId(5),
            SubscriptionConfig::new("c", &QueueConfig::default()),
        ));
        member.attach(Arc::new(ReplicaQueue::new(sub, MemberId(1), Role::Secondary)));

        member.mark_stale(SubscriptionId(5));
        member.mark_stale(SubscriptionId(6));
        assert_eq!(member.purge_stale(), 1);
        assert_eq!(member.replica_count(), 0);
        assert_eq!(member.purge_stale(), 0);
    }
}
