//! Conversion of storage-engine mutations into queue events.

use crate::subscriptions::SubscriptionRegistry;
use crate::types::{EventIdentity, MemberId, OperationKind, PayloadRef, QueueEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Assigns event identities and fans events out to matching replicas.
///
/// Expiration-driven destroys arrive through the same call as user destroys.
pub struct EventSourceAdapter {
    registry: Arc<SubscriptionRegistry>,
    /// Next sequence per producing member. Each counter's lock is held through
    /// fan-out so one producer's events reach every queue in sequence order.
    sequences: Mutex<HashMap<MemberId, Arc<Mutex<u64>>>>,
}

impl EventSourceAdapter {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    fn counter(&self, member: MemberId) -> Arc<Mutex<u64>> {
        Arc::clone(
            self.sequences
                .lock()
                .entry(member)
                .or_insert_with(|| Arc::new(Mutex::new(0))),
        )
    }

    /// Publish a mutation. Never fails; with no matching subscription the
    /// identity is still consumed and nothing is queued.
    pub fn publish(
        &self,
        region: &str,
        key: &str,
        op: OperationKind,
        payload: Option<PayloadRef>,
        producing_member: MemberId,
    ) -> EventIdentity {
        let counter = self.counter(producing_member);
        let mut next = counter.lock();
        *next += 1;
        let identity = EventIdentity::new(producing_member, region, *next);

        let targets = self.registry.matching(region, key);
        if targets.is_empty() {
            debug!(region, key, ?identity, "no subscription matches mutation");
            return identity;
        }

        let event = Arc::new(QueueEvent::operation(identity.clone(), key, op, payload));
        for set in targets {
            for replica in set.replicas() {
                // A member that is down misses the event; it is reseeded on recovery.
                if replica.is_live() {
                    replica.queue.append(Arc::clone(&event));
                }
            }
        }

        identity
    }

    /// Last sequence assigned for a producer (0 if none).
    pub fn last_sequence(&self, producing_member: MemberId) -> u64 {
        self.sequences
            .lock()
            .get(&producing_member)
            .map(|c| *c.lock())
            .unwrap_or(0)
    }
}
