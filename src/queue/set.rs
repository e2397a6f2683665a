//! The redundancy set of a subscription: one replica per hosting member.

use super::ReplicaQueue;
use crate::member::Member;
use crate::subscriptions::{Subscription, SubscriptionId};
use crate::types::{MemberId, Role};
use parking_lot::RwLock;
use std::sync::Arc;

/// A replica queue together with the member hosting it.
#[derive(Clone, Debug)]
pub struct Replica {
    pub member: Arc<Member>,
    pub queue: Arc<ReplicaQueue>,
}

impl Replica {
    pub fn member_id(&self) -> MemberId {
        self.member.id()
    }

    pub fn is_live(&self) -> bool {
        self.member.is_live()
    }

    pub fn role(&self) -> Role {
        self.queue.role()
    }
}

/// All replicas of one subscription, ordered by member id.
pub struct ReplicaSet {
    subscription: Arc<Subscription>,
    replicas: RwLock<Vec<Replica>>,
}

impl ReplicaSet {
    pub fn new(subscription: Arc<Subscription>) -> Self {
        Self {
            subscription,
            replicas: RwLock::new(Vec::new()),
        }
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id
    }

    /// Add a replica, replacing any previous one on the same member.
    pub fn add(&self, replica: Replica) {
        let mut replicas = self.replicas.write();
        replicas.retain(|r| r.member_id() != replica.member_id());
        replicas.push(replica);
        replicas.sort_by_key(|r| r.member_id());
    }

    pub fn remove(&self, member: MemberId) -> Option<Replica> {
        let mut replicas = self.replicas.write();
        let pos = replicas.iter().position(|r| r.member_id() == member)?;
        Some(replicas.remove(pos))
    }

    pub fn replicas(&self) -> Vec<Replica> {
        self.replicas.read().clone()
    }

    pub fn get(&self, member: MemberId) -> Option<Replica> {
        self.replicas
            .read()
            .iter()
            .find(|r| r.member_id() == member)
            .cloned()
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.get(member).is_some()
    }

    /// The live replica acting as Primary. During a dual-Primary window the
    /// lowest member id wins.
    pub fn primary(&self) -> Option<Replica> {
        self.replicas
            .read()
            .iter()
            .find(|r| r.is_live() && r.role() == Role::Primary)
            .cloned()
    }

    /// Live replicas other than `except`.
    pub fn live_peers(&self, except: MemberId) -> Vec<Replica> {
        self.replicas
            .read()
            .iter()
            .filter(|r| r.member_id() != except && r.is_live())
            .cloned()
            .collect()
    }

    /// Live Secondaries, lowest member id first.
    pub fn live_secondaries(&self) -> Vec<Replica> {
        self.replicas
            .read()
            .iter()
            .filter(|r| r.is_live() && r.role() == Role::Secondary)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("subscription", &self.subscription.id)
            .field("replicas", &self.len())
            .finish()
    }
}
