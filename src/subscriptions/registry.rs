//! Registry of client subscriptions and their replica sets.

use crate::error::{QueueError, Result};
use crate::queue::ReplicaSet;
use crate::types::ClientId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::types::{Subscription, SubscriptionConfig, SubscriptionId};

/// Tracks registered clients. One subscription per client id.
pub struct SubscriptionRegistry {
    /// Replica sets by subscription ID.
    sets: RwLock<HashMap<SubscriptionId, Arc<ReplicaSet>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a subscription with an empty replica set.
    pub fn register(&self, config: SubscriptionConfig) -> Result<Arc<ReplicaSet>> {
        self.register_with(config, |_| {})
    }

    /// Create a subscription and let `populate` fill its replica set before
    /// publishers can see it.
    ///
    /// The registry is write-locked throughout, so `populate` must not call
    /// back into it.
    pub fn register_with<F>(&self, config: SubscriptionConfig, populate: F) -> Result<Arc<ReplicaSet>>
    where
        F: FnOnce(&Arc<ReplicaSet>),
    {
        let mut sets = self.sets.write();
        if sets
            .values()
            .any(|set| set.subscription().client_id() == &config.client_id)
        {
            return Err(QueueError::ClientExists(config.client_id));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let set = Arc::new(ReplicaSet::new(Arc::new(Subscription::new(id, config))));
        populate(&set);
        sets.insert(id, Arc::clone(&set));
        Ok(set)
    }

    pub fn unregister(&self, id: SubscriptionId) -> Option<Arc<ReplicaSet>> {
        self.sets.write().remove(&id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<ReplicaSet>> {
        self.sets.read().get(&id).cloned()
    }

    pub fn find_by_client(&self, client: &ClientId) -> Option<Arc<ReplicaSet>> {
        self.sets
            .read()
            .values()
            .find(|set| set.subscription().client_id() == client)
            .cloned()
    }

    /// Replica sets whose interest matches `(region, key)`.
    pub fn matching(&self, region: &str, key: &str) -> Vec<Arc<ReplicaSet>> {
        self.sets
            .read()
            .values()
            .filter(|set| set.subscription().config.interest.matches(region, key))
            .cloned()
            .collect()
    }

    /// Durable subscriptions whose client stayed away past its timeout.
    pub fn expired(&self, now: Instant) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .sets
            .read()
            .values()
            .filter(|set| set.subscription().durable_expired(now))
            .map(|set| set.id())
            .collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<ReplicaSet>> {
        let mut sets: Vec<_> = self.sets.read().values().cloned().collect();
        sets.sort_by_key(|set| set.id());
        sets
    }

    pub fn subscription_count(&self) -> usize {
        self.sets.read().len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::subscriptions::InterestSpec;
    use std::time::Duration;

    #[test]
    fn test_register_unregister() {
        let registry = SubscriptionRegistry::new();
        let set = registry
            .register(SubscriptionConfig::new("a", &QueueConfig::default()))
            .unwrap();
        assert_eq!(registry.subscription_count(), 1);
        assert!(registry.find_by_client(&ClientId::new("a")).is_some());

        registry.unregister(set.id());
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_register_with_populates_before_visible() {
        let registry = SubscriptionRegistry::new();
        let mut seen_during_populate = None;
        let set = registry
            .register_with(SubscriptionConfig::new("a", &QueueConfig::default()), |set| {
                seen_during_populate = Some(set.id());
            })
            .unwrap();
        assert_eq!(seen_during_populate, Some(set.id()));
        assert!(registry.get(set.id()).is_some());

        // A rejected client never reaches the populate step.
        let mut called = false;
        let result = registry.register_with(SubscriptionConfig::new("a", &QueueConfig::default()), |_| {
            called = true;
        });
        assert!(result.is_err());
        assert!(!called);
    }

    #[test]
    fn test_duplicate_client_rejected() {
        let registry = SubscriptionRegistry::new();
        registry
            .register(SubscriptionConfig::new("a", &QueueConfig::default()))
            .unwrap();
        let result = registry.register(SubscriptionConfig::new("a", &QueueConfig::default()));
        assert!(matches!(result, Err(QueueError::ClientExists(_))));
    }

    #[test]
    fn test_matching_filters_interest() {
        let registry = SubscriptionRegistry::new();
        let defaults = QueueConfig::default();
        registry
            .register(SubscriptionConfig::new("all", &defaults))
            .unwrap();
        registry
            .register(
                SubscriptionConfig::new("last", &defaults)
                    .with_interest(InterestSpec::keys(["LAST_KEY"])),
            )
            .unwrap();

        assert_eq!(registry.matching("r", "KEY_0_0").len(), 1);
        assert_eq!(registry.matching("r", "LAST_KEY").len(), 2);
    }

    #[test]
    fn test_expired_only_durable_past_timeout() {
        let registry = SubscriptionRegistry::new();
        let set = registry
            .register(
                SubscriptionConfig::new("d", &QueueConfig::default())
                    .durable(Duration::from_secs(5)),
            )
            .unwrap();
        let t0 = Instant::now();
        set.subscription().mark_disconnected(t0);

        assert!(registry.expired(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(registry.expired(t0 + Duration::from_secs(5)), vec![set.id()]);
    }
}
