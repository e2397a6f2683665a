//! One hosting member's copy of a client's subscription queue.

use crate::error::{QueueError, Result};
use crate::stats::ReplicaStats;
use crate::subscriptions::{Subscription, SubscriptionId};
use crate::types::{EventIdentity, MemberId, QueueEvent, Role};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Ordered entries plus dispatch position.
struct QueueInner {
    entries: VecDeque<Arc<QueueEvent>>,
    /// Entries before the cursor were sent to the client but not yet released.
    cursor: usize,
    /// Set while the queue is over capacity and may not drop.
    overflowing: bool,
    /// The subscription is gone; late appends are discarded.
    released: bool,
}

/// A replica of a subscription queue, owned by its hosting member.
///
/// Every replica receives every matching event regardless of role. Only the
/// Primary advances its cursor; Secondaries shrink through QRM removal.
pub struct ReplicaQueue {
    subscription: Arc<Subscription>,
    member: MemberId,
    role: RwLock<Role>,
    inner: Mutex<QueueInner>,
    available: Condvar,
    stats: ReplicaStats,
}

impl ReplicaQueue {
    pub fn new(subscription: Arc<Subscription>, member: MemberId, role: Role) -> Self {
        Self {
            subscription,
            member,
            role: RwLock::new(role),
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                cursor: 0,
                overflowing: false,
                released: false,
            }),
            available: Condvar::new(),
            stats: ReplicaStats::new(),
        }
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription.id
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn stats(&self) -> &ReplicaStats {
        &self.stats
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    /// Change the locally believed role.
    ///
    /// Becoming Secondary rewinds the cursor: sent-but-unreleased entries are
    /// treated as pending again, to be removed by a later QRM.
    pub fn set_role(&self, role: Role) {
        let mut current = self.role.write();
        if *current == role {
            return;
        }
        if role == Role::Secondary {
            self.inner.lock().cursor = 0;
        }
        *current = role;
        // Wake a dispatcher blocked on this queue so it notices the change.
        self.available.notify_all();
    }

    // --- Ingestion ---

    /// Append an event at the tail.
    ///
    /// Over capacity, the oldest entries are dropped only for a disconnected
    /// non-durable client; otherwise the queue keeps growing.
    pub fn append(&self, event: Arc<QueueEvent>) {
        let mut inner = self.inner.lock();
        if inner.released {
            return;
        }
        inner.entries.push_back(event);
        self.stats.record_enqueued();

        let capacity = self.subscription.config.capacity;
        if inner.entries.len() > capacity {
            if self.subscription.may_drop_oldest() {
                let excess = inner.entries.len() - capacity;
                inner.entries.drain(..excess);
                inner.cursor = inner.cursor.saturating_sub(excess);
                self.stats.record_dropped(excess as u64);
                debug!(
                    subscription = %self.subscription.id,
                    member = %self.member,
                    dropped = excess,
                    "dropped oldest entries for disconnected client"
                );
            } else if !inner.overflowing {
                inner.overflowing = true;
                warn!(
                    subscription = %self.subscription.id,
                    member = %self.member,
                    capacity,
                    "queue over capacity, retaining entries for live or durable client"
                );
            }
        } else {
            inner.overflowing = false;
        }
        drop(inner);

        self.available.notify_one();
    }

    /// Put a marker at the head of the undispatched region.
    pub fn insert_marker(&self, marker: QueueEvent) {
        debug_assert!(marker.is_marker());
        let mut inner = self.inner.lock();
        let at = inner.cursor;
        inner.entries.insert(at, Arc::new(marker));
        self.stats.record_marker();
        drop(inner);

        self.available.notify_one();
    }

    /// Seed a Secondary with entries taken from another replica's image.
    ///
    /// Image entries go ahead of anything appended since the replica joined;
    /// identities already present are skipped. Returns the number inserted.
    pub fn seed(&self, events: Vec<QueueEvent>) -> Result<usize> {
        if self.is_primary() {
            return Err(QueueError::InvalidOperation(format!(
                "cannot seed primary replica of {} on {}",
                self.subscription.id, self.member
            )));
        }

        let mut inner = self.inner.lock();
        let present: HashSet<EventIdentity> =
            inner.entries.iter().map(|e| e.identity.clone()).collect();

        let mut seeded: VecDeque<Arc<QueueEvent>> = events
            .into_iter()
            .filter(|e| !e.is_marker() && !present.contains(&e.identity))
            .map(Arc::new)
            .collect();
        let inserted = seeded.len();

        seeded.extend(inner.entries.drain(..));
        inner.entries = seeded;
        inner.cursor = 0;
        Ok(inserted)
    }

    // --- Dispatch ---

    /// Entry at `cursor`, if any.
    pub fn peek_from(&self, cursor: usize) -> Option<Arc<QueueEvent>> {
        self.inner.lock().entries.get(cursor).cloned()
    }

    /// Next entry not yet sent to the client.
    pub fn next_undispatched(&self) -> Option<Arc<QueueEvent>> {
        let inner = self.inner.lock();
        inner.entries.get(inner.cursor).cloned()
    }

    pub fn cursor(&self) -> usize {
        self.inner.lock().cursor
    }

    /// Record a successful send of the entry at the cursor.
    ///
    /// If a concurrent removal already took that entry the cursor stays put,
    /// but the send still counts as a dispatch.
    pub fn mark_dispatched(&self, identity: &EventIdentity) -> bool {
        let mut inner = self.inner.lock();
        self.stats.record_dispatched();
        let cursor = inner.cursor;
        match inner.entries.get(cursor) {
            Some(head) if &head.identity == identity => {
                inner.cursor += 1;
                true
            }
            _ => false,
        }
    }

    /// Remove the dispatched prefix, returning its non-marker identities.
    pub fn release_dispatched(&self) -> Vec<EventIdentity> {
        let mut inner = self.inner.lock();
        let cursor = inner.cursor;
        inner.cursor = 0;
        inner
            .entries
            .drain(..cursor)
            .filter(|e| !e.is_marker())
            .map(|e| e.identity.clone())
            .collect()
    }

    // --- Removal ---

    /// Delete matching entries wherever they sit. Absent identities are ignored.
    pub fn remove_by_identity(&self, identities: &HashSet<EventIdentity>) -> usize {
        if identities.is_empty() {
            return 0;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let cursor = inner.cursor;
        let before = inner.entries.len();
        let mut index = 0;
        let mut removed_before_cursor = 0;

        inner.entries.retain(|e| {
            let keep = !identities.contains(&e.identity);
            if !keep && index < cursor {
                removed_before_cursor += 1;
            }
            index += 1;
            keep
        });

        inner.cursor -= removed_before_cursor;
        before - inner.entries.len()
    }

    /// Apply a queue-removal message from the Primary.
    pub fn apply_qrm(&self, identities: &HashSet<EventIdentity>) -> usize {
        let removed = self.remove_by_identity(identities);
        self.stats.record_removed_by_qrm(removed as u64);
        removed
    }

    /// Drop every entry. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.cursor = 0;
        inner.overflowing = false;
        self.stats.record_dropped(count as u64);
        drop(inner);

        self.available.notify_all();
        count
    }

    /// Drop every entry and refuse further appends, for a removed subscription.
    pub fn release(&self) -> usize {
        self.inner.lock().released = true;
        self.clear()
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    // --- Inspection ---

    /// Copy of the undispatched mutation entries, in order, for a queue image.
    ///
    /// Entries already sent to the client stay out; they only wait for a
    /// removal message.
    pub fn image_events(&self) -> Vec<QueueEvent> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .skip(inner.cursor)
            .filter(|e| !e.is_marker())
            .map(|e| QueueEvent::clone(e))
            .collect()
    }

    /// Block until an undispatched entry exists or `timeout` elapses.
    pub fn wait_for_event(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.cursor < inner.entries.len() {
            return true;
        }
        self.available.wait_for(&mut inner, timeout);
        inner.cursor < inner.entries.len()
    }

    /// Wake any dispatcher waiting on this queue.
    pub fn notify(&self) {
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries not yet sent to the client.
    pub fn undispatched_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.entries.len() - inner.cursor
    }

    pub fn contains(&self, identity: &EventIdentity) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|e| &e.identity == identity)
    }
}

impl std::fmt::Debug for ReplicaQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaQueue")
            .field("subscription", &self.subscription.id)
            .field("member", &self.member)
            .field("role", &self.role())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::subscriptions::SubscriptionConfig;
    use crate::types::OperationKind;
    use std::time::Instant;

    fn subscription(durable: bool, capacity: usize) -> Arc<Subscription> {
        let mut config = SubscriptionConfig::new("client", &QueueConfig::default())
            .with_capacity(capacity);
        config.durable = durable;
        Arc::new(Subscription::new(SubscriptionId(1), config))
    }

    fn event(seq: u64) -> Arc<QueueEvent> {
        Arc::new(QueueEvent::operation(
            EventIdentity::new(MemberId(9), "region", seq),
            format!("KEY_{}", seq),
            OperationKind::Create,
            None,
        ))
    }

    fn ids(seqs: &[u64]) -> HashSet<EventIdentity> {
        seqs.iter()
            .map(|s| EventIdentity::new(MemberId(9), "region", *s))
            .collect()
    }

    #[test]
    fn test_dispatch_and_release() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(1), Role::Primary);
        for seq in 1..=3 {
            queue.append(event(seq));
        }

        let head = queue.next_undispatched().unwrap();
        assert_eq!(head.identity.sequence, 1);
        assert!(queue.mark_dispatched(&head.identity));
        let head = queue.next_undispatched().unwrap();
        assert!(queue.mark_dispatched(&head.identity));

        assert_eq!(queue.cursor(), 2);
        assert_eq!(queue.undispatched_len(), 1);

        let released = queue.release_dispatched();
        assert_eq!(released.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.cursor(), 0);
        assert_eq!(queue.stats().events_dispatched(), 2);
    }

    #[test]
    fn test_remove_adjusts_cursor() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(1), Role::Primary);
        for seq in 1..=5 {
            queue.append(event(seq));
        }
        for _ in 0..3 {
            let head = queue.next_undispatched().unwrap();
            queue.mark_dispatched(&head.identity);
        }

        // Two dispatched entries and one pending entry go away.
        let removed = queue.remove_by_identity(&ids(&[1, 3, 4, 42]));
        assert_eq!(removed, 3);
        assert_eq!(queue.cursor(), 1);
        assert_eq!(queue.next_undispatched().unwrap().identity.sequence, 5);
    }

    #[test]
    fn test_qrm_is_idempotent() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(2), Role::Secondary);
        for seq in 1..=4 {
            queue.append(event(seq));
        }

        assert_eq!(queue.apply_qrm(&ids(&[1, 2])), 2);
        assert_eq!(queue.apply_qrm(&ids(&[1, 2])), 0);
        assert_eq!(queue.stats().events_removed_by_qrm(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_marker_goes_to_undispatched_head() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(1), Role::Primary);
        queue.append(event(1));
        queue.append(event(2));
        let head = queue.next_undispatched().unwrap();
        queue.mark_dispatched(&head.identity);

        queue.insert_marker(QueueEvent::marker(MemberId(1), 1));
        assert!(queue.next_undispatched().unwrap().is_marker());

        let head = queue.next_undispatched().unwrap();
        queue.mark_dispatched(&head.identity);
        // Marker identities are never part of a removal batch.
        let released = queue.release_dispatched();
        assert_eq!(released, vec![EventIdentity::new(MemberId(9), "region", 1)]);
    }

    #[test]
    fn test_image_excludes_dispatched_and_markers() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(1), Role::Primary);
        queue.insert_marker(QueueEvent::marker(MemberId(1), 1));
        for seq in 1..=4 {
            queue.append(event(seq));
        }
        for _ in 0..3 {
            let head = queue.next_undispatched().unwrap();
            queue.mark_dispatched(&head.identity);
        }

        // Marker, 1 and 2 were sent but not released yet.
        let image: Vec<u64> = queue.image_events().iter().map(|e| e.identity.sequence).collect();
        assert_eq!(image, vec![3, 4]);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_released_queue_ignores_late_appends() {
        let queue = ReplicaQueue::new(subscription(false, 16), MemberId(1), Role::Secondary);
        queue.append(event(1));
        queue.append(event(2));

        assert_eq!(queue.release(), 2);
        assert!(queue.is_released());
        queue.append(event(3));
        assert!(queue.is_empty());
        assert_eq!(queue.stats().snapshot().events_enqueued, 2);
    }

    #[test]
    fn test_overflow_drops_only_for_disconnected_non_durable() {
        let sub = subscription(false, 3);
        let queue = ReplicaQueue::new(Arc::clone(&sub), MemberId(1), Role::Secondary);
        for seq in 1..=5 {
            queue.append(event(seq));
        }
        assert_eq!(queue.len(), 5);

        sub.mark_disconnected(Instant::now());
        queue.append(event(6));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_from(0).unwrap().identity.sequence, 4);
        assert_eq!(queue.stats().snapshot().events_dropped, 3);
    }

    #[test]
    fn test_overflow_retained_for_durable() {
        let sub = subscription(true, 2);
        let queue = ReplicaQueue::new(Arc::clone(&sub), MemberId(1), Role::Secondary);
        sub.mark_disconnected(Instant::now());
        for seq in 1..=4 {
            queue.append(event(seq));
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_seed_skips_present_identities() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(3), Role::Secondary);
        queue.append(event(3));
        queue.append(event(4));

        let image: Vec<QueueEvent> = (1..=3).map(|s| QueueEvent::clone(&event(s))).collect();
        assert_eq!(queue.seed(image).unwrap(), 2);

        let order: Vec<u64> = (0..queue.len())
            .map(|i| queue.peek_from(i).unwrap().identity.sequence)
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_seed_rejected_on_primary() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(3), Role::Primary);
        assert!(matches!(
            queue.seed(Vec::new()),
            Err(QueueError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_demotion_rewinds_cursor() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(1), Role::Primary);
        queue.append(event(1));
        let head = queue.next_undispatched().unwrap();
        queue.mark_dispatched(&head.identity);

        queue.set_role(Role::Secondary);
        assert_eq!(queue.cursor(), 0);
        assert_eq!(queue.undispatched_len(), 1);
    }

    #[test]
    fn test_wait_for_event_times_out() {
        let queue = ReplicaQueue::new(subscription(false, 100), MemberId(1), Role::Primary);
        assert!(!queue.wait_for_event(Duration::from_millis(10)));
        queue.append(event(1));
        assert!(queue.wait_for_event(Duration::from_millis(10)));
    }
}
