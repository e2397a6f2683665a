//! Queue service tying all components together.

use crate::adapter::EventSourceAdapter;
use crate::client::ClientEventTracker;
use crate::config::QueueConfig;
use crate::dispatch::{
    ClientTransport, DispatchNotice, DispatchReport, Dispatcher, DispatcherHandle, DispatcherState,
};
use crate::error::{QueueError, Result};
use crate::failover::{FailoverController, Promotion};
use crate::member::Member;
use crate::qrm::QrmCoordinator;
use crate::queue::{Replica, ReplicaQueue, ReplicaSet};
use crate::stats::{QrmStats, StatsSnapshot};
use crate::subscriptions::{SubscriptionConfig, SubscriptionId, SubscriptionRegistry};
use crate::types::{ClientId, EventIdentity, MemberId, OperationKind, PayloadRef, Role};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A subscription's dispatcher, stepped by the caller or on its own thread.
enum DispatcherSlot {
    Inline(Arc<Dispatcher>),
    Background(DispatcherHandle),
}

impl DispatcherSlot {
    fn dispatcher(&self) -> &Arc<Dispatcher> {
        match self {
            DispatcherSlot::Inline(d) => d,
            DispatcherSlot::Background(h) => h.dispatcher(),
        }
    }
}

/// Subscription state the notice worker tears down alongside the service.
struct SharedState {
    registry: Arc<SubscriptionRegistry>,
    dispatchers: Mutex<HashMap<SubscriptionId, DispatcherSlot>>,
}

impl SharedState {
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let set = self
            .registry
            .unregister(id)
            .ok_or(QueueError::SubscriptionNotFound(id))?;

        // Joining a background thread happens outside the lock.
        let slot = self.dispatchers.lock().remove(&id);
        if let Some(slot) = slot {
            slot.dispatcher().stop();
        }

        for replica in set.replicas() {
            replica.queue.release();
            if replica.is_live() {
                replica.member.detach(id);
            } else {
                replica.member.mark_stale(id);
            }
        }

        info!(subscription = %id, client = %set.subscription().client_id(), "client unsubscribed");
        Ok(())
    }

    fn client_disconnected(&self, client: &ClientId) -> Result<()> {
        let set = self
            .registry
            .find_by_client(client)
            .ok_or_else(|| QueueError::ClientNotFound(client.clone()))?;
        let subscription = set.subscription();
        subscription.mark_disconnected(Instant::now());

        if !subscription.is_durable() {
            return self.unsubscribe(set.id());
        }

        if let Some(slot) = self.dispatchers.lock().get(&set.id()) {
            slot.dispatcher().pause();
        }
        info!(
            subscription = %set.id(),
            %client,
            timeout_ms = subscription.config.durable_timeout.as_millis() as u64,
            "durable client disconnected, retaining queue"
        );
        Ok(())
    }

    fn handle_notice(&self, notice: DispatchNotice) {
        match notice {
            DispatchNotice::ConnectionLost { client, .. } => {
                if let Err(e) = self.client_disconnected(&client) {
                    debug!(%client, error = %e, "connection loss for unknown client");
                }
            }
        }
    }
}

/// Consumes dispatcher notices while dispatch runs on background threads.
struct NoticeWorker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl NoticeWorker {
    fn spawn(shared: Arc<SharedState>, notices: Receiver<DispatchNotice>) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("dispatch-notices".into())
            .spawn(move || loop {
                select! {
                    recv(notices) -> notice => match notice {
                        Ok(notice) => shared.handle_notice(notice),
                        Err(_) => break,
                    },
                    recv(stopped) -> _ => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the worker.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("notice worker panicked");
            }
        }
    }
}

impl Drop for NoticeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The event queue service.
///
/// Provides a unified interface for:
/// - Registering hosting members and client subscriptions
/// - Publishing storage-engine mutations to subscription queues
/// - Dispatching from Primaries, inline or on background threads
/// - Failing and recovering members, with Primary promotion
/// - Querying per-replica statistics and roles
pub struct QueueService {
    config: QueueConfig,
    members: RwLock<BTreeMap<MemberId, Arc<Member>>>,
    notice_worker: Mutex<Option<NoticeWorker>>,
    shared: Arc<SharedState>,
    adapter: EventSourceAdapter,
    qrm: Arc<QrmCoordinator>,
    failover: FailoverController,
    transport: Arc<dyn ClientTransport>,
    background: AtomicBool,
    notice_tx: Sender<DispatchNotice>,
    notice_rx: Receiver<DispatchNotice>,
}

impl QueueService {
    pub fn new(config: QueueConfig, transport: Arc<dyn ClientTransport>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SubscriptionRegistry::new());
        let (notice_tx, notice_rx) = unbounded();

        Ok(Self {
            config,
            members: RwLock::new(BTreeMap::new()),
            notice_worker: Mutex::new(None),
            adapter: EventSourceAdapter::new(Arc::clone(&registry)),
            shared: Arc::new(SharedState {
                registry,
                dispatchers: Mutex::new(HashMap::new()),
            }),
            qrm: Arc::new(QrmCoordinator::new()),
            failover: FailoverController::new(),
            transport,
            background: AtomicBool::new(false),
            notice_tx,
            notice_rx,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// A subscription config pre-filled with this service's defaults.
    pub fn subscription_config(&self, client_id: impl Into<String>) -> SubscriptionConfig {
        SubscriptionConfig::new(client_id, &self.config)
    }

    /// A client-side tracker sized from the configuration.
    pub fn client_tracker(&self) -> ClientEventTracker {
        ClientEventTracker::new(self.config.tracker_capacity)
    }

    pub fn qrm(&self) -> &QrmCoordinator {
        &self.qrm
    }

    // --- Members ---

    pub fn add_member(&self, id: MemberId) -> Result<Arc<Member>> {
        let mut members = self.members.write();
        if members.contains_key(&id) {
            return Err(QueueError::MemberExists(id));
        }
        let member = Arc::new(Member::new(id));
        members.insert(id, Arc::clone(&member));
        Ok(member)
    }

    pub fn member(&self, id: MemberId) -> Option<Arc<Member>> {
        self.members.read().get(&id).cloned()
    }

    fn require_member(&self, id: MemberId) -> Result<Arc<Member>> {
        self.member(id).ok_or(QueueError::MemberNotFound(id))
    }

    fn require_set(&self, id: SubscriptionId) -> Result<Arc<ReplicaSet>> {
        self.shared
            .registry
            .get(id)
            .ok_or(QueueError::SubscriptionNotFound(id))
    }

    // --- Subscriptions ---

    /// Register a client and create a replica on each hosting member.
    ///
    /// The lowest live host becomes Primary and starts with a marker. If no
    /// host is live the subscription exists without a Primary.
    pub fn subscribe(&self, config: SubscriptionConfig, hosts: &[MemberId]) -> Result<SubscriptionId> {
        if hosts.is_empty() {
            return Err(QueueError::InvalidOperation(
                "subscription needs at least one hosting member".into(),
            ));
        }
        let mut members = Vec::with_capacity(hosts.len());
        for id in hosts {
            let member = self.require_member(*id)?;
            if !members.iter().any(|m: &Arc<Member>| m.id() == *id) {
                members.push(member);
            }
        }

        // Publishers only see the set once every replica and the Primary exist.
        let failover = &self.failover;
        let mut elected = None;
        let set = self.shared.registry.register_with(config, |set| {
            for member in members {
                let queue = Arc::new(ReplicaQueue::new(
                    Arc::clone(set.subscription()),
                    member.id(),
                    Role::Secondary,
                ));
                member.attach(Arc::clone(&queue));
                set.add(Replica { member, queue });
            }
            elected = failover.elect(set);
        })?;

        if let Some(primary) = elected {
            self.install_dispatcher(&set, primary)?;
        }

        info!(
            subscription = %set.id(),
            client = %set.subscription().client_id(),
            durable = set.subscription().is_durable(),
            replicas = set.len(),
            "client subscribed"
        );
        Ok(set.id())
    }

    /// Remove a subscription and release its queues.
    ///
    /// Members that are down release theirs when they recover.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.shared.unsubscribe(id)
    }

    pub fn replica_set(&self, id: SubscriptionId) -> Option<Arc<ReplicaSet>> {
        self.shared.registry.get(id)
    }

    pub fn subscription_for(&self, client: &ClientId) -> Option<SubscriptionId> {
        self.shared.registry.find_by_client(client).map(|set| set.id())
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry.subscription_count()
    }

    // --- Publishing ---

    /// Storage-engine callback for every committed mutation, including
    /// destroys synthesized by expiration.
    pub fn on_mutation(
        &self,
        region: &str,
        key: &str,
        op: OperationKind,
        payload: Option<PayloadRef>,
        producing_member: MemberId,
    ) -> EventIdentity {
        self.adapter
            .publish(region, key, op, payload, producing_member)
    }

    // --- Dispatch ---

    fn new_dispatcher(&self, set: &Arc<ReplicaSet>, primary: Replica) -> Arc<Dispatcher> {
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(set),
                primary,
                Arc::clone(&self.transport),
                Arc::clone(&self.qrm),
                self.config.ack_batch_size,
            )
            .with_notices(self.notice_tx.clone()),
        );
        if !set.subscription().is_connected() {
            dispatcher.pause();
        }
        dispatcher
    }

    fn install_dispatcher(&self, set: &Arc<ReplicaSet>, primary: Replica) -> Result<()> {
        let dispatcher = self.new_dispatcher(set, primary);
        let slot = if self.background.load(Ordering::Acquire) {
            DispatcherSlot::Background(DispatcherHandle::spawn(
                dispatcher,
                self.config.event_wait_timeout,
            )?)
        } else {
            DispatcherSlot::Inline(dispatcher)
        };

        let mut dispatchers = self.shared.dispatchers.lock();
        // The notice worker may have removed the subscription meanwhile.
        if self.shared.registry.get(set.id()).is_none() {
            slot.dispatcher().stop();
            return Ok(());
        }
        if let Some(old) = dispatchers.insert(set.id(), slot) {
            old.dispatcher().stop();
        }
        Ok(())
    }

    fn inline_dispatcher(&self, id: SubscriptionId) -> Result<Arc<Dispatcher>> {
        match self.shared.dispatchers.lock().get(&id) {
            Some(DispatcherSlot::Inline(d)) => Ok(Arc::clone(d)),
            Some(DispatcherSlot::Background(_)) => Err(QueueError::InvalidOperation(format!(
                "{} is dispatched on a background thread",
                id
            ))),
            None => {
                self.require_set(id)?;
                Err(QueueError::NoLiveMember(id))
            }
        }
    }

    /// Dispatch everything pending for a subscription on the calling thread.
    pub fn pump(&self, id: SubscriptionId) -> Result<DispatchReport> {
        self.pump_limit(id, None)
    }

    /// Dispatch at most `limit` events for a subscription.
    pub fn pump_limit(&self, id: SubscriptionId, limit: Option<usize>) -> Result<DispatchReport> {
        let dispatcher = self.inline_dispatcher(id)?;
        let report = dispatcher.run_until_idle(limit);
        self.process_notices();
        Ok(report)
    }

    /// Pump every inline dispatcher once. Returns the number of events sent.
    pub fn pump_all(&self) -> usize {
        let dispatchers: Vec<Arc<Dispatcher>> = self
            .shared
            .dispatchers
            .lock()
            .values()
            .filter_map(|slot| match slot {
                DispatcherSlot::Inline(d) => Some(Arc::clone(d)),
                DispatcherSlot::Background(_) => None,
            })
            .collect();

        let sent = dispatchers
            .iter()
            .map(|d| d.run_until_idle(None).dispatched)
            .sum();
        self.process_notices();
        sent
    }

    /// Broadcast removal for everything dispatched so far, without waiting
    /// for the batch size or ack interval.
    ///
    /// Returns how many identities were broadcast. A background dispatcher
    /// flushes on its own thread, so for it the flush is only queued and the
    /// call returns 0; watch the Secondaries' `events_removed_by_qrm` instead.
    pub fn flush_acks(&self, id: SubscriptionId) -> Result<usize> {
        let flushed = match self.shared.dispatchers.lock().get(&id) {
            Some(DispatcherSlot::Inline(d)) => Some(d.flush()),
            Some(DispatcherSlot::Background(h)) => {
                h.flush();
                Some(0)
            }
            None => None,
        };
        match flushed {
            Some(count) => Ok(count),
            None => self.require_set(id).map(|_| 0),
        }
    }

    /// Move every dispatcher onto its own thread.
    ///
    /// A worker thread handles connection losses from then on, so dropped
    /// non-durable clients are unsubscribed without a `pump`.
    pub fn start_background_dispatch(&self) -> Result<()> {
        self.background.store(true, Ordering::Release);
        {
            let mut worker = self.notice_worker.lock();
            if worker.is_none() {
                *worker = Some(NoticeWorker::spawn(
                    Arc::clone(&self.shared),
                    self.notice_rx.clone(),
                )?);
            }
        }

        let mut dispatchers = self.shared.dispatchers.lock();
        let ids: Vec<SubscriptionId> = dispatchers.keys().copied().collect();
        for id in ids {
            if let Some(DispatcherSlot::Inline(d)) = dispatchers.remove(&id) {
                let handle = DispatcherHandle::spawn(d, self.config.event_wait_timeout)?;
                dispatchers.insert(id, DispatcherSlot::Background(handle));
            }
        }
        Ok(())
    }

    /// Stop background threads; dispatch continues through `pump`.
    pub fn stop_background_dispatch(&self) {
        self.background.store(false, Ordering::Release);
        // The worker takes the dispatcher lock; stop it before draining.
        let worker = self.notice_worker.lock().take();
        drop(worker);

        let slots: Vec<(SubscriptionId, DispatcherSlot)> =
            self.shared.dispatchers.lock().drain().collect();

        let mut restored = HashMap::new();
        for (id, slot) in slots {
            let handle = match slot {
                DispatcherSlot::Background(handle) => handle,
                inline => {
                    restored.insert(id, inline);
                    continue;
                }
            };
            let stopped = Arc::clone(handle.dispatcher());
            handle.stop();
            stopped.flush();

            let set = match self.shared.registry.get(id) {
                Some(set) => set,
                None => continue,
            };
            if let Some(primary) = set.get(stopped.member()) {
                let fresh = self.new_dispatcher(&set, primary);
                restored.insert(id, DispatcherSlot::Inline(fresh));
            }
        }
        self.shared.dispatchers.lock().extend(restored);
    }

    pub fn dispatcher_state(&self, id: SubscriptionId) -> Option<DispatcherState> {
        self.shared
            .dispatchers
            .lock()
            .get(&id)
            .map(|slot| slot.dispatcher().state())
    }

    /// Handle connection losses reported by dispatchers.
    ///
    /// While background dispatch runs a worker thread does this on its own.
    pub fn process_notices(&self) -> usize {
        let notices: Vec<DispatchNotice> = self.notice_rx.try_iter().collect();
        let count = notices.len();
        for notice in notices {
            self.shared.handle_notice(notice);
        }
        count
    }

    // --- Client connections ---

    /// The client's connection is gone.
    ///
    /// A non-durable subscription is removed with all its queues. A durable
    /// one keeps its queues and starts its durable timeout.
    pub fn client_disconnected(&self, client: &ClientId) -> Result<()> {
        self.shared.client_disconnected(client)
    }

    /// A durable client is back; dispatch resumes from the retained queue.
    pub fn client_reconnected(&self, client: &ClientId) -> Result<()> {
        let set = self
            .shared.registry
            .find_by_client(client)
            .ok_or_else(|| QueueError::ClientNotFound(client.clone()))?;
        set.subscription().mark_connected();

        match self.shared.dispatchers.lock().get(&set.id()) {
            Some(DispatcherSlot::Inline(d)) => d.resume(),
            Some(DispatcherSlot::Background(h)) => h.resume(),
            None => {}
        }
        info!(subscription = %set.id(), %client, "client reconnected");
        Ok(())
    }

    /// Remove durable subscriptions whose clients stayed away too long.
    pub fn expire_durable(&self, now: Instant) -> Vec<SubscriptionId> {
        let expired = self.shared.registry.expired(now);
        for id in &expired {
            if let Err(e) = self.unsubscribe(*id) {
                warn!(subscription = %id, error = %e, "failed to expire durable subscription");
            } else {
                info!(subscription = %id, "durable subscription expired");
            }
        }
        expired
    }

    // --- Failover ---

    /// Mark a member as crashed and promote replacements where it was Primary.
    pub fn fail_member(&self, id: MemberId) -> Result<Vec<Promotion>> {
        let member = self.require_member(id)?;
        member.set_live(false);
        warn!(member = %id, "member failed");

        let mut promotions = Vec::new();
        for set in self.shared.registry.all() {
            if !set.contains(id) {
                continue;
            }

            {
                let mut dispatchers = self.shared.dispatchers.lock();
                if dispatchers
                    .get(&set.id())
                    .map_or(false, |slot| slot.dispatcher().member() == id)
                {
                    if let Some(slot) = dispatchers.remove(&set.id()) {
                        slot.dispatcher().stop();
                    }
                }
            }

            if let Some(promotion) = self.failover.handle_member_failure(&set, id) {
                if let Some(new_primary) = promotion.promoted.and_then(|m| set.get(m)) {
                    self.install_dispatcher(&set, new_primary)?;
                }
                promotions.push(promotion);
            }
        }
        Ok(promotions)
    }

    /// Bring a member back. Its replicas rejoin as Secondaries seeded from a
    /// peer's queue image; queues of subscriptions removed meanwhile are released.
    pub fn recover_member(&self, id: MemberId) -> Result<usize> {
        let member = self.require_member(id)?;
        member.set_live(true);
        let purged = member.purge_stale();

        let mut rejoined = 0;
        for set in self.shared.registry.all() {
            let replica = match set.get(id) {
                Some(replica) => replica,
                None => continue,
            };
            self.failover.handle_member_recovery(&set, &replica)?;
            rejoined += 1;

            if let Some(primary) = set.primary() {
                let current = self
                    .shared
                    .dispatchers
                    .lock()
                    .get(&set.id())
                    .map(|slot| slot.dispatcher().member());
                if current != Some(primary.member_id()) {
                    self.install_dispatcher(&set, primary)?;
                }
            }
        }

        info!(member = %id, rejoined, purged, "member recovered");
        Ok(rejoined)
    }

    /// Add a Secondary for `subscription` on `member`, seeded from a queue image.
    pub fn restore_redundancy(&self, subscription: SubscriptionId, member: MemberId) -> Result<usize> {
        let set = self.require_set(subscription)?;
        let host = self.require_member(member)?;
        if !host.is_live() {
            return Err(QueueError::InvalidOperation(format!("{} is down", member)));
        }
        if set.contains(member) {
            return Err(QueueError::InvalidOperation(format!(
                "{} already hosts {}",
                member, subscription
            )));
        }

        let queue = Arc::new(ReplicaQueue::new(
            Arc::clone(set.subscription()),
            member,
            Role::Secondary,
        ));
        host.attach(Arc::clone(&queue));
        let replica = Replica {
            member: host,
            queue,
        };
        set.add(replica.clone());
        let seeded = self.failover.seed_from_peers(&set, &replica)?;

        if set.primary().is_none() {
            if let Some(primary) = self.failover.elect(&set) {
                self.install_dispatcher(&set, primary)?;
            }
        }

        info!(subscription = %subscription, member = %member, seeded, "redundancy restored");
        Ok(seeded)
    }

    // --- Observation ---

    /// Counters of the replica hosted by `member`.
    pub fn get_stats(&self, subscription: SubscriptionId, member: MemberId) -> Option<StatsSnapshot> {
        let replica = self.shared.registry.get(subscription)?.get(member)?;
        Some(replica.queue.stats().snapshot())
    }

    /// Role the replica on a live `member` believes it holds.
    pub fn get_role(&self, subscription: SubscriptionId, member: MemberId) -> Option<Role> {
        let replica = self.shared.registry.get(subscription)?.get(member)?;
        if replica.is_live() {
            Some(replica.role())
        } else {
            None
        }
    }

    pub fn primary_of(&self, subscription: SubscriptionId) -> Option<MemberId> {
        self.shared
            .registry
            .get(subscription)?
            .primary()
            .map(|p| p.member_id())
    }

    pub fn queue_len(&self, subscription: SubscriptionId, member: MemberId) -> Option<usize> {
        let replica = self.shared.registry.get(subscription)?.get(member)?;
        Some(replica.queue.len())
    }

    pub fn qrm_stats(&self) -> QrmStats {
        self.qrm.stats()
    }

    pub fn promotions(&self) -> u64 {
        self.failover.promotions()
    }
}
