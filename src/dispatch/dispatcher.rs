//! Primary-side delivery loop for one client.

use super::transport::{ClientTransport, SendOutcome};
use crate::qrm::QrmCoordinator;
use crate::queue::{Replica, ReplicaQueue, ReplicaSet};
use crate::subscriptions::SubscriptionId;
use crate::types::{ClientId, EventIdentity, MemberId};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Dispatcher lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Dispatching,
    /// Client connection failed; waits for a resume.
    Suspended,
    /// Cancelled, demoted or host gone. Terminal.
    Stopped,
}

/// Result of a single dispatch step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Dispatched(EventIdentity),
    Empty,
    Suspended,
    Stopped,
}

/// Reported to the owner of the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchNotice {
    /// Send failed; the client should be treated as disconnected.
    ConnectionLost {
        subscription: SubscriptionId,
        client: ClientId,
        outcome: SendOutcome,
    },
}

#[derive(Default)]
struct PendingBatch {
    /// Non-marker events dispatched since the last flush.
    count: usize,
    started: Option<Instant>,
}

/// Counts from [`Dispatcher::run_until_idle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub last: CycleOutcome,
}

/// Sends a Primary replica's entries to its client, in queue order.
///
/// Every `batch_size` non-marker dispatches, or once the subscription's ack
/// interval has passed, the dispatched prefix is released locally and its
/// identities are broadcast to the peers.
pub struct Dispatcher {
    set: Arc<ReplicaSet>,
    replica: Replica,
    transport: Arc<dyn ClientTransport>,
    qrm: Arc<QrmCoordinator>,
    notices: Option<Sender<DispatchNotice>>,
    batch_size: usize,
    ack_interval: Duration,
    state: Mutex<DispatcherState>,
    batch: Mutex<PendingBatch>,
}

impl Dispatcher {
    pub fn new(
        set: Arc<ReplicaSet>,
        replica: Replica,
        transport: Arc<dyn ClientTransport>,
        qrm: Arc<QrmCoordinator>,
        batch_size: usize,
    ) -> Self {
        let ack_interval = set.subscription().config.ack_interval;
        Self {
            set,
            replica,
            transport,
            qrm,
            notices: None,
            batch_size: batch_size.max(1),
            ack_interval,
            state: Mutex::new(DispatcherState::Idle),
            batch: Mutex::new(PendingBatch::default()),
        }
    }

    /// Report connection loss on `notices`.
    pub fn with_notices(mut self, notices: Sender<DispatchNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    pub fn member(&self) -> MemberId {
        self.replica.member_id()
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.set.id()
    }

    pub fn queue(&self) -> &Arc<ReplicaQueue> {
        &self.replica.queue
    }

    /// Non-marker events dispatched but not yet broadcast.
    pub fn pending_removals(&self) -> usize {
        self.batch.lock().count
    }

    /// Perform one step of the delivery loop.
    pub fn run_cycle(&self) -> CycleOutcome {
        match self.state() {
            DispatcherState::Stopped => return CycleOutcome::Stopped,
            DispatcherState::Suspended => return CycleOutcome::Suspended,
            _ => {}
        }

        if !self.replica.is_live() || !self.replica.queue.is_primary() {
            debug!(
                subscription = %self.set.id(),
                member = %self.member(),
                "replica no longer primary, stopping dispatcher"
            );
            self.stop();
            return CycleOutcome::Stopped;
        }

        let event = match self.replica.queue.next_undispatched() {
            Some(event) => event,
            None => {
                *self.state.lock() = DispatcherState::Idle;
                self.flush_if_due();
                return CycleOutcome::Empty;
            }
        };

        *self.state.lock() = DispatcherState::Dispatching;
        let client = self.set.subscription().client_id();

        match self.transport.send(client, &event) {
            SendOutcome::Ack => {
                self.replica.queue.mark_dispatched(&event.identity);

                let due = if event.is_marker() {
                    false
                } else {
                    let mut batch = self.batch.lock();
                    batch.count += 1;
                    let started = *batch.started.get_or_insert_with(Instant::now);
                    batch.count >= self.batch_size || started.elapsed() >= self.ack_interval
                };
                if due {
                    self.flush();
                }

                CycleOutcome::Dispatched(event.identity.clone())
            }
            outcome => {
                self.suspend(outcome);
                CycleOutcome::Suspended
            }
        }
    }

    /// Run cycles until the queue is empty, dispatch can't proceed, or
    /// `limit` events (at least one) have been sent.
    pub fn run_until_idle(&self, limit: Option<usize>) -> DispatchReport {
        let limit = limit.map(|max| max.max(1));
        let mut dispatched = 0;
        loop {
            let outcome = self.run_cycle();
            if let CycleOutcome::Dispatched(_) = outcome {
                dispatched += 1;
                if limit.map_or(true, |max| dispatched < max) {
                    continue;
                }
            }
            return DispatchReport {
                dispatched,
                last: outcome,
            };
        }
    }

    /// Release the dispatched prefix and broadcast its identities.
    /// Returns the number of identities broadcast.
    pub fn flush(&self) -> usize {
        {
            let mut batch = self.batch.lock();
            batch.count = 0;
            batch.started = None;
        }

        if !self.replica.is_live() {
            return 0;
        }

        let identities = self.replica.queue.release_dispatched();
        if identities.is_empty() {
            return 0;
        }
        self.qrm
            .broadcast_removal(&self.set, self.member(), &identities);
        identities.len()
    }

    fn flush_if_due(&self) {
        let due = self
            .batch
            .lock()
            .started
            .map_or(false, |started| started.elapsed() >= self.ack_interval);
        if due {
            self.flush();
        }
    }

    fn suspend(&self, outcome: SendOutcome) {
        *self.state.lock() = DispatcherState::Suspended;
        let subscription = self.set.subscription();
        subscription.mark_disconnected(Instant::now());

        warn!(
            subscription = %subscription.id,
            client = %subscription.client_id(),
            member = %self.member(),
            ?outcome,
            "client send failed, suspending dispatch"
        );

        if let Some(ref notices) = self.notices {
            let _ = notices.try_send(DispatchNotice::ConnectionLost {
                subscription: subscription.id,
                client: subscription.client_id().clone(),
                outcome,
            });
        }
    }

    /// Suspend because the client went away on its own.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state != DispatcherState::Stopped {
            *state = DispatcherState::Suspended;
        }
    }

    /// Leave `Suspended` after the client reconnected.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == DispatcherState::Suspended {
            *state = DispatcherState::Idle;
            info!(
                subscription = %self.set.id(),
                member = %self.member(),
                "dispatch resumed"
            );
        }
        drop(state);
        self.replica.queue.notify();
    }

    /// Cancel dispatching. Terminal.
    pub fn stop(&self) {
        *self.state.lock() = DispatcherState::Stopped;
        self.replica.queue.notify();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscription", &self.set.id())
            .field("member", &self.member())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::member::Member;
    use crate::subscriptions::{Subscription, SubscriptionConfig};
    use crate::types::{OperationKind, QueueEvent, Role};
    use crossbeam_channel::unbounded;
    use std::collections::VecDeque;

    /// Acks everything unless a scripted outcome is queued.
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Mutex<Vec<QueueEvent>>,
        script: Mutex<VecDeque<SendOutcome>>,
    }

    impl ClientTransport for ScriptedTransport {
        fn send(&self, _client: &ClientId, event: &QueueEvent) -> SendOutcome {
            let outcome = self.script.lock().pop_front().unwrap_or(SendOutcome::Ack);
            if outcome == SendOutcome::Ack {
                self.sent.lock().push(event.clone());
            }
            outcome
        }
    }

    struct Fixture {
        set: Arc<ReplicaSet>,
        primary: Replica,
        secondary: Replica,
        transport: Arc<ScriptedTransport>,
        qrm: Arc<QrmCoordinator>,
    }

    fn fixture(ack_interval: Duration) -> Fixture {
        let config = SubscriptionConfig::new("client", &QueueConfig::default())
            .with_ack_interval(ack_interval);
        let sub = Arc::new(Subscription::new(SubscriptionId(1), config));
        let set = Arc::new(ReplicaSet::new(Arc::clone(&sub)));
        let make = |id: u64, role: Role| Replica {
            member: Arc::new(Member::new(MemberId(id))),
            queue: Arc::new(ReplicaQueue::new(Arc::clone(&sub), MemberId(id), role)),
        };
        let primary = make(1, Role::Primary);
        let secondary = make(2, Role::Secondary);
        set.add(primary.clone());
        set.add(secondary.clone());
        Fixture {
            set,
            primary,
            secondary,
            transport: Arc::new(ScriptedTransport::default()),
            qrm: Arc::new(QrmCoordinator::new()),
        }
    }

    fn publish(f: &Fixture, count: u64) {
        for seq in 1..=count {
            let event = Arc::new(QueueEvent::operation(
                EventIdentity::new(MemberId(7), "r", seq),
                format!("KEY_{}", seq),
                OperationKind::Create,
                None,
            ));
            f.primary.queue.append(Arc::clone(&event));
            f.secondary.queue.append(event);
        }
    }

    fn dispatcher(f: &Fixture, batch: usize) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&f.set),
            f.primary.clone(),
            f.transport.clone(),
            Arc::clone(&f.qrm),
            batch,
        )
    }

    #[test]
    fn test_dispatch_in_order_with_batched_qrm() {
        let f = fixture(Duration::from_secs(60));
        publish(&f, 5);
        let d = dispatcher(&f, 2);

        let report = d.run_until_idle(None);
        assert_eq!(report.dispatched, 5);
        assert_eq!(report.last, CycleOutcome::Empty);
        assert_eq!(d.state(), DispatcherState::Idle);

        let order: Vec<u64> = f.transport.sent.lock().iter().map(|e| e.identity.sequence).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);

        // Two full batches went out; the fifth event waits for the interval.
        assert_eq!(f.secondary.queue.stats().events_removed_by_qrm(), 4);
        assert_eq!(d.pending_removals(), 1);

        assert_eq!(d.flush(), 1);
        assert_eq!(f.secondary.queue.stats().events_removed_by_qrm(), 5);
        assert!(f.secondary.queue.is_empty());
        assert!(f.primary.queue.is_empty());
    }

    #[test]
    fn test_elapsed_interval_flushes_on_idle() {
        let f = fixture(Duration::ZERO);
        publish(&f, 3);
        let d = dispatcher(&f, 100);

        d.run_until_idle(None);
        assert_eq!(f.secondary.queue.stats().events_removed_by_qrm(), 3);
        assert_eq!(f.primary.queue.stats().events_dispatched(), 3);
    }

    #[test]
    fn test_markers_dispatched_but_not_broadcast() {
        let f = fixture(Duration::ZERO);
        f.primary.queue.insert_marker(QueueEvent::marker(MemberId(1), 1));
        publish(&f, 2);
        let d = dispatcher(&f, 1);

        assert_eq!(d.run_until_idle(None).dispatched, 3);
        assert_eq!(f.primary.queue.stats().events_dispatched(), 3);
        assert_eq!(f.secondary.queue.stats().events_removed_by_qrm(), 2);
    }

    #[test]
    fn test_send_failure_suspends_without_advancing() {
        let f = fixture(Duration::from_secs(60));
        publish(&f, 3);
        let (tx, rx) = unbounded();
        let d = dispatcher(&f, 10).with_notices(tx);
        f.transport.script.lock().push_back(SendOutcome::Ack);
        f.transport.script.lock().push_back(SendOutcome::Timeout);

        let report = d.run_until_idle(None);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.last, CycleOutcome::Suspended);
        assert_eq!(d.state(), DispatcherState::Suspended);
        assert_eq!(f.primary.queue.undispatched_len(), 2);
        assert!(!f.set.subscription().is_connected());
        assert!(matches!(
            rx.try_recv().unwrap(),
            DispatchNotice::ConnectionLost { outcome: SendOutcome::Timeout, .. }
        ));

        // Stays suspended until resumed.
        assert_eq!(d.run_cycle(), CycleOutcome::Suspended);
        d.resume();
        assert_eq!(d.run_until_idle(None).dispatched, 2);
    }

    #[test]
    fn test_limit_stops_early() {
        let f = fixture(Duration::from_secs(60));
        publish(&f, 4);
        let d = dispatcher(&f, 10);

        let report = d.run_until_idle(Some(3));
        assert_eq!(report.dispatched, 3);
        assert!(matches!(report.last, CycleOutcome::Dispatched(_)));
        assert_eq!(f.primary.queue.undispatched_len(), 1);
    }

    #[test]
    fn test_demoted_replica_stops() {
        let f = fixture(Duration::from_secs(60));
        publish(&f, 1);
        let d = dispatcher(&f, 10);
        f.primary.queue.set_role(Role::Secondary);

        assert_eq!(d.run_cycle(), CycleOutcome::Stopped);
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert!(f.transport.sent.lock().is_empty());
    }
}
