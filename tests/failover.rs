//! Primary failure, promotion and redundancy recovery.

use haqueue::{
    ChannelTransport, ClientConnection, ClientId, MemberId, Observation, OperationKind, QueueConfig,
    QueueError, QueueService, Role, SubscriptionId,
};
use std::sync::Arc;
use std::time::Duration;

const REGION: &str = "region";

struct Cluster {
    service: QueueService,
    client: ClientConnection,
    sub: SubscriptionId,
}

fn cluster(config: QueueConfig, members: &[u64], hosts: &[u64], ack_interval: Duration) -> Cluster {
    let transport = Arc::new(ChannelTransport::new(Duration::from_millis(200)));
    let service = QueueService::new(config, transport.clone()).unwrap();
    for id in members {
        service.add_member(MemberId(*id)).unwrap();
    }
    let client = transport.connect(ClientId::new("client"), 1024);
    let hosts: Vec<MemberId> = hosts.iter().map(|id| MemberId(*id)).collect();
    let sub = service
        .subscribe(
            service
                .subscription_config("client")
                .with_ack_interval(ack_interval),
            &hosts,
        )
        .unwrap();
    Cluster {
        service,
        client,
        sub,
    }
}

fn publish(service: &QueueService, range: std::ops::Range<u64>) {
    for i in range {
        service.on_mutation(REGION, &format!("KEY_{}", i), OperationKind::Update, None, MemberId(9));
    }
}

#[test]
fn test_primary_failure_mid_stream() {
    let config = QueueConfig {
        ack_batch_size: 4,
        ..Default::default()
    };
    let c = cluster(config, &[1, 2], &[1, 2], Duration::from_secs(60));
    publish(&c.service, 0..22);

    // Marker plus five events; the broadcast covered only the first four.
    let report = c.service.pump_limit(c.sub, Some(6)).unwrap();
    assert_eq!(report.dispatched, 6);
    assert_eq!(
        c.service.get_stats(c.sub, MemberId(2)).unwrap().events_removed_by_qrm,
        4
    );

    let promotions = c.service.fail_member(MemberId(1)).unwrap();
    assert_eq!(promotions.len(), 1);
    assert_eq!(promotions[0].previous, MemberId(1));
    assert_eq!(promotions[0].promoted, Some(MemberId(2)));
    assert_eq!(c.service.primary_of(c.sub), Some(MemberId(2)));
    assert_eq!(c.service.get_role(c.sub, MemberId(2)), Some(Role::Primary));
    assert_eq!(c.service.get_role(c.sub, MemberId(1)), None);

    c.service.pump(c.sub).unwrap();

    let mut tracker = c.service.client_tracker();
    let received = c.client.drain();
    let observations: Vec<Observation> = received.iter().map(|e| tracker.observe(e)).collect();

    // Old stream: marker + KEY_0..KEY_4.
    assert_eq!(observations[0], Observation::Marker);
    assert!(observations[1..6].iter().all(|o| *o == Observation::Fresh));

    // New primary starts with its own marker, then resumes at the first
    // event not covered by the broadcast.
    assert_eq!(observations[6], Observation::Marker);
    assert_eq!(received[6].identity.producing_member, MemberId(2));
    assert_eq!(received[7].key, "KEY_4");
    assert_eq!(observations[7], Observation::Duplicate);

    let resumed: Vec<&str> = received[8..].iter().map(|e| e.key.as_str()).collect();
    let expected: Vec<String> = (5..22).map(|i| format!("KEY_{}", i)).collect();
    assert_eq!(resumed, expected);

    assert_eq!(tracker.stats().duplicates, 1);
    assert_eq!(tracker.stats().out_of_order, 0);
    assert_eq!(c.service.promotions(), 2);
}

#[test]
fn test_secondary_failure_keeps_primary() {
    let c = cluster(QueueConfig::default(), &[1, 2, 3], &[1, 2, 3], Duration::ZERO);
    publish(&c.service, 0..3);

    let promotions = c.service.fail_member(MemberId(2)).unwrap();
    assert!(promotions.is_empty());
    assert_eq!(c.service.primary_of(c.sub), Some(MemberId(1)));

    c.service.pump(c.sub).unwrap();
    assert_eq!(c.client.drain().len(), 4);

    let qrm = c.service.qrm_stats();
    assert_eq!(qrm.broadcasts, 3);
    // Member 3 received each broadcast; member 2 was unreachable.
    assert_eq!(qrm.messages_delivered, 3);
    assert_eq!(qrm.messages_dropped, 3);
    assert_eq!(c.service.queue_len(c.sub, MemberId(3)), Some(0));
}

#[test]
fn test_no_live_primary_is_reported() {
    let c = cluster(QueueConfig::default(), &[1], &[1], Duration::ZERO);
    publish(&c.service, 0..2);

    let promotions = c.service.fail_member(MemberId(1)).unwrap();
    assert_eq!(promotions.len(), 1);
    assert_eq!(promotions[0].promoted, None);
    assert_eq!(c.service.primary_of(c.sub), None);
    assert_eq!(c.service.get_role(c.sub, MemberId(1)), None);
    assert!(matches!(
        c.service.pump(c.sub),
        Err(QueueError::NoLiveMember(_))
    ));

    // Events with no live replica are not queued anywhere.
    publish(&c.service, 2..4);

    assert_eq!(c.service.recover_member(MemberId(1)).unwrap(), 1);
    assert_eq!(c.service.primary_of(c.sub), Some(MemberId(1)));
    publish(&c.service, 4..5);
    c.service.pump(c.sub).unwrap();

    let received = c.client.drain();
    let keys: Vec<&str> = received.iter().map(|e| e.key.as_str()).collect();
    // Nothing queued before the crash survives; only the new marker and KEY_4.
    assert!(received[0].is_marker());
    assert_eq!(received.len(), 2);
    assert_eq!(keys[1], "KEY_4");
}

#[test]
fn test_recovered_member_rejoins_as_secondary() {
    let c = cluster(QueueConfig::default(), &[1, 2], &[1, 2], Duration::ZERO);
    publish(&c.service, 0..3);

    c.service.fail_member(MemberId(2)).unwrap();
    publish(&c.service, 3..5);
    assert_eq!(c.service.queue_len(c.sub, MemberId(2)), Some(3));

    assert_eq!(c.service.recover_member(MemberId(2)).unwrap(), 1);
    assert_eq!(c.service.get_role(c.sub, MemberId(2)), Some(Role::Secondary));
    assert_eq!(c.service.primary_of(c.sub), Some(MemberId(1)));
    // Seeded from the primary's image, marker excluded.
    assert_eq!(c.service.queue_len(c.sub, MemberId(2)), Some(5));

    c.service.pump(c.sub).unwrap();
    assert_eq!(c.client.drain().len(), 6);
    assert_eq!(c.service.queue_len(c.sub, MemberId(2)), Some(0));
}

#[test]
fn test_recovered_former_primary_does_not_reclaim_role() {
    let c = cluster(QueueConfig::default(), &[1, 2], &[1, 2], Duration::ZERO);
    publish(&c.service, 0..2);
    c.service.pump(c.sub).unwrap();

    c.service.fail_member(MemberId(1)).unwrap();
    c.service.recover_member(MemberId(1)).unwrap();

    assert_eq!(c.service.primary_of(c.sub), Some(MemberId(2)));
    assert_eq!(c.service.get_role(c.sub, MemberId(1)), Some(Role::Secondary));

    publish(&c.service, 2..4);
    c.service.pump(c.sub).unwrap();
    assert_eq!(c.service.queue_len(c.sub, MemberId(1)), Some(0));
}

#[test]
fn test_restore_redundancy_converges() {
    let c = cluster(QueueConfig::default(), &[1, 2, 3], &[1, 2], Duration::ZERO);
    publish(&c.service, 0..4);

    let seeded = c.service.restore_redundancy(c.sub, MemberId(3)).unwrap();
    assert_eq!(seeded, 4);
    assert_eq!(c.service.get_role(c.sub, MemberId(3)), Some(Role::Secondary));

    publish(&c.service, 4..6);
    assert_eq!(c.service.queue_len(c.sub, MemberId(3)), Some(6));

    c.service.pump(c.sub).unwrap();
    let stats = c.service.get_stats(c.sub, MemberId(3)).unwrap();
    assert_eq!(stats.events_removed_by_qrm, 6);
    assert_eq!(c.service.queue_len(c.sub, MemberId(3)), Some(0));
}

#[test]
fn test_lost_broadcast_leaves_one_batch_behind() {
    let config = QueueConfig {
        ack_batch_size: 1,
        ..Default::default()
    };
    let c = cluster(config, &[1, 2], &[1, 2], Duration::from_secs(60));
    publish(&c.service, 0..22);

    c.service.qrm().lose_next_broadcasts(1);
    c.service.pump(c.sub).unwrap();

    let primary = c.service.get_stats(c.sub, MemberId(1)).unwrap();
    let secondary = c.service.get_stats(c.sub, MemberId(2)).unwrap();
    assert_eq!(primary.events_dispatched, 23);
    assert_eq!(secondary.events_removed_by_qrm + 1, 22);
    assert_eq!(c.service.queue_len(c.sub, MemberId(2)), Some(1));
    assert_eq!(c.service.qrm_stats().messages_dropped, 1);

    // A promoted secondary replays only the entry whose removal was lost.
    c.service.fail_member(MemberId(1)).unwrap();
    c.service.pump(c.sub).unwrap();

    let mut tracker = c.service.client_tracker();
    let outcomes: Vec<Observation> = c.client.drain().iter().map(|e| tracker.observe(e)).collect();
    assert_eq!(outcomes.len(), 25);
    assert_eq!(tracker.stats().duplicates, 1);
    assert_eq!(tracker.stats().fresh, 22);
}
