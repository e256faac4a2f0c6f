use bytes::Bytes;

use entity_replication::core::{ClientId, ConcurrencyKey, EntityId, EntityVersion, TransactionId};
use entity_replication::daemon::repl::{ActivityKind, AckKind, AckOutcome};

use crate::fixtures::rig::Rig;

#[test]
fn invoke_is_acknowledged_and_replicated() {
    let rig = Rig::new(2);
    rig.sync();
    let client = ClientId::random();
    let map = EntityId::new("Ledger", "orders").unwrap();

    rig.create(client, 1, &map);
    rig.invoke(client, 2, &map, EntityVersion::FIRST, b"k=1;x");
    let acks = rig.inbox.wait_retired(client, 2);

    let tx2: Vec<_> = acks
        .iter()
        .filter(|ack| ack.transaction == TransactionId::new(2))
        .collect();
    let kinds: Vec<_> = tx2.iter().map(|ack| ack.kind).collect();
    assert_eq!(kinds, vec![AckKind::Received, AckKind::Applied, AckKind::Retired]);
    assert_eq!(tx2[1].outcome, AckOutcome::Result(Bytes::from_static(b"1")));

    rig.settle();
    let carried = rig.network.carried();
    let invoke = carried
        .iter()
        .find(|envelope| envelope.activity.kind == ActivityKind::Invoke)
        .expect("invoke was replicated");
    assert_eq!(invoke.activity.entity(), Some(&map));
    assert_eq!(invoke.activity.key, ConcurrencyKey::new(1));
    assert_eq!(invoke.activity.payload, Bytes::from_static(b"k=1;x"));
    assert_eq!(
        invoke.activity.origin.as_ref().map(|origin| origin.transaction),
        Some(TransactionId::new(2))
    );

    // Receipt by the passive is recorded against the client's transaction order.
    assert_eq!(
        rig.active_store
            .replicated_through(client, rig.passive.local()),
        Some(TransactionId::new(2))
    );

    let sequences: Vec<u64> = carried.iter().map(|envelope| envelope.sequence).collect();
    let expected: Vec<u64> = (1..=carried.len() as u64).collect();
    assert_eq!(sequences, expected);

    assert_eq!(rig.passive_registry.snapshot(), rig.active_registry.snapshot());
    rig.shutdown();
}

#[test]
fn destroyed_entity_is_gone_on_both_sides() {
    let rig = Rig::new(2);
    rig.sync();
    let client = ClientId::random();
    let map = EntityId::new("Ledger", "scratch").unwrap();

    rig.create(client, 1, &map);
    rig.invoke(client, 2, &map, EntityVersion::FIRST, b"k=2;a");
    rig.inbox.wait_retired(client, 2);
    rig.destroy(client, 3, &map, EntityVersion::FIRST);
    rig.settle();

    assert!(rig.active_registry.snapshot().is_empty());
    assert!(rig.passive_registry.snapshot().is_empty());
    rig.shutdown();
}

#[test]
fn entities_created_before_sync_reach_the_passive() {
    let rig = Rig::new(3);
    let client = ClientId::random();
    let map = EntityId::new("Ledger", "early").unwrap();

    rig.create(client, 1, &map);
    for (tx, payload) in [(2, "k=1;a"), (3, "k=2;b"), (4, "k=1;c")] {
        rig.invoke(client, tx, &map, EntityVersion::FIRST, payload.as_bytes());
    }
    rig.inbox.wait_retired(client, 4);
    rig.inbox.wait_retired(client, 3);

    rig.sync();
    rig.settle();

    assert_eq!(
        rig.passive_registry.key_log(&map, ConcurrencyKey::new(1)),
        vec![Bytes::from_static(b"k=1;a"), Bytes::from_static(b"k=1;c")]
    );
    assert_eq!(rig.passive_registry.snapshot(), rig.active_registry.snapshot());
    // Snapshot state arrives as sync payloads, not invokes.
    assert_eq!(rig.passive_registry.invokes(), 0);
    rig.shutdown();
}
