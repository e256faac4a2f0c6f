use bytes::Bytes;

use entity_replication::core::{ClientId, ConcurrencyKey, EntityId, EntityVersion, TransactionId};
use entity_replication::daemon::repl::AckKind;

use crate::fixtures::rig::Rig;

#[test]
fn disconnect_before_apply_purges_acks_but_still_replicates() {
    let rig = Rig::new(2);
    rig.sync();
    let client = ClientId::random();
    let bystander = ClientId::random();
    let map = EntityId::new("Ledger", "gone").unwrap();
    let key = ConcurrencyKey::new(1);

    rig.create(client, 1, &map);
    rig.active_registry.gate(key);
    rig.invoke(client, 2, &map, EntityVersion::FIRST, b"k=1;orphan");
    rig.invoke(bystander, 1, &map, EntityVersion::FIRST, b"k=1;kept");

    let purged = rig.active.ingress().client_disconnected(client).unwrap();
    assert_eq!(purged, 1);
    rig.active_registry.open(key);

    rig.inbox.wait_retired(bystander, 1);
    rig.settle();

    let orphan: Vec<AckKind> = rig
        .inbox
        .acks(client)
        .into_iter()
        .filter(|ack| ack.transaction == TransactionId::new(2))
        .map(|ack| ack.kind)
        .collect();
    assert_eq!(orphan, vec![AckKind::Received]);

    let expected = vec![Bytes::from_static(b"k=1;orphan"), Bytes::from_static(b"k=1;kept")];
    assert_eq!(rig.active_registry.key_log(&map, key), expected);
    assert_eq!(rig.passive_registry.key_log(&map, key), expected);
    assert_eq!(rig.active.ingress().pending_retirements(&map), 0);
    rig.shutdown();
}
