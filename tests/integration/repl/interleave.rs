//! Sync frames and live ops interleaved on one stream, driven by hand.

use std::sync::Arc;

use bytes::Bytes;

use entity_replication::core::{
    ConcurrencyKey, EntityDescriptor, EntityId, EntityVersion, Limits, NodeId, ServerEntityAction,
};
use entity_replication::daemon::EntityRegistry;
use entity_replication::daemon::repl::{
    ActivityKind, CompletionResult, ReplAckKind, ReplEnvelope, ReplicationAck,
    ReplicationReceiver, ReplicationSender, SyncEntity, SyncPhase, SyncReplicationActivity,
};

use crate::fixtures::ledger::{LedgerRegistry, VecOrderStore};

const KEY: ConcurrencyKey = ConcurrencyKey::new(1);

struct Link {
    active: NodeId,
    passive: NodeId,
    sender: ReplicationSender,
    receiver: ReplicationReceiver,
    acks: Vec<ReplicationAck>,
    delivered: Vec<ActivityKind>,
}

impl Link {
    fn new(registry: Arc<LedgerRegistry>) -> Self {
        let active = NodeId::random();
        let passive = NodeId::random();
        let mut sender = ReplicationSender::new(active);
        sender.add_passive(passive);
        Self {
            active,
            passive,
            sender,
            receiver: ReplicationReceiver::new(
                registry,
                Arc::new(VecOrderStore::new()),
                Limits::default(),
            ),
            acks: Vec::new(),
            delivered: Vec::new(),
        }
    }

    fn sync_frame(&mut self, activity: SyncReplicationActivity) -> bool {
        let outbound = self.sender.send_to(self.passive, activity).unwrap();
        self.deliver(outbound.envelope)
    }

    fn live(&mut self, activity: SyncReplicationActivity) -> bool {
        let mut outbound = self.sender.fan_out(&activity);
        assert_eq!(outbound.len(), 1);
        self.deliver(outbound.remove(0).envelope)
    }

    fn deliver(&mut self, envelope: Option<ReplEnvelope>) -> bool {
        let Some(envelope) = envelope else {
            return false;
        };
        self.delivered.push(envelope.activity.kind);
        let acks = self.receiver.handle_envelope(envelope).unwrap();
        self.acks.extend(acks);
        true
    }
}

fn invoke(
    entity: &EntityId,
    version: EntityVersion,
    payload: &'static [u8],
) -> SyncReplicationActivity {
    SyncReplicationActivity::live(
        ActivityKind::Invoke,
        entity.clone(),
        version,
        KEY,
        Bytes::from_static(payload),
        None,
    )
}

fn apply_invoke(
    registry: &LedgerRegistry,
    entity: &EntityId,
    version: EntityVersion,
    payload: &'static [u8],
) {
    registry
        .apply_action(
            &EntityDescriptor::internal(entity.clone(), version),
            ServerEntityAction::Invoke,
            KEY,
            &Bytes::from_static(payload),
        )
        .unwrap();
}

#[test]
fn recreate_during_sync_suppresses_stale_frames() {
    let active = LedgerRegistry::new();
    let passive = Arc::new(LedgerRegistry::new());
    let mut link = Link::new(passive.clone());
    let map = EntityId::new("Ledger", "m").unwrap();
    let v1 = EntityVersion::FIRST;
    let v2 = v1.next();

    active.create_entity(&map, None, &Bytes::new()).unwrap();
    apply_invoke(&active, &map, v1, b"k=1;old");

    assert!(link.sync_frame(SyncReplicationActivity::start_sync(vec![SyncEntity {
        entity: map.clone(),
        version: v1,
        config: Bytes::new(),
    }])));

    // Live traffic for an entity whose sync has not begun only lets DESTROY through.
    assert!(!link.live(invoke(&map, v1, b"k=1;late")));
    active
        .apply_action(
            &EntityDescriptor::internal(map.clone(), v1),
            ServerEntityAction::Destroy,
            ConcurrencyKey::MANAGEMENT,
            &Bytes::new(),
        )
        .unwrap();
    assert!(link.live(SyncReplicationActivity::live(
        ActivityKind::Destroy,
        map.clone(),
        v1,
        ConcurrencyKey::MANAGEMENT,
        Bytes::new(),
        None,
    )));

    assert_eq!(active.create_entity(&map, None, &Bytes::new()).unwrap(), v2);
    assert!(link.live(SyncReplicationActivity::live(
        ActivityKind::Create,
        map.clone(),
        v2,
        ConcurrencyKey::MANAGEMENT,
        Bytes::new(),
        None,
    )));
    apply_invoke(&active, &map, v2, b"k=1;new");
    assert!(link.live(invoke(&map, v2, b"k=1;new")));

    // The sync driver still walks the snapshot's incarnation.
    assert!(!link.sync_frame(SyncReplicationActivity::start_entity(map.clone(), v1, Bytes::new())));
    assert!(!link.sync_frame(SyncReplicationActivity::start_key(map.clone(), v1, KEY)));
    assert!(!link.sync_frame(SyncReplicationActivity::sync_payload(
        map.clone(),
        v1,
        KEY,
        Bytes::from_static(b"k=1;old"),
    )));
    assert!(!link.sync_frame(SyncReplicationActivity::end_key(map.clone(), v1, KEY)));
    assert!(!link.sync_frame(SyncReplicationActivity::end_entity(map.clone(), v1)));
    assert!(link.sync_frame(SyncReplicationActivity::end_sync()));

    assert_eq!(
        link.delivered,
        vec![
            ActivityKind::StartSync,
            ActivityKind::Destroy,
            ActivityKind::Create,
            ActivityKind::Invoke,
            ActivityKind::EndSync,
        ]
    );
    assert_eq!(link.receiver.phase(), SyncPhase::Done);
    assert_eq!(passive.snapshot(), active.snapshot());
    assert!(
        link.acks
            .iter()
            .all(|ack| ack.kind != ReplAckKind::Completed(CompletionResult::Fail)),
        "{:?}",
        link.acks
    );
}

#[test]
fn recreate_after_entity_sync_began_keeps_new_incarnation_traffic() {
    let active = LedgerRegistry::new();
    let passive = Arc::new(LedgerRegistry::new());
    let mut link = Link::new(passive.clone());
    let map = EntityId::new("Ledger", "m").unwrap();
    let v1 = EntityVersion::FIRST;
    let v2 = v1.next();

    active.create_entity(&map, None, &Bytes::new()).unwrap();
    apply_invoke(&active, &map, v1, b"k=1;old");

    assert!(link.sync_frame(SyncReplicationActivity::start_sync(vec![SyncEntity {
        entity: map.clone(),
        version: v1,
        config: Bytes::new(),
    }])));
    assert!(link.sync_frame(SyncReplicationActivity::start_entity(map.clone(), v1, Bytes::new())));

    // Client jobs queued between START_ENTITY and the key jobs.
    active
        .apply_action(
            &EntityDescriptor::internal(map.clone(), v1),
            ServerEntityAction::Destroy,
            ConcurrencyKey::MANAGEMENT,
            &Bytes::new(),
        )
        .unwrap();
    assert!(link.live(SyncReplicationActivity::live(
        ActivityKind::Destroy,
        map.clone(),
        v1,
        ConcurrencyKey::MANAGEMENT,
        Bytes::new(),
        None,
    )));
    assert_eq!(active.create_entity(&map, None, &Bytes::new()).unwrap(), v2);
    assert!(link.live(SyncReplicationActivity::live(
        ActivityKind::Create,
        map.clone(),
        v2,
        ConcurrencyKey::MANAGEMENT,
        Bytes::new(),
        None,
    )));
    apply_invoke(&active, &map, v2, b"k=1;new");
    assert!(link.live(invoke(&map, v2, b"k=1;new")));

    // The key job finds v2 in the registry and sends no payloads.
    assert!(!link.sync_frame(SyncReplicationActivity::start_key(map.clone(), v1, KEY)));
    assert!(!link.sync_frame(SyncReplicationActivity::end_key(map.clone(), v1, KEY)));
    assert!(!link.sync_frame(SyncReplicationActivity::end_entity(map.clone(), v1)));
    assert!(link.sync_frame(SyncReplicationActivity::end_sync()));

    assert_eq!(
        link.delivered,
        vec![
            ActivityKind::StartSync,
            ActivityKind::StartEntity,
            ActivityKind::Destroy,
            ActivityKind::Create,
            ActivityKind::Invoke,
            ActivityKind::EndSync,
        ]
    );
    assert_eq!(link.receiver.phase(), SyncPhase::Done);
    assert_eq!(passive.snapshot(), active.snapshot());
    assert!(
        link.acks
            .iter()
            .all(|ack| ack.kind != ReplAckKind::Completed(CompletionResult::Fail)),
        "{:?}",
        link.acks
    );
}

#[test]
fn ops_on_the_syncing_key_wait_for_its_end() {
    let active = LedgerRegistry::new();
    let passive = Arc::new(LedgerRegistry::new());
    let mut link = Link::new(passive.clone());
    let map = EntityId::new("Ledger", "m").unwrap();
    let v1 = EntityVersion::FIRST;

    active.create_entity(&map, None, &Bytes::new()).unwrap();
    apply_invoke(&active, &map, v1, b"k=1;a");

    link.sync_frame(SyncReplicationActivity::start_sync(vec![SyncEntity {
        entity: map.clone(),
        version: v1,
        config: Bytes::new(),
    }]));
    link.sync_frame(SyncReplicationActivity::start_entity(map.clone(), v1, Bytes::new()));
    link.sync_frame(SyncReplicationActivity::start_key(map.clone(), v1, KEY));
    link.sync_frame(SyncReplicationActivity::sync_payload(
        map.clone(),
        v1,
        KEY,
        Bytes::from_static(b"k=1;a"),
    ));

    apply_invoke(&active, &map, v1, b"k=1;b");
    assert!(link.live(invoke(&map, v1, b"k=1;b")));
    assert_eq!(link.receiver.buffered(), 1);
    assert_eq!(passive.key_log(&map, KEY), vec![Bytes::from_static(b"k=1;a")]);

    link.sync_frame(SyncReplicationActivity::end_key(map.clone(), v1, KEY));
    assert_eq!(link.receiver.buffered(), 0);
    link.sync_frame(SyncReplicationActivity::end_entity(map.clone(), v1));
    link.sync_frame(SyncReplicationActivity::end_sync());

    assert_eq!(passive.snapshot(), active.snapshot());
    // The buffered invoke completes only once the key window closes.
    let buffered_seq = 5;
    let position = |kind: ReplAckKind| {
        link.acks
            .iter()
            .position(|ack| ack.sequence == buffered_seq && ack.kind == kind)
            .unwrap()
    };
    let end_key_received = link
        .acks
        .iter()
        .position(|ack| ack.sequence == 6 && ack.kind == ReplAckKind::Received)
        .unwrap();
    assert!(position(ReplAckKind::Received) < end_key_received);
    assert!(position(ReplAckKind::Completed(CompletionResult::Success)) > end_key_received);
}

#[test]
fn duplicate_envelope_is_acknowledged_without_reapplying() {
    let passive = Arc::new(LedgerRegistry::new());
    let mut link = Link::new(passive.clone());
    let map = EntityId::new("Ledger", "dup").unwrap();

    link.sync_frame(SyncReplicationActivity::start_sync(Vec::new()));
    link.sync_frame(SyncReplicationActivity::end_sync());
    link.live(SyncReplicationActivity::live(
        ActivityKind::Create,
        map.clone(),
        EntityVersion::FIRST,
        ConcurrencyKey::MANAGEMENT,
        Bytes::new(),
        None,
    ));

    let mut outbound = link.sender.fan_out(&invoke(&map, EntityVersion::FIRST, b"k=1;once"));
    let envelope = outbound.remove(0).envelope.unwrap();
    let sequence = envelope.sequence;

    let first = link.receiver.handle_envelope(envelope.clone()).unwrap();
    assert_eq!(
        first,
        vec![
            ReplicationAck::received(sequence),
            ReplicationAck::completed(sequence, CompletionResult::Success),
        ]
    );
    let again = link.receiver.handle_envelope(envelope).unwrap();
    assert_eq!(
        again,
        vec![
            ReplicationAck::received(sequence),
            ReplicationAck::completed(sequence, CompletionResult::None),
        ]
    );
    assert_eq!(passive.invokes(), 1);
    assert_eq!(passive.key_log(&map, KEY), vec![Bytes::from_static(b"k=1;once")]);
    assert_eq!(link.receiver.highest_sequence(link.active), sequence);
}
