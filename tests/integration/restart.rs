//! An active restarted over the same order store.

use std::sync::Arc;

use bytes::Bytes;

use entity_replication::config::Config;
use entity_replication::core::{
    ClientId, EntityDescriptor, EntityId, EntityVersion, NodeId, ServerEntityAction,
    TransactionId,
};
use entity_replication::daemon::repl::{AckKind, AckOutcome, ClientRequest};
use entity_replication::daemon::{ActiveParts, ActiveServer, EntityRegistry, ResendOutcome};

use crate::fixtures::ledger::{LedgerRegistry, VecOrderStore};
use crate::fixtures::rig::{Inbox, Loopback};

fn start(
    store: Arc<VecOrderStore>,
    registry: Arc<LedgerRegistry>,
    inbox: Arc<Inbox>,
) -> ActiveServer {
    let mut config = Config::default();
    config.replication.enabled = false;
    config.lanes.workers = 2;
    ActiveServer::start(
        &config,
        ActiveParts {
            local: NodeId::random(),
            registry,
            store,
            clients: inbox,
            transport: Arc::new(Loopback::default()),
        },
    )
    .unwrap()
}

fn request(
    entity: &EntityId,
    version: EntityVersion,
    tx: u64,
    action: ServerEntityAction,
    payload: &'static [u8],
) -> ClientRequest {
    ClientRequest {
        descriptor: EntityDescriptor::internal(entity.clone(), version),
        transaction: TransactionId::new(tx),
        oldest_outstanding: TransactionId::new(1),
        action,
        payload: Bytes::from_static(payload),
    }
}

#[test]
fn restart_reloads_entities_and_answers_resends_from_the_journal() {
    let store = Arc::new(VecOrderStore::new());
    let client = ClientId::random();
    let names: Vec<EntityId> = ["a", "b", "c"]
        .iter()
        .map(|name| EntityId::new("Ledger", *name).unwrap())
        .collect();

    let inbox = Arc::new(Inbox::default());
    let first = start(store.clone(), Arc::new(LedgerRegistry::new()), inbox.clone());
    for (n, entity) in names.iter().enumerate() {
        let tx = n as u64 + 1;
        let create = request(entity, EntityVersion::NONE, tx, ServerEntityAction::Create, b"");
        first.ingress().submit(client, create).unwrap();
        inbox.wait_retired(client, tx);
    }
    first
        .ingress()
        .submit(
            client,
            request(&names[0], EntityVersion::FIRST, 4, ServerEntityAction::Invoke, b"k=1;x"),
        )
        .unwrap();
    inbox.wait_retired(client, 4);
    first.shutdown();

    let registry = Arc::new(LedgerRegistry::new());
    let inbox = Arc::new(Inbox::default());
    let second = start(store, registry.clone(), inbox.clone());
    let reloaded: Vec<EntityId> = registry.entities().into_iter().map(|(id, _)| id).collect();
    assert_eq!(reloaded, names);

    let outcome = second
        .ingress()
        .handle_resend(
            client,
            request(&names[0], EntityVersion::FIRST, 4, ServerEntityAction::Invoke, b"k=1;x"),
        )
        .unwrap();
    assert_eq!(outcome, ResendOutcome::Answered);
    let acks = inbox.acks(client);
    let kinds: Vec<AckKind> = acks.iter().map(|ack| ack.kind).collect();
    assert_eq!(kinds, vec![AckKind::Received, AckKind::Applied, AckKind::Retired]);
    assert_eq!(acks[1].outcome, AckOutcome::Result(Bytes::from_static(b"1")));
    // Answered from the journal; the fresh registry never saw the invoke.
    assert_eq!(registry.invokes(), 0);
    second.shutdown();
}
