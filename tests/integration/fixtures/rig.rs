#![allow(dead_code)]

//! An active and a passive wired together in-process.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::Sender;

use entity_replication::config::{Config, ServerRole};
use entity_replication::core::{
    ClientId, EntityDescriptor, EntityId, EntityVersion, NodeId, ServerEntityAction,
    TransactionId,
};
use entity_replication::daemon::repl::{
    AckKind, ClientRequest, ReplEnvelope, ReplMessage, SenderHandle, ServerAck,
};
use entity_replication::daemon::{
    ActiveParts, ActiveServer, ChannelError, ClientChannels, PassiveServer, ReplicationTransport,
    TransportError,
};

use super::ledger::{LedgerRegistry, VecOrderStore};

pub const WAIT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client acks, per client, with a blocking wait.
#[derive(Default)]
pub struct Inbox {
    acks: Mutex<HashMap<ClientId, Vec<ServerAck>>>,
    changed: Condvar,
}

impl Inbox {
    pub fn acks(&self, client: ClientId) -> Vec<ServerAck> {
        lock(&self.acks).get(&client).cloned().unwrap_or_default()
    }

    /// Waits until `transaction` has been retired for `client`.
    pub fn wait_retired(&self, client: ClientId, transaction: u64) -> Vec<ServerAck> {
        let deadline = Instant::now() + WAIT;
        let mut acks = lock(&self.acks);
        loop {
            let retired = acks.get(&client).is_some_and(|list| {
                list.iter().any(|ack| {
                    ack.kind == AckKind::Retired && ack.transaction == TransactionId::new(transaction)
                })
            });
            if retired {
                return acks.get(&client).cloned().unwrap_or_default();
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("tx {transaction} of {client} never retired"));
            acks = self
                .changed
                .wait_timeout(acks, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl ClientChannels for Inbox {
    fn send(&self, client: ClientId, ack: ServerAck) -> Result<(), ChannelError> {
        lock(&self.acks).entry(client).or_default().push(ack);
        self.changed.notify_all();
        Ok(())
    }
}

#[derive(Clone)]
enum Route {
    Passive(Sender<ReplEnvelope>),
    Active(SenderHandle),
}

/// Delivers activities to passive inboxes and ack batches to the active's
/// sender, keeping a copy of every activity it carried.
#[derive(Default)]
pub struct Loopback {
    routes: Mutex<HashMap<NodeId, Route>>,
    carried: Mutex<Vec<ReplEnvelope>>,
}

impl Loopback {
    pub fn carried(&self) -> Vec<ReplEnvelope> {
        lock(&self.carried).clone()
    }

    fn connect(&self, node: NodeId, route: Route) {
        lock(&self.routes).insert(node, route);
    }

    fn disconnect_all(&self) {
        lock(&self.routes).clear();
    }
}

impl ReplicationTransport for Loopback {
    fn send(&self, peer: NodeId, message: ReplMessage) -> Result<(), TransportError> {
        let route = lock(&self.routes)
            .get(&peer)
            .cloned()
            .ok_or(TransportError::Disconnected(peer))?;
        let delivered = match (&route, message) {
            (Route::Passive(inbox), ReplMessage::Activity(envelope)) => {
                lock(&self.carried).push(envelope.clone());
                inbox.send(envelope).is_ok()
            }
            (Route::Active(sender), ReplMessage::Acks(batch)) => sender.deliver_acks(batch).is_ok(),
            _ => false,
        };
        if delivered {
            Ok(())
        } else {
            Err(TransportError::SendFailed {
                peer,
                reason: "route closed or message misdirected".to_string(),
            })
        }
    }
}

pub struct Rig {
    pub active: ActiveServer,
    pub passive: PassiveServer,
    pub active_registry: Arc<LedgerRegistry>,
    pub passive_registry: Arc<LedgerRegistry>,
    pub active_store: Arc<VecOrderStore>,
    pub inbox: Arc<Inbox>,
    pub network: Arc<Loopback>,
}

impl Rig {
    pub fn new(workers: usize) -> Self {
        let mut active_config = Config::default();
        active_config.lanes.workers = workers;
        let mut passive_config = active_config.clone();
        passive_config.replication.role = ServerRole::Passive;

        let network = Arc::new(Loopback::default());
        let inbox = Arc::new(Inbox::default());
        let active_registry = Arc::new(LedgerRegistry::new());
        let passive_registry = Arc::new(LedgerRegistry::new());
        let active_store = Arc::new(VecOrderStore::new());

        let active = ActiveServer::start(
            &active_config,
            ActiveParts {
                local: NodeId::random(),
                registry: active_registry.clone(),
                store: active_store.clone(),
                clients: inbox.clone(),
                transport: network.clone(),
            },
        )
        .expect("start active");
        let passive = PassiveServer::start(
            &passive_config,
            NodeId::random(),
            passive_registry.clone(),
            Arc::new(VecOrderStore::new()),
            network.clone(),
        )
        .expect("start passive");

        network.connect(passive.local(), Route::Passive(passive.inbound().clone()));
        network.connect(
            active.local(),
            Route::Active(active.replication_handle().expect("replication enabled")),
        );

        Self {
            active,
            passive,
            active_registry,
            passive_registry,
            active_store,
            inbox,
            network,
        }
    }

    pub fn sync(&self) {
        self.active
            .sync_passive(self.passive.local())
            .expect("passive sync");
    }

    pub fn create(&self, client: ClientId, tx: u64, entity: &EntityId) {
        self.submit(client, tx, entity, EntityVersion::NONE, ServerEntityAction::Create, b"");
        self.inbox.wait_retired(client, tx);
    }

    pub fn destroy(&self, client: ClientId, tx: u64, entity: &EntityId, version: EntityVersion) {
        self.submit(client, tx, entity, version, ServerEntityAction::Destroy, b"");
        self.inbox.wait_retired(client, tx);
    }

    pub fn invoke(
        &self,
        client: ClientId,
        tx: u64,
        entity: &EntityId,
        version: EntityVersion,
        payload: &[u8],
    ) {
        self.submit(client, tx, entity, version, ServerEntityAction::Invoke, payload);
    }

    fn submit(
        &self,
        client: ClientId,
        tx: u64,
        entity: &EntityId,
        version: EntityVersion,
        action: ServerEntityAction,
        payload: &[u8],
    ) {
        let request = ClientRequest {
            descriptor: EntityDescriptor::internal(entity.clone(), version),
            transaction: TransactionId::new(tx),
            oldest_outstanding: TransactionId::new(1),
            action,
            payload: Bytes::copy_from_slice(payload),
        };
        // Rejections are acknowledged like any other outcome.
        let _ = self.active.ingress().submit(client, request);
    }

    /// Waits until the passive has completed everything sent to it.
    pub fn settle(&self) {
        let passive = self.passive.local();
        let deadline = Instant::now() + WAIT;
        loop {
            let progress = self
                .active
                .passive_progress(passive)
                .expect("sender running")
                .expect("passive attached");
            if progress.in_flight == 0 && progress.completed_through == progress.highest_sent {
                return;
            }
            assert!(Instant::now() < deadline, "passive never caught up: {progress:?}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn shutdown(self) {
        self.active.shutdown();
        // The passive stops once the last inbound sender is gone.
        self.network.disconnect_all();
        self.passive.shutdown().expect("passive session clean");
    }
}
