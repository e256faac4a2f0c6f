//! In-memory collaborators for unit and integration tests.
//!
//! `MemoryRegistry` models a keyed log per entity: every INVOKE appends its
//! payload to the key the payload names (`k=<n>;...`, default key 1), and a
//! payload containing `follow:<rest>` asks for a follow-up invoke of `<rest>`.
//! Payloads starting with `fail` are rejected by the entity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::core::{
    ClientId, ConcurrencyKey, EntityDescriptor, EntityError, EntityId, EntityVersion, NodeId,
    ServerEntityAction, TransactionId,
};
use crate::daemon::collab::{
    ApplyOutcome, ChannelError, ClientChannels, EntityInfo, EntityRegistry, PersistedEntity,
    ReplicationTransport, StoreError, TransactionOrderStore, TransportError,
};
use crate::daemon::repl::proto::{ReplMessage, ServerAck};

/// Manually advanced clock for timeout tests.
#[derive(Clone)]
pub struct TestClock {
    base: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.offset_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

struct EntityRecord {
    version: EntityVersion,
    config: Bytes,
    created: u64,
    keys: BTreeMap<ConcurrencyKey, Vec<Bytes>>,
}

#[derive(Default)]
struct RegistryState {
    entities: HashMap<EntityId, EntityRecord>,
    last_version: HashMap<EntityId, EntityVersion>,
    applied: HashMap<EntityId, Vec<Bytes>>,
    next_created: u64,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

const FOLLOW_MARKER: &[u8] = b"follow:";

fn parse_key(payload: &[u8]) -> ConcurrencyKey {
    let Some(rest) = payload.strip_prefix(b"k=") else {
        return ConcurrencyKey::new(1);
    };
    let end = rest.iter().position(|b| *b == b';').unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end])
        .ok()
        .and_then(|raw| raw.parse::<i32>().ok())
        .map_or(ConcurrencyKey::new(1), ConcurrencyKey::new)
}

fn follow_up_of(payload: &Bytes) -> Option<Bytes> {
    payload
        .windows(FOLLOW_MARKER.len())
        .position(|window| window == FOLLOW_MARKER)
        .map(|at| payload.slice(at + FOLLOW_MARKER.len()..))
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invoke and sync payload applied to `entity`, across incarnations.
    pub fn applied(&self, entity: &EntityId) -> Vec<Bytes> {
        let state = self.state.lock().unwrap();
        state.applied.get(entity).cloned().unwrap_or_default()
    }

    pub fn key_state(&self, entity: &EntityId, key: ConcurrencyKey) -> Vec<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .entities
            .get(entity)
            .and_then(|record| record.keys.get(&key).cloned())
            .unwrap_or_default()
    }

    /// Puts state on a key without going through apply.
    pub fn seed_key(&self, entity: &EntityId, key: ConcurrencyKey, payload: Bytes) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.entities.get_mut(entity) {
            record.keys.entry(key).or_default().push(payload);
        }
    }
}

impl EntityRegistry for MemoryRegistry {
    fn create_entity(
        &self,
        entity: &EntityId,
        version: Option<EntityVersion>,
        config: &Bytes,
    ) -> Result<EntityVersion, EntityError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.entities.get(entity) {
            return Err(EntityError::AlreadyExists {
                entity: entity.clone(),
                version: existing.version,
            });
        }
        let last = state
            .last_version
            .get(entity)
            .copied()
            .unwrap_or(EntityVersion::NONE);
        let version = version.unwrap_or_else(|| last.next());
        state
            .last_version
            .insert(entity.clone(), version.max(last));
        let created = state.next_created;
        state.next_created += 1;
        state.entities.insert(
            entity.clone(),
            EntityRecord {
                version,
                config: config.clone(),
                created,
                keys: BTreeMap::new(),
            },
        );
        Ok(version)
    }

    fn get_entity(&self, entity: &EntityId) -> Option<EntityInfo> {
        let state = self.state.lock().unwrap();
        state.entities.get(entity).map(|record| EntityInfo {
            version: record.version,
            config: record.config.clone(),
        })
    }

    fn apply_action(
        &self,
        descriptor: &EntityDescriptor,
        action: ServerEntityAction,
        key: ConcurrencyKey,
        payload: &Bytes,
    ) -> Result<ApplyOutcome, EntityError> {
        let entity = &descriptor.entity;
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.entities.get_mut(entity) else {
            return Err(EntityError::NotFound {
                entity: entity.clone(),
            });
        };
        if record.version != descriptor.version {
            return Err(EntityError::VersionMismatch {
                entity: entity.clone(),
                expected: descriptor.version,
                found: record.version,
            });
        }
        let mut applied = None;
        let outcome = match action {
            ServerEntityAction::Create => {
                return Err(EntityError::Refused {
                    reason: "create goes through create_entity".to_string(),
                });
            }
            ServerEntityAction::Destroy => {
                state.entities.remove(entity);
                ApplyOutcome::default()
            }
            ServerEntityAction::Reconfigure => {
                record.config = payload.clone();
                ApplyOutcome::new(payload.clone())
            }
            ServerEntityAction::Invoke => {
                if payload.starts_with(b"fail") {
                    return Err(EntityError::ApplyFailed {
                        entity: entity.clone(),
                        reason: "payload asked to fail".to_string(),
                    });
                }
                record.keys.entry(key).or_default().push(payload.clone());
                applied = Some(payload.clone());
                let outcome = ApplyOutcome::new(payload.clone());
                match follow_up_of(payload) {
                    Some(next) => outcome.with_follow_up(next),
                    None => outcome,
                }
            }
            ServerEntityAction::ReceiveSyncEntityKeyStart => {
                record.keys.remove(&key);
                ApplyOutcome::default()
            }
            ServerEntityAction::ReceiveSyncPayload => {
                record.keys.entry(key).or_default().push(payload.clone());
                applied = Some(payload.clone());
                ApplyOutcome::default()
            }
            ServerEntityAction::ReceiveSyncEntityStart
            | ServerEntityAction::ReceiveSyncEntityKeyEnd
            | ServerEntityAction::ReceiveSyncEntityEnd => ApplyOutcome::default(),
        };
        if let Some(payload) = applied {
            state.applied.entry(entity.clone()).or_default().push(payload);
        }
        Ok(outcome)
    }

    fn partition_key_for(
        &self,
        _entity: &EntityId,
        payload: &Bytes,
    ) -> Result<ConcurrencyKey, EntityError> {
        Ok(parse_key(payload))
    }

    fn entities(&self) -> Vec<(EntityId, EntityInfo)> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<(u64, EntityId, EntityInfo)> = state
            .entities
            .iter()
            .map(|(id, record)| {
                (
                    record.created,
                    id.clone(),
                    EntityInfo {
                        version: record.version,
                        config: record.config.clone(),
                    },
                )
            })
            .collect();
        out.sort_by_key(|(created, _, _)| *created);
        out.into_iter().map(|(_, id, info)| (id, info)).collect()
    }

    fn concurrency_keys(&self, entity: &EntityId) -> Vec<ConcurrencyKey> {
        let state = self.state.lock().unwrap();
        state
            .entities
            .get(entity)
            .map(|record| record.keys.keys().copied().collect())
            .unwrap_or_default()
    }

    fn sync_payloads(
        &self,
        entity: &EntityId,
        key: ConcurrencyKey,
    ) -> Result<Vec<Bytes>, EntityError> {
        let state = self.state.lock().unwrap();
        let record = state
            .entities
            .get(entity)
            .ok_or_else(|| EntityError::NotFound {
                entity: entity.clone(),
            })?;
        Ok(record.keys.get(&key).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct StoreState {
    orders: HashMap<ClientId, BTreeSet<TransactionId>>,
    watermarks: HashMap<ClientId, TransactionId>,
    replicated: HashMap<(ClientId, NodeId), TransactionId>,
    results: HashMap<(ClientId, TransactionId), Result<Bytes, EntityError>>,
    entities: Vec<PersistedEntity>,
    next_order: u64,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<StoreState>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn applied_order(&self, client: ClientId) -> Vec<TransactionId> {
        let state = self.state.lock().unwrap();
        state
            .orders
            .get(&client)
            .map(|txs| txs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Highest transaction of `client` that `passive` confirmed.
    pub fn replicated_through(&self, client: ClientId, passive: NodeId) -> Option<TransactionId> {
        let state = self.state.lock().unwrap();
        state.replicated.get(&(client, passive)).copied()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, StoreState>, StoreError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(state)
    }
}

impl TransactionOrderStore for MemoryOrderStore {
    fn record_applied_order(
        &self,
        client: ClientId,
        transaction: TransactionId,
        oldest_outstanding: TransactionId,
    ) -> Result<(), StoreError> {
        let mut state = self.guard()?;
        state.watermarks.insert(client, oldest_outstanding);
        let orders = state.orders.entry(client).or_default();
        orders.insert(transaction);
        orders.retain(|tx| *tx >= oldest_outstanding);
        state
            .results
            .retain(|(owner, tx), _| *owner != client || *tx >= oldest_outstanding);
        Ok(())
    }

    fn record_result(
        &self,
        client: ClientId,
        transaction: TransactionId,
        result: &Result<Bytes, EntityError>,
    ) -> Result<(), StoreError> {
        let mut state = self.guard()?;
        state.results.insert((client, transaction), result.clone());
        Ok(())
    }

    fn journaled_result(
        &self,
        client: ClientId,
        transaction: TransactionId,
    ) -> Result<Option<Result<Bytes, EntityError>>, StoreError> {
        let state = self.guard()?;
        Ok(state.results.get(&(client, transaction)).cloned())
    }

    fn record_replicated(
        &self,
        client: ClientId,
        transaction: TransactionId,
        passive: NodeId,
    ) -> Result<(), StoreError> {
        let mut state = self.guard()?;
        let through = state.replicated.entry((client, passive)).or_insert(transaction);
        *through = (*through).max(transaction);
        Ok(())
    }

    fn oldest_outstanding(&self, client: ClientId) -> Result<Option<TransactionId>, StoreError> {
        let state = self.guard()?;
        Ok(state.watermarks.get(&client).copied())
    }

    fn record_entity_created(
        &self,
        entity: &EntityId,
        version: EntityVersion,
        config: &Bytes,
    ) -> Result<(), StoreError> {
        let mut state = self.guard()?;
        state.entities.retain(|existing| &existing.entity != entity);
        let creation_order = state.next_order;
        state.next_order += 1;
        state.entities.push(PersistedEntity {
            entity: entity.clone(),
            version,
            config: config.clone(),
            creation_order,
        });
        Ok(())
    }

    fn record_entity_destroyed(&self, entity: &EntityId) -> Result<(), StoreError> {
        let mut state = self.guard()?;
        state.entities.retain(|existing| &existing.entity != entity);
        Ok(())
    }

    fn load_existing_entities(&self) -> Result<Vec<PersistedEntity>, StoreError> {
        let state = self.guard()?;
        Ok(state.entities.clone())
    }

    fn forget_client(&self, client: ClientId) -> Result<(), StoreError> {
        let mut state = self.guard()?;
        state.orders.remove(&client);
        state.watermarks.remove(&client);
        state.replicated.retain(|(owner, _), _| *owner != client);
        state.results.retain(|(owner, _), _| *owner != client);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingClientChannels {
    acks: Mutex<HashMap<ClientId, Vec<ServerAck>>>,
    disconnected: Mutex<HashSet<ClientId>>,
    changed: Condvar,
}

impl RecordingClientChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acks(&self, client: ClientId) -> Vec<ServerAck> {
        self.acks
            .lock()
            .unwrap()
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    /// Blocks until `client` has at least `count` acks.
    pub fn wait_for(
        &self,
        client: ClientId,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<ServerAck>> {
        let deadline = Instant::now() + timeout;
        let mut acks = self.acks.lock().unwrap();
        loop {
            let seen = acks.get(&client).map_or(0, Vec::len);
            if seen >= count {
                return acks.get(&client).cloned();
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            acks = self.changed.wait_timeout(acks, remaining).unwrap().0;
        }
    }

    pub fn disconnect(&self, client: ClientId) {
        self.disconnected.lock().unwrap().insert(client);
    }
}

impl ClientChannels for RecordingClientChannels {
    fn send(&self, client: ClientId, ack: ServerAck) -> Result<(), ChannelError> {
        if self.disconnected.lock().unwrap().contains(&client) {
            return Err(ChannelError::Disconnected(client));
        }
        self.acks.lock().unwrap().entry(client).or_default().push(ack);
        self.changed.notify_all();
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<HashMap<NodeId, Vec<ReplMessage>>>,
    failing: Mutex<HashSet<NodeId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self, peer: NodeId) -> Vec<ReplMessage> {
        self.sent
            .lock()
            .unwrap()
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn take(&self, peer: NodeId) -> Vec<ReplMessage> {
        self.sent
            .lock()
            .unwrap()
            .remove(&peer)
            .unwrap_or_default()
    }

    pub fn fail_peer(&self, peer: NodeId) {
        self.failing.lock().unwrap().insert(peer);
    }

    pub fn heal_peer(&self, peer: NodeId) {
        self.failing.lock().unwrap().remove(&peer);
    }
}

impl ReplicationTransport for RecordingTransport {
    fn send(&self, peer: NodeId, message: ReplMessage) -> Result<(), TransportError> {
        if self.failing.lock().unwrap().contains(&peer) {
            return Err(TransportError::Disconnected(peer));
        }
        self.sent.lock().unwrap().entry(peer).or_default().push(message);
        Ok(())
    }
}

/// Request builders.
pub mod requests {
    use bytes::Bytes;

    use crate::core::{
        ClientId, ConcurrencyKey, EntityDescriptor, EntityId, EntityVersion, NodeId,
        RequestOrigin, ServerEntityAction, ServerEntityRequest, TransactionId,
    };

    fn entity() -> EntityId {
        EntityId::new("Map", "test").expect("valid entity id")
    }

    fn invoke(n: u64, origin: RequestOrigin) -> ServerEntityRequest {
        ServerEntityRequest {
            descriptor: EntityDescriptor::internal(entity(), EntityVersion::FIRST),
            action: ServerEntityAction::Invoke,
            key: ConcurrencyKey::new(1),
            payload: Bytes::from(n.to_be_bytes().to_vec()),
            source: NodeId::new(uuid::Uuid::nil()),
            origin,
        }
    }

    pub fn client_invoke(client: ClientId, n: u64) -> ServerEntityRequest {
        invoke(
            n,
            RequestOrigin::Client {
                client,
                transaction: TransactionId::new(n),
                oldest_outstanding: TransactionId::new(1),
            },
        )
    }

    pub fn internal_invoke(n: u64) -> ServerEntityRequest {
        invoke(n, RequestOrigin::Internal)
    }
}
