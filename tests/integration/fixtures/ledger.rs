#![allow(dead_code)]

//! A ledger entity: every concurrency key holds the list of payloads invoked
//! on it. Invoke payloads are `k=<key>;<data>`; anything else lands on key 1.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use entity_replication::core::{
    ClientId, ConcurrencyKey, EntityDescriptor, EntityError, EntityId, EntityVersion, NodeId,
    ServerEntityAction, TransactionId,
};
use entity_replication::daemon::{
    ApplyOutcome, EntityInfo, EntityRegistry, PersistedEntity, StoreError, TransactionOrderStore,
};

pub type Snapshot = BTreeMap<EntityId, (EntityVersion, BTreeMap<ConcurrencyKey, Vec<Bytes>>)>;

struct Ledger {
    version: EntityVersion,
    config: Bytes,
    created: u64,
    keys: BTreeMap<ConcurrencyKey, Vec<Bytes>>,
}

#[derive(Default)]
struct LedgerState {
    ledgers: HashMap<EntityId, Ledger>,
    versions: HashMap<EntityId, EntityVersion>,
    created: u64,
    invokes: usize,
}

#[derive(Default)]
pub struct LedgerRegistry {
    state: Mutex<LedgerState>,
    gated: Mutex<HashSet<ConcurrencyKey>>,
    opened: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn key_of(payload: &[u8]) -> ConcurrencyKey {
    payload
        .strip_prefix(b"k=")
        .and_then(|rest| {
            let end = rest.iter().position(|b| *b == b';').unwrap_or(rest.len());
            std::str::from_utf8(&rest[..end]).ok()?.parse::<i32>().ok()
        })
        .map_or(ConcurrencyKey::new(1), ConcurrencyKey::new)
}

impl LedgerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        lock(&self.state)
            .ledgers
            .iter()
            .map(|(id, ledger)| (id.clone(), (ledger.version, ledger.keys.clone())))
            .collect()
    }

    pub fn key_log(&self, entity: &EntityId, key: ConcurrencyKey) -> Vec<Bytes> {
        lock(&self.state)
            .ledgers
            .get(entity)
            .and_then(|ledger| ledger.keys.get(&key).cloned())
            .unwrap_or_default()
    }

    /// Invokes on `key` block until [`open`](Self::open) is called.
    pub fn gate(&self, key: ConcurrencyKey) {
        lock(&self.gated).insert(key);
    }

    pub fn open(&self, key: ConcurrencyKey) {
        lock(&self.gated).remove(&key);
        self.opened.notify_all();
    }

    fn wait_open(&self, key: ConcurrencyKey) {
        let mut gated = lock(&self.gated);
        while gated.contains(&key) {
            gated = self
                .opened
                .wait(gated)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Invokes applied so far, sync payloads excluded.
    pub fn invokes(&self) -> usize {
        lock(&self.state).invokes
    }
}

impl EntityRegistry for LedgerRegistry {
    fn create_entity(
        &self,
        entity: &EntityId,
        version: Option<EntityVersion>,
        config: &Bytes,
    ) -> Result<EntityVersion, EntityError> {
        let mut state = lock(&self.state);
        if let Some(existing) = state.ledgers.get(entity) {
            return Err(EntityError::AlreadyExists {
                entity: entity.clone(),
                version: existing.version,
            });
        }
        let last = state.versions.get(entity).copied().unwrap_or_default();
        let version = version.unwrap_or_else(|| last.next());
        state.versions.insert(entity.clone(), version.max(last));
        state.created += 1;
        let created = state.created;
        state.ledgers.insert(
            entity.clone(),
            Ledger {
                version,
                config: config.clone(),
                created,
                keys: BTreeMap::new(),
            },
        );
        Ok(version)
    }

    fn get_entity(&self, entity: &EntityId) -> Option<EntityInfo> {
        lock(&self.state).ledgers.get(entity).map(|ledger| EntityInfo {
            version: ledger.version,
            config: ledger.config.clone(),
        })
    }

    fn apply_action(
        &self,
        descriptor: &EntityDescriptor,
        action: ServerEntityAction,
        key: ConcurrencyKey,
        payload: &Bytes,
    ) -> Result<ApplyOutcome, EntityError> {
        if action == ServerEntityAction::Invoke {
            self.wait_open(key);
        }
        let entity = &descriptor.entity;
        let mut state = lock(&self.state);
        let state = &mut *state;
        let ledger = state
            .ledgers
            .get_mut(entity)
            .filter(|ledger| ledger.version == descriptor.version)
            .ok_or_else(|| EntityError::NotFound {
                entity: entity.clone(),
            })?;
        match action {
            ServerEntityAction::Invoke => {
                let log = ledger.keys.entry(key).or_default();
                log.push(payload.clone());
                state.invokes += 1;
                Ok(ApplyOutcome::new(Bytes::from(log.len().to_string())))
            }
            ServerEntityAction::Reconfigure => {
                ledger.config = payload.clone();
                Ok(ApplyOutcome::default())
            }
            ServerEntityAction::Destroy => {
                state.ledgers.remove(entity);
                Ok(ApplyOutcome::default())
            }
            ServerEntityAction::ReceiveSyncEntityKeyStart => {
                ledger.keys.remove(&key);
                Ok(ApplyOutcome::default())
            }
            ServerEntityAction::ReceiveSyncPayload => {
                ledger.keys.entry(key).or_default().push(payload.clone());
                Ok(ApplyOutcome::default())
            }
            ServerEntityAction::ReceiveSyncEntityStart
            | ServerEntityAction::ReceiveSyncEntityKeyEnd
            | ServerEntityAction::ReceiveSyncEntityEnd => Ok(ApplyOutcome::default()),
            ServerEntityAction::Create => Err(EntityError::Refused {
                reason: "ledgers are created through the registry".to_string(),
            }),
        }
    }

    fn partition_key_for(
        &self,
        _entity: &EntityId,
        payload: &Bytes,
    ) -> Result<ConcurrencyKey, EntityError> {
        Ok(key_of(payload))
    }

    fn entities(&self) -> Vec<(EntityId, EntityInfo)> {
        let state = lock(&self.state);
        let mut ledgers: Vec<_> = state.ledgers.iter().collect();
        ledgers.sort_by_key(|(_, ledger)| ledger.created);
        ledgers
            .into_iter()
            .map(|(id, ledger)| {
                (
                    id.clone(),
                    EntityInfo {
                        version: ledger.version,
                        config: ledger.config.clone(),
                    },
                )
            })
            .collect()
    }

    fn concurrency_keys(&self, entity: &EntityId) -> Vec<ConcurrencyKey> {
        lock(&self.state)
            .ledgers
            .get(entity)
            .map(|ledger| ledger.keys.keys().copied().collect())
            .unwrap_or_default()
    }

    fn sync_payloads(
        &self,
        entity: &EntityId,
        key: ConcurrencyKey,
    ) -> Result<Vec<Bytes>, EntityError> {
        Ok(self.key_log(entity, key))
    }
}

/// Order store that keeps everything in memory.
#[derive(Default)]
pub struct VecOrderStore {
    results: Mutex<HashMap<(ClientId, TransactionId), Result<Bytes, EntityError>>>,
    watermarks: Mutex<HashMap<ClientId, TransactionId>>,
    replicated: Mutex<HashMap<(ClientId, NodeId), TransactionId>>,
    entities: Mutex<Vec<PersistedEntity>>,
}

impl VecOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replicated_through(&self, client: ClientId, passive: NodeId) -> Option<TransactionId> {
        lock(&self.replicated).get(&(client, passive)).copied()
    }
}

impl TransactionOrderStore for VecOrderStore {
    fn record_applied_order(
        &self,
        client: ClientId,
        _transaction: TransactionId,
        oldest_outstanding: TransactionId,
    ) -> Result<(), StoreError> {
        lock(&self.watermarks).insert(client, oldest_outstanding);
        Ok(())
    }

    fn record_result(
        &self,
        client: ClientId,
        transaction: TransactionId,
        result: &Result<Bytes, EntityError>,
    ) -> Result<(), StoreError> {
        lock(&self.results).insert((client, transaction), result.clone());
        Ok(())
    }

    fn journaled_result(
        &self,
        client: ClientId,
        transaction: TransactionId,
    ) -> Result<Option<Result<Bytes, EntityError>>, StoreError> {
        Ok(lock(&self.results).get(&(client, transaction)).cloned())
    }

    fn record_replicated(
        &self,
        client: ClientId,
        transaction: TransactionId,
        passive: NodeId,
    ) -> Result<(), StoreError> {
        let mut replicated = lock(&self.replicated);
        let through = replicated.entry((client, passive)).or_insert(transaction);
        *through = (*through).max(transaction);
        Ok(())
    }

    fn oldest_outstanding(&self, client: ClientId) -> Result<Option<TransactionId>, StoreError> {
        Ok(lock(&self.watermarks).get(&client).copied())
    }

    fn record_entity_created(
        &self,
        entity: &EntityId,
        version: EntityVersion,
        config: &Bytes,
    ) -> Result<(), StoreError> {
        let mut entities = lock(&self.entities);
        let creation_order = entities.len() as u64;
        entities.push(PersistedEntity {
            entity: entity.clone(),
            version,
            config: config.clone(),
            creation_order,
        });
        Ok(())
    }

    fn record_entity_destroyed(&self, entity: &EntityId) -> Result<(), StoreError> {
        lock(&self.entities).retain(|persisted| &persisted.entity != entity);
        Ok(())
    }

    fn load_existing_entities(&self) -> Result<Vec<PersistedEntity>, StoreError> {
        Ok(lock(&self.entities).clone())
    }

    fn forget_client(&self, client: ClientId) -> Result<(), StoreError> {
        lock(&self.results).retain(|(owner, _), _| *owner != client);
        lock(&self.watermarks).remove(&client);
        lock(&self.replicated).retain(|(owner, _), _| *owner != client);
        Ok(())
    }
}
