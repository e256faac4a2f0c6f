//! Passive replication receiver.
//!
//! Applies the interleaved sync + live stream from the active in receive
//! order. Every envelope is answered with RECEIVED, then COMPLETED once it has
//! been applied, ignored, or found to be a duplicate. Live ops that target the
//! key currently being synced are buffered and replayed after that key's
//! `END_KEY`, in arrival order. A DESTROY of the entity being synced replays
//! the buffer, applies, and ends that entity's sync.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::Receiver;

use super::activity::{ActivityKind, SyncReplicationActivity};
use super::error::ReplError;
use super::proto::{AckBatch, CompletionResult, ReplEnvelope, ReplMessage, ReplicationAck};
use crate::core::{
    ConcurrencyKey, EntityDescriptor, EntityError, EntityId, EntityVersion, Limits, NodeId,
    ServerEntityAction,
};
use crate::daemon::collab::{EntityRegistry, ReplicationTransport, TransactionOrderStore};
use crate::daemon::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    NotStarted,
    Syncing,
    Done,
}

struct Buffered {
    sequence: u64,
    activity: SyncReplicationActivity,
}

/// The one entity whose `START_ENTITY` has been seen but not its `END_ENTITY`.
struct EntityWindow {
    entity: EntityId,
    version: EntityVersion,
    synced: HashSet<ConcurrencyKey>,
    current: Option<ConcurrencyKey>,
    buffer: VecDeque<Buffered>,
    buffered_bytes: usize,
}

impl EntityWindow {
    fn new(entity: EntityId, version: EntityVersion) -> Self {
        Self {
            entity,
            version,
            synced: HashSet::new(),
            current: None,
            buffer: VecDeque::new(),
            buffered_bytes: 0,
        }
    }
}

enum Routing {
    Apply,
    Buffer,
    Ignore,
    /// DESTROY of the entity being synced: replay the buffer, apply, close the window.
    EndWindow,
}

pub struct ReplicationReceiver {
    registry: Arc<dyn EntityRegistry>,
    store: Arc<dyn TransactionOrderStore>,
    limits: Limits,
    highest: HashMap<NodeId, u64>,
    phase: SyncPhase,
    /// Listed in `START_SYNC`, `START_ENTITY` not yet seen.
    unsynced: HashSet<EntityId>,
    window: Option<EntityWindow>,
    /// Incarnations destroyed mid-sync; their late sync frames are ignored.
    abandoned: HashSet<(EntityId, EntityVersion)>,
}

impl ReplicationReceiver {
    pub fn new(
        registry: Arc<dyn EntityRegistry>,
        store: Arc<dyn TransactionOrderStore>,
        limits: Limits,
    ) -> Self {
        Self {
            registry,
            store,
            limits,
            highest: HashMap::new(),
            phase: SyncPhase::NotStarted,
            unsynced: HashSet::new(),
            window: None,
            abandoned: HashSet::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Highest sequence accepted from `source`.
    pub fn highest_sequence(&self, source: NodeId) -> u64 {
        self.highest.get(&source).copied().unwrap_or(0)
    }

    pub fn buffered(&self) -> usize {
        self.window.as_ref().map_or(0, |window| window.buffer.len())
    }

    /// Handles one envelope and returns the acks it produced, in order.
    /// Errors are fatal to the replication session.
    pub fn handle_envelope(
        &mut self,
        envelope: ReplEnvelope,
    ) -> Result<Vec<ReplicationAck>, ReplError> {
        let ReplEnvelope {
            source,
            sequence,
            activity,
        } = envelope;
        let highest = self.highest_sequence(source);
        if sequence <= highest {
            tracing::debug!(source = %source, seq = sequence, highest, "duplicate envelope");
            metrics::repl_duplicate();
            return Ok(vec![
                ReplicationAck::received(sequence),
                ReplicationAck::completed(sequence, CompletionResult::None),
            ]);
        }
        if sequence != highest + 1 {
            return Err(ReplError::SequenceGap {
                source_node: source,
                expected: highest + 1,
                got: sequence,
            });
        }
        self.highest.insert(source, sequence);

        let mut acks = vec![ReplicationAck::received(sequence)];
        if activity.kind.is_sync() {
            let result = self.handle_sync(&activity, &mut acks)?;
            acks.insert(1, ReplicationAck::completed(sequence, result));
        } else {
            match self.route_live(&activity)? {
                Routing::Apply => {
                    let result = self.apply_live(&activity);
                    acks.push(ReplicationAck::completed(sequence, result));
                }
                Routing::Ignore => {
                    acks.push(ReplicationAck::completed(sequence, CompletionResult::None));
                }
                Routing::Buffer => self.buffer(sequence, activity)?,
                Routing::EndWindow => {
                    self.flush(&mut acks);
                    let result = self.apply_live(&activity);
                    acks.push(ReplicationAck::completed(sequence, result));
                    if let Some(window) = self.window.take() {
                        tracing::debug!(entity = %window.entity, version = %window.version, "entity destroyed during its sync");
                        self.abandoned.insert((window.entity, window.version));
                    }
                }
            }
        }
        Ok(acks)
    }

    fn route_live(&mut self, activity: &SyncReplicationActivity) -> Result<Routing, ReplError> {
        if activity.kind == ActivityKind::Noop {
            return Ok(Routing::Ignore);
        }
        let Some(entity) = activity.entity() else {
            return Err(ReplError::sync_protocol(format!(
                "{} without an entity",
                activity.kind
            )));
        };
        match self.phase {
            SyncPhase::NotStarted => return Ok(Routing::Ignore),
            SyncPhase::Done => return Ok(Routing::Apply),
            SyncPhase::Syncing => {}
        }

        if self.unsynced.contains(entity) {
            // Only DESTROY is forwarded for an entity whose sync has not begun;
            // anything else is already captured by its snapshot.
            if activity.kind == ActivityKind::Destroy {
                self.unsynced.remove(entity);
                self.abandoned.insert((entity.clone(), activity.version));
                return Ok(Routing::Apply);
            }
            return Ok(Routing::Ignore);
        }

        let Some(window) = self.window.as_ref().filter(|w| &w.entity == entity) else {
            return Ok(Routing::Apply);
        };
        let key = activity.key;
        let routing = match activity.kind {
            ActivityKind::Destroy => Routing::EndWindow,
            ActivityKind::Create => Routing::Buffer,
            _ if key.is_management() => {
                if window.buffer.is_empty() {
                    Routing::Apply
                } else {
                    Routing::Buffer
                }
            }
            _ if key.is_universal() || window.current == Some(key) => Routing::Buffer,
            _ if window.synced.contains(&key) => Routing::Apply,
            _ => Routing::Ignore,
        };
        Ok(routing)
    }

    fn buffer(&mut self, sequence: u64, activity: SyncReplicationActivity) -> Result<(), ReplError> {
        let Some(window) = self.window.as_mut() else {
            return Err(ReplError::sync_protocol("buffering outside an entity sync"));
        };
        let ops = window.buffer.len() + 1;
        let bytes = window.buffered_bytes + activity.payload.len();
        if ops > self.limits.max_sync_buffer_ops || bytes > self.limits.max_sync_buffer_bytes {
            return Err(ReplError::SyncBufferOverflow {
                entity: window.entity.clone(),
                key: activity.key,
                ops,
                bytes,
            });
        }
        window.buffered_bytes = bytes;
        window.buffer.push_back(Buffered { sequence, activity });
        metrics::set_sync_buffer_depth(ops);
        Ok(())
    }

    /// Applies every buffered op in arrival order, appending their COMPLETED acks.
    fn flush(&mut self, acks: &mut Vec<ReplicationAck>) {
        let Some(window) = self.window.as_mut() else {
            return;
        };
        let drained: Vec<Buffered> = window.buffer.drain(..).collect();
        window.buffered_bytes = 0;
        if drained.is_empty() {
            return;
        }
        tracing::debug!(entity = %window.entity, count = drained.len(), "replaying buffered ops");
        for buffered in drained {
            let result = self.apply_live(&buffered.activity);
            acks.push(ReplicationAck::completed(buffered.sequence, result));
        }
        metrics::set_sync_buffer_depth(0);
    }

    fn handle_sync(
        &mut self,
        activity: &SyncReplicationActivity,
        acks: &mut Vec<ReplicationAck>,
    ) -> Result<CompletionResult, ReplError> {
        match activity.kind {
            ActivityKind::StartSync => {
                if self.phase != SyncPhase::NotStarted {
                    return Err(ReplError::sync_protocol(format!(
                        "START_SYNC while {:?}",
                        self.phase
                    )));
                }
                self.phase = SyncPhase::Syncing;
                let mut result = CompletionResult::Success;
                for entry in &activity.sync_set {
                    if let Err(err) = self.ensure_shadow(&entry.entity, entry.version, &entry.config)
                    {
                        tracing::warn!(entity = %entry.entity, "failed to create shadow: {err}");
                        result = CompletionResult::Fail;
                    }
                    self.unsynced.insert(entry.entity.clone());
                }
                tracing::info!(entities = activity.sync_set.len(), "passive sync started");
                return Ok(result);
            }
            ActivityKind::EndSync => {
                if self.phase != SyncPhase::Syncing {
                    return Err(ReplError::sync_protocol(format!(
                        "END_SYNC while {:?}",
                        self.phase
                    )));
                }
                if let Some(window) = &self.window {
                    return Err(ReplError::sync_protocol(format!(
                        "END_SYNC while {} is still syncing",
                        window.entity
                    )));
                }
                if !self.unsynced.is_empty() {
                    tracing::debug!(
                        skipped = self.unsynced.len(),
                        "sync ended without frames for some listed entities"
                    );
                    self.unsynced.clear();
                }
                self.abandoned.clear();
                self.phase = SyncPhase::Done;
                tracing::info!("passive sync complete");
                return Ok(CompletionResult::Success);
            }
            _ => {}
        }

        if self.phase != SyncPhase::Syncing {
            return Err(ReplError::sync_protocol(format!(
                "{} outside of a sync window",
                activity.kind
            )));
        }
        let Some(entity) = activity.entity() else {
            return Err(ReplError::sync_protocol(format!(
                "{} without an entity",
                activity.kind
            )));
        };
        let key = activity.key;

        if self.abandoned.contains(&(entity.clone(), activity.version)) {
            tracing::debug!(entity = %entity, kind = %activity.kind, "sync frame for a destroyed incarnation");
            return Ok(CompletionResult::None);
        }

        if activity.kind == ActivityKind::StartEntity {
            if let Some(window) = &self.window {
                return Err(ReplError::sync_protocol(format!(
                    "START_ENTITY for {entity} while {} is syncing",
                    window.entity
                )));
            }
            self.unsynced.remove(entity);
            if let Err(err) = self.ensure_shadow(entity, activity.version, &activity.payload) {
                tracing::warn!(entity = %entity, "failed to create shadow: {err}");
            }
            self.window = Some(EntityWindow::new(entity.clone(), activity.version));
            return Ok(self.apply_sync_action(activity));
        }

        let Some(window) = self.window.as_mut() else {
            return Err(ReplError::sync_protocol(format!(
                "{} for {entity} without START_ENTITY",
                activity.kind
            )));
        };
        if &window.entity != entity || window.version != activity.version {
            return Err(ReplError::sync_protocol(format!(
                "{} for {entity} {} while {} {} is syncing",
                activity.kind, activity.version, window.entity, window.version
            )));
        }

        match activity.kind {
            ActivityKind::StartKey => {
                if let Some(open) = window.current {
                    return Err(ReplError::sync_protocol(format!(
                        "START_KEY {key} for {entity} while key {open} is open"
                    )));
                }
                window.current = Some(key);
                Ok(self.apply_sync_action(activity))
            }
            ActivityKind::Payload => {
                if window.current != Some(key) {
                    return Err(ReplError::sync_protocol(format!(
                        "PAYLOAD for {entity} key {key} outside its key window"
                    )));
                }
                Ok(self.apply_sync_action(activity))
            }
            ActivityKind::EndKey => {
                if window.current != Some(key) {
                    return Err(ReplError::sync_protocol(format!(
                        "END_KEY {key} for {entity} without START_KEY"
                    )));
                }
                window.current = None;
                window.synced.insert(key);
                let result = self.apply_sync_action(activity);
                self.flush(acks);
                Ok(result)
            }
            ActivityKind::EndEntity => {
                if let Some(open) = window.current {
                    return Err(ReplError::sync_protocol(format!(
                        "END_ENTITY for {entity} while key {open} is open"
                    )));
                }
                let result = self.apply_sync_action(activity);
                self.flush(acks);
                self.window = None;
                Ok(result)
            }
            kind => Err(ReplError::sync_protocol(format!(
                "{kind} is not an entity sync frame"
            ))),
        }
    }

    /// Makes sure the local copy of `entity` is the incarnation being synced.
    fn ensure_shadow(
        &self,
        entity: &EntityId,
        version: EntityVersion,
        config: &Bytes,
    ) -> Result<(), EntityError> {
        match self.registry.get_entity(entity) {
            Some(info) if info.version == version => return Ok(()),
            Some(info) => {
                tracing::debug!(entity = %entity, stale = %info.version, %version, "replacing stale shadow");
                self.registry.apply_action(
                    &EntityDescriptor::internal(entity.clone(), info.version),
                    ServerEntityAction::Destroy,
                    ConcurrencyKey::MANAGEMENT,
                    &Bytes::new(),
                )?;
            }
            None => {}
        }
        self.registry.create_entity(entity, Some(version), config)?;
        if let Err(err) = self.store.record_entity_created(entity, version, config) {
            tracing::warn!(entity = %entity, "failed to persist shadow: {err}");
        }
        Ok(())
    }

    fn apply_sync_action(&self, activity: &SyncReplicationActivity) -> CompletionResult {
        let (Some(entity), Some(action)) = (activity.entity(), activity.kind.server_action())
        else {
            return CompletionResult::None;
        };
        let descriptor = EntityDescriptor::internal(entity.clone(), activity.version);
        match self
            .registry
            .apply_action(&descriptor, action, activity.key, &activity.payload)
        {
            Ok(_) => CompletionResult::Success,
            Err(err) => {
                tracing::warn!(entity = %entity, key = %activity.key, %action, "sync apply failed: {err}");
                CompletionResult::Fail
            }
        }
    }

    fn apply_live(&self, activity: &SyncReplicationActivity) -> CompletionResult {
        let Some(entity) = activity.entity() else {
            return CompletionResult::None;
        };
        let descriptor = EntityDescriptor::internal(entity.clone(), activity.version);
        let result: Result<Bytes, EntityError> = match activity.kind {
            ActivityKind::Create => self
                .registry
                .create_entity(entity, Some(activity.version), &activity.payload)
                .map(|version| {
                    if let Err(err) =
                        self.store
                            .record_entity_created(entity, version, &activity.payload)
                    {
                        tracing::warn!(entity = %entity, "failed to persist create: {err}");
                    }
                    Bytes::new()
                }),
            kind => match kind.server_action() {
                Some(action) => self
                    .registry
                    .apply_action(&descriptor, action, activity.key, &activity.payload)
                    .map(|outcome| {
                        if kind == ActivityKind::Destroy
                            && let Err(err) = self.store.record_entity_destroyed(entity)
                        {
                            tracing::warn!(entity = %entity, "failed to persist destroy: {err}");
                        }
                        // Follow-ups are replicated by the active as their own INVOKEs.
                        outcome.result
                    }),
                None => return CompletionResult::None,
            },
        };

        if let Some(origin) = &activity.origin {
            let recorded = self
                .store
                .record_applied_order(origin.client, origin.transaction, origin.oldest_outstanding)
                .and_then(|()| {
                    self.store
                        .record_result(origin.client, origin.transaction, &result)
                });
            if let Err(err) = recorded {
                tracing::warn!(client = %origin.client, tx = %origin.transaction, "failed to journal replicated result: {err}");
            }
        }

        match result {
            Ok(_) => CompletionResult::Success,
            Err(err) => {
                tracing::debug!(entity = %entity, kind = %activity.kind, "replicated op failed: {err}");
                CompletionResult::Fail
            }
        }
    }
}

/// Collects acks per destination until a batch is full.
pub struct AckBatcher {
    max_batch: usize,
    pending: HashMap<NodeId, Vec<ReplicationAck>>,
}

impl AckBatcher {
    pub fn new(max_batch: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
            pending: HashMap::new(),
        }
    }

    /// Queues acks bound for `source`; returns any batches that filled up.
    pub fn push(&mut self, source: NodeId, acks: Vec<ReplicationAck>) -> Vec<AckBatch> {
        let mut full = Vec::new();
        let pending = self.pending.entry(source).or_default();
        for ack in acks {
            pending.push(ack);
            if pending.len() >= self.max_batch {
                full.push(AckBatch {
                    source,
                    acks: std::mem::take(pending),
                });
            }
        }
        full
    }

    pub fn flush(&mut self) -> Vec<AckBatch> {
        let mut batches: Vec<AckBatch> = self
            .pending
            .drain()
            .filter(|(_, acks)| !acks.is_empty())
            .map(|(source, acks)| AckBatch { source, acks })
            .collect();
        batches.sort_by_key(|batch| batch.source);
        batches
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(Vec::is_empty)
    }
}

/// Drives a receiver from an inbound envelope channel on its own thread.
pub struct ReceiverRuntime {
    local: NodeId,
    receiver: ReplicationReceiver,
    batcher: AckBatcher,
    transport: Arc<dyn ReplicationTransport>,
}

impl ReceiverRuntime {
    pub fn new(
        local: NodeId,
        receiver: ReplicationReceiver,
        transport: Arc<dyn ReplicationTransport>,
        limits: &Limits,
    ) -> Self {
        Self {
            local,
            receiver,
            batcher: AckBatcher::new(limits.max_ack_batch),
            transport,
        }
    }

    pub fn spawn(
        self,
        inbound: Receiver<ReplEnvelope>,
    ) -> std::io::Result<JoinHandle<Result<(), ReplError>>> {
        thread::Builder::new()
            .name("repl-receiver".into())
            .spawn(move || self.run(inbound))
    }

    /// Runs until the inbound channel closes or a fatal error occurs.
    pub fn run(mut self, inbound: Receiver<ReplEnvelope>) -> Result<(), ReplError> {
        while let Ok(envelope) = inbound.recv() {
            self.handle(envelope)?;
            for envelope in inbound.try_iter() {
                self.handle(envelope)?;
            }
            self.flush();
        }
        self.flush();
        tracing::debug!("replication receiver stopped");
        Ok(())
    }

    pub fn handle(&mut self, envelope: ReplEnvelope) -> Result<(), ReplError> {
        let source = envelope.source;
        let acks = match self.receiver.handle_envelope(envelope) {
            Ok(acks) => acks,
            Err(err) => {
                tracing::error!(source = %source, "replication session aborted: {err}");
                self.flush();
                return Err(err);
            }
        };
        for batch in self.batcher.push(source, acks) {
            self.send(batch);
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        for batch in self.batcher.flush() {
            self.send(batch);
        }
    }

    fn send(&self, batch: AckBatch) {
        let active = batch.source;
        let message = ReplMessage::Acks(AckBatch {
            source: self.local,
            acks: batch.acks,
        });
        if let Err(err) = self.transport.send(active, message) {
            tracing::warn!(active = %active, "failed to send acks: {err}");
        }
    }

    pub fn receiver(&self) -> &ReplicationReceiver {
        &self.receiver
    }
}
