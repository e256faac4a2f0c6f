//! Passive sync stream generation on the active.
//!
//! Entities are synced one at a time, in creation order. For each entity the
//! driver queues on that entity's own lanes:
//! - a management-key job emitting `START_ENTITY`
//! - one job per concurrency key emitting `START_KEY`, the key's payloads and
//!   `END_KEY`
//! - a management-key job emitting `END_ENTITY`
//!
//! Running the frames as lane jobs orders them with the live ops of the same
//! key, which is what the per-passive filter relies on.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::channel::Sender;

use super::collab::EntityRegistry;
use super::lanes::{JobClass, LaneJob, LaneScheduler};
use super::repl::activity::{SyncEntity, SyncReplicationActivity};
use super::repl::error::ReplError;
use super::repl::sender::SenderHandle;
use crate::core::{ConcurrencyKey, EntityId, EntityVersion, NodeId};
use crate::error::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub entities: usize,
    pub keys: usize,
    pub payloads: usize,
}

/// Reported by sync jobs; `Ok` only from the entity's final job.
type Step = Result<(), ReplError>;

pub struct SyncDriver {
    registry: Arc<dyn EntityRegistry>,
    lanes: LaneScheduler,
    sender: SenderHandle,
}

impl SyncDriver {
    pub fn new(
        registry: Arc<dyn EntityRegistry>,
        lanes: LaneScheduler,
        sender: SenderHandle,
    ) -> Self {
        Self {
            registry,
            lanes,
            sender,
        }
    }

    /// Adds `passive` and streams a full sync to it. Blocks until `END_SYNC`
    /// has been queued for sending.
    pub fn run(&self, passive: NodeId) -> Result<SyncSummary, Error> {
        self.sender.add_passive(passive)?;
        let registry = Arc::clone(&self.registry);
        let sync_set = self.sender.start_sync(
            passive,
            Box::new(move || {
                registry
                    .entities()
                    .into_iter()
                    .map(|(entity, info)| SyncEntity {
                        entity,
                        version: info.version,
                        config: info.config,
                    })
                    .collect()
            }),
        )?;

        let mut summary = SyncSummary::default();
        for entry in &sync_set {
            let (keys, payloads) = self.sync_entity(passive, entry)?;
            summary.entities += 1;
            summary.keys += keys;
            summary.payloads += payloads;
        }
        self.sender
            .send_to(passive, SyncReplicationActivity::end_sync(), None)?;
        tracing::info!(
            passive = %passive,
            entities = summary.entities,
            keys = summary.keys,
            payloads = summary.payloads,
            "passive sync queued"
        );
        Ok(summary)
    }

    /// Queues one entity's frames and waits for its `END_ENTITY` job to run.
    fn sync_entity(&self, passive: NodeId, entry: &SyncEntity) -> Result<(usize, usize), Error> {
        let entity = entry.entity.clone();
        let version = entry.version;
        let keys: Vec<ConcurrencyKey> = self
            .registry
            .concurrency_keys(&entity)
            .into_iter()
            .filter(|key| !key.is_management())
            .collect();
        let payloads = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = crossbeam::channel::unbounded::<Step>();

        let registry = Arc::clone(&self.registry);
        let snapshot_config = entry.config.clone();
        let start = entity.clone();
        self.queue(&entity, ConcurrencyKey::MANAGEMENT, &done_tx, false, move |sender| {
            let config = match registry.get_entity(&start) {
                Some(info) if info.version == version => info.config,
                _ => snapshot_config,
            };
            sender.send_to(
                passive,
                SyncReplicationActivity::start_entity(start, version, config),
                None,
            )
        })?;

        for &key in &keys {
            let registry = Arc::clone(&self.registry);
            let counter = Arc::clone(&payloads);
            let target = entity.clone();
            self.queue(&entity, key, &done_tx, false, move |sender| {
                sync_key(registry.as_ref(), sender, passive, &target, version, key, &counter)
            })?;
        }

        let end = entity.clone();
        self.queue(&entity, ConcurrencyKey::MANAGEMENT, &done_tx, true, move |sender| {
            sender.send_to(
                passive,
                SyncReplicationActivity::end_entity(end, version),
                None,
            )
        })?;
        drop(done_tx);

        loop {
            match done_rx.recv() {
                Ok(Ok(())) => break,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(ReplError::Closed.into()),
            }
        }
        tracing::debug!(passive = %passive, entity = %entity, keys = keys.len(), "entity synced");
        Ok((keys.len(), payloads.load(Ordering::Relaxed)))
    }

    fn queue<F>(
        &self,
        entity: &EntityId,
        key: ConcurrencyKey,
        done: &Sender<Step>,
        last: bool,
        emit: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&SenderHandle) -> Result<(), ReplError> + Send + 'static,
    {
        let sender = self.sender.clone();
        let on_run = done.clone();
        let on_cancel = done.clone();
        let job = LaneJob::new(
            entity.clone(),
            key,
            JobClass::Sync,
            move || match emit(&sender) {
                Ok(()) if last => {
                    let _ = on_run.send(Ok(()));
                }
                Ok(()) => {}
                Err(err) => {
                    let _ = on_run.send(Err(err));
                }
            },
            move |err| {
                tracing::debug!("sync job cancelled: {err}");
                let _ = on_cancel.send(Err(ReplError::Closed));
            },
        );
        self.lanes.submit(job)?;
        Ok(())
    }
}

/// Emits one key's frames. A key of an incarnation that no longer exists
/// carries no payloads; the filter drops its frames anyway.
fn sync_key(
    registry: &dyn EntityRegistry,
    sender: &SenderHandle,
    passive: NodeId,
    entity: &EntityId,
    version: EntityVersion,
    key: ConcurrencyKey,
    counter: &AtomicUsize,
) -> Result<(), ReplError> {
    sender.send_to(
        passive,
        SyncReplicationActivity::start_key(entity.clone(), version, key),
        None,
    )?;
    let current = registry
        .get_entity(entity)
        .is_some_and(|info| info.version == version);
    let payloads = if current {
        registry.sync_payloads(entity, key).unwrap_or_else(|err| {
            tracing::warn!(entity = %entity, key = %key, "cannot read sync payloads: {err}");
            Vec::new()
        })
    } else {
        Vec::new()
    };
    counter.fetch_add(payloads.len(), Ordering::Relaxed);
    for payload in payloads {
        sender.send_to(
            passive,
            SyncReplicationActivity::sync_payload(entity.clone(), version, key, payload),
            None,
        )?;
    }
    sender.send_to(
        passive,
        SyncReplicationActivity::end_key(entity.clone(), version, key),
        None,
    )
}
