//! Replication sender (active side).
//!
//! `PassiveFilter` is the per-passive state machine that decides whether an
//! activity is forwarded or suppressed while that passive is being synced.
//! `ReplicationSender` fans activities out over every filter and stamps the
//! forwarded ones with per-passive sequence numbers. `SenderRuntime` owns the
//! sender on its own thread, drives the transport and tracks passive acks.
//!
//! Filtering, per passive:
//! - before `START_SYNC` every live op is suppressed (the snapshot covers it)
//! - an entity listed in `START_SYNC` whose sync has not begun only receives
//!   DESTROY; after that its stale sync frames are suppressed
//! - an entity whose sync is running receives lifecycle ops and ops for keys
//!   that are synced or currently syncing; a DESTROY (or an op on another
//!   incarnation) ends its sync early and the rest of its frames are suppressed
//! - after `END_SYNC` everything is forwarded

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use super::activity::{ActivityKind, SyncEntity, SyncReplicationActivity};
use super::error::ReplError;
use super::peer_acks::{DeliveryCallback, DeliveryOutcome, PassiveAckTracker, PassiveProgress};
use super::proto::{AckBatch, ReplEnvelope, ReplMessage};
use crate::core::{ConcurrencyKey, EntityId, EntityVersion, Limits, NodeId};
use crate::daemon::collab::ReplicationTransport;
use crate::daemon::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    Forward,
    Suppress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    AwaitingSync,
    Syncing,
    Live,
}

#[derive(Debug)]
enum EntitySync {
    Unsynced {
        version: EntityVersion,
    },
    Syncing {
        version: EntityVersion,
        synced: HashSet<ConcurrencyKey>,
        current: Option<ConcurrencyKey>,
    },
}

#[derive(Debug)]
pub struct PassiveFilter {
    phase: StreamPhase,
    /// Entities of the sync set that have not finished syncing.
    entities: HashMap<EntityId, EntitySync>,
}

impl Default for PassiveFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PassiveFilter {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::AwaitingSync,
            entities: HashMap::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// Live ops and `NOOP`; never fails.
    pub fn filter_live(&mut self, activity: &SyncReplicationActivity) -> FilterVerdict {
        match self.phase {
            StreamPhase::AwaitingSync => return FilterVerdict::Suppress,
            StreamPhase::Live => return FilterVerdict::Forward,
            StreamPhase::Syncing => {}
        }
        let Some(entity) = activity.entity() else {
            // NOOP placeholders only travel on a live stream.
            return FilterVerdict::Suppress;
        };
        match self.entities.get(entity) {
            None => FilterVerdict::Forward,
            Some(EntitySync::Unsynced { .. }) => {
                if activity.kind == ActivityKind::Destroy {
                    self.entities.remove(entity);
                    FilterVerdict::Forward
                } else {
                    FilterVerdict::Suppress
                }
            }
            Some(EntitySync::Syncing { version, .. })
                if activity.kind == ActivityKind::Destroy || activity.version != *version =>
            {
                // The synced incarnation is gone; its remaining sync frames are stale
                // and everything that follows is live.
                self.entities.remove(entity);
                FilterVerdict::Forward
            }
            Some(EntitySync::Syncing {
                synced, current, ..
            }) => {
                let key = activity.key;
                let forwarded = key.is_management()
                    || synced.contains(&key)
                    || *current == Some(key)
                    || (key.is_universal() && (!synced.is_empty() || current.is_some()));
                if forwarded {
                    FilterVerdict::Forward
                } else {
                    FilterVerdict::Suppress
                }
            }
        }
    }

    /// Sync control and payload frames addressed to this passive.
    pub fn filter_sync(
        &mut self,
        activity: &SyncReplicationActivity,
    ) -> Result<FilterVerdict, ReplError> {
        match activity.kind {
            ActivityKind::StartSync => {
                if self.phase != StreamPhase::AwaitingSync {
                    return Err(ReplError::sync_protocol(format!(
                        "START_SYNC while {:?}",
                        self.phase
                    )));
                }
                self.phase = StreamPhase::Syncing;
                self.entities = activity
                    .sync_set
                    .iter()
                    .map(|entry| {
                        (
                            entry.entity.clone(),
                            EntitySync::Unsynced {
                                version: entry.version,
                            },
                        )
                    })
                    .collect();
                return Ok(FilterVerdict::Forward);
            }
            ActivityKind::EndSync => {
                if self.phase != StreamPhase::Syncing {
                    return Err(ReplError::sync_protocol(format!(
                        "END_SYNC while {:?}",
                        self.phase
                    )));
                }
                if let Some((entity, _)) = self
                    .entities
                    .iter()
                    .find(|(_, state)| matches!(state, EntitySync::Syncing { .. }))
                {
                    return Err(ReplError::sync_protocol(format!(
                        "END_SYNC while {entity} is still syncing"
                    )));
                }
                self.phase = StreamPhase::Live;
                self.entities.clear();
                return Ok(FilterVerdict::Forward);
            }
            ActivityKind::StartEntity
            | ActivityKind::EndEntity
            | ActivityKind::StartKey
            | ActivityKind::EndKey
            | ActivityKind::Payload => {}
            other => {
                return Err(ReplError::sync_protocol(format!(
                    "{other} is not a sync frame"
                )));
            }
        }

        if self.phase != StreamPhase::Syncing {
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
        let Some(state) = self.entities.get_mut(entity) else {
            // Destroyed (and maybe recreated) since the snapshot.
            return Ok(FilterVerdict::Suppress);
        };

        let version = match state {
            EntitySync::Unsynced { version } | EntitySync::Syncing { version, .. } => *version,
        };
        if version != activity.version {
            // Frame from an incarnation that no longer exists.
            return Ok(FilterVerdict::Suppress);
        }

        if activity.kind == ActivityKind::StartEntity {
            if matches!(state, EntitySync::Syncing { .. }) {
                return Err(ReplError::sync_protocol(format!(
                    "START_ENTITY for {entity} while already syncing it"
                )));
            }
            *state = EntitySync::Syncing {
                version,
                synced: HashSet::new(),
                current: None,
            };
            return Ok(FilterVerdict::Forward);
        }

        let EntitySync::Syncing {
            synced, current, ..
        } = state
        else {
            return Ok(FilterVerdict::Suppress);
        };
        match activity.kind {
            ActivityKind::StartKey => {
                if let Some(open) = *current {
                    return Err(ReplError::sync_protocol(format!(
                        "START_KEY {key} for {entity} while key {open} is open"
                    )));
                }
                *current = Some(key);
            }
            ActivityKind::Payload => {
                if *current != Some(key) {
                    return Err(ReplError::sync_protocol(format!(
                        "PAYLOAD for {entity} key {key} outside its key window"
                    )));
                }
            }
            ActivityKind::EndKey => {
                if *current != Some(key) {
                    return Err(ReplError::sync_protocol(format!(
                        "END_KEY {key} for {entity} without START_KEY"
                    )));
                }
                *current = None;
                synced.insert(key);
            }
            ActivityKind::EndEntity => {
                if let Some(open) = *current {
                    return Err(ReplError::sync_protocol(format!(
                        "END_ENTITY for {entity} while key {open} is open"
                    )));
                }
                self.entities.remove(entity);
            }
            kind => {
                return Err(ReplError::sync_protocol(format!(
                    "{kind} is not an entity sync frame"
                )));
            }
        }
        Ok(FilterVerdict::Forward)
    }
}

/// Result of routing one activity to one passive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub passive: NodeId,
    /// `None` when the filter suppressed the activity.
    pub envelope: Option<ReplEnvelope>,
}

#[derive(Debug)]
struct PassiveStream {
    filter: PassiveFilter,
    next_sequence: u64,
}

impl PassiveStream {
    fn stamp(&mut self, source: NodeId, activity: SyncReplicationActivity) -> ReplEnvelope {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        ReplEnvelope {
            source,
            sequence,
            activity,
        }
    }
}

#[derive(Debug)]
pub struct ReplicationSender {
    local: NodeId,
    passives: BTreeMap<NodeId, PassiveStream>,
}

impl ReplicationSender {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            passives: BTreeMap::new(),
        }
    }

    pub fn add_passive(&mut self, passive: NodeId) {
        self.passives.entry(passive).or_insert_with(|| PassiveStream {
            filter: PassiveFilter::new(),
            next_sequence: 1,
        });
    }

    pub fn remove_passive(&mut self, passive: NodeId) -> bool {
        self.passives.remove(&passive).is_some()
    }

    pub fn passives(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.passives.keys().copied()
    }

    pub fn phase(&self, passive: NodeId) -> Option<StreamPhase> {
        self.passives.get(&passive).map(|stream| stream.filter.phase())
    }

    /// Routes a live op (or `NOOP`) to every passive.
    pub fn fan_out(&mut self, activity: &SyncReplicationActivity) -> Vec<Outbound> {
        debug_assert!(!activity.kind.is_sync(), "sync frames are addressed");
        let local = self.local;
        self.passives
            .iter_mut()
            .map(|(passive, stream)| {
                let envelope = match stream.filter.filter_live(activity) {
                    FilterVerdict::Forward => Some(stream.stamp(local, activity.clone())),
                    FilterVerdict::Suppress => None,
                };
                Outbound {
                    passive: *passive,
                    envelope,
                }
            })
            .collect()
    }

    /// Routes a sync frame to the passive being synced.
    pub fn send_to(
        &mut self,
        passive: NodeId,
        activity: SyncReplicationActivity,
    ) -> Result<Outbound, ReplError> {
        let local = self.local;
        let stream = self
            .passives
            .get_mut(&passive)
            .ok_or(ReplError::UnknownPassive(passive))?;
        let envelope = match stream.filter.filter_sync(&activity)? {
            FilterVerdict::Forward => Some(stream.stamp(local, activity)),
            FilterVerdict::Suppress => None,
        };
        Ok(Outbound { passive, envelope })
    }
}

pub type SnapshotFn = Box<dyn FnOnce() -> Vec<SyncEntity> + Send>;

pub enum SenderCommand {
    Replicate {
        activity: SyncReplicationActivity,
        callback: Option<DeliveryCallback>,
    },
    SendTo {
        passive: NodeId,
        activity: SyncReplicationActivity,
        callback: Option<DeliveryCallback>,
    },
    /// Starts a passive sync. The snapshot is taken on the sender thread so it
    /// covers exactly the live ops queued before `START_SYNC`.
    StartSync {
        passive: NodeId,
        snapshot: SnapshotFn,
        reply: Sender<Result<Vec<SyncEntity>, ReplError>>,
    },
    AddPassive(NodeId),
    RemovePassive(NodeId),
    /// A fresh stream to the passive is up; replay what it has not received.
    Reconnected(NodeId),
    Acks(AckBatch),
    Progress {
        passive: NodeId,
        reply: Sender<Option<PassiveProgress>>,
    },
    Shutdown,
}

/// Cloneable entry point into the sender thread.
///
/// Sends block when the channel is full; that is the backpressure lanes see.
#[derive(Clone)]
pub struct SenderHandle {
    tx: Sender<SenderCommand>,
}

impl SenderHandle {
    pub fn new(tx: Sender<SenderCommand>) -> Self {
        Self { tx }
    }

    fn submit(&self, command: SenderCommand) -> Result<(), ReplError> {
        self.tx.send(command).map_err(|_| ReplError::Closed)
    }

    pub fn replicate(
        &self,
        activity: SyncReplicationActivity,
        callback: Option<DeliveryCallback>,
    ) -> Result<(), ReplError> {
        self.submit(SenderCommand::Replicate { activity, callback })
    }

    pub fn send_to(
        &self,
        passive: NodeId,
        activity: SyncReplicationActivity,
        callback: Option<DeliveryCallback>,
    ) -> Result<(), ReplError> {
        self.submit(SenderCommand::SendTo {
            passive,
            activity,
            callback,
        })
    }

    /// Sends `START_SYNC` to `passive`; returns the entities it announced.
    pub fn start_sync(
        &self,
        passive: NodeId,
        snapshot: SnapshotFn,
    ) -> Result<Vec<SyncEntity>, ReplError> {
        let (reply, rx) = crossbeam::channel::bounded(1);
        self.submit(SenderCommand::StartSync {
            passive,
            snapshot,
            reply,
        })?;
        rx.recv().map_err(|_| ReplError::Closed)?
    }

    pub fn add_passive(&self, passive: NodeId) -> Result<(), ReplError> {
        self.submit(SenderCommand::AddPassive(passive))
    }

    pub fn remove_passive(&self, passive: NodeId) -> Result<(), ReplError> {
        self.submit(SenderCommand::RemovePassive(passive))
    }

    /// Call after `StreamTransport::connect` replaced the passive's stream.
    pub fn peer_reconnected(&self, passive: NodeId) -> Result<(), ReplError> {
        self.submit(SenderCommand::Reconnected(passive))
    }

    pub fn deliver_acks(&self, batch: AckBatch) -> Result<(), ReplError> {
        self.submit(SenderCommand::Acks(batch))
    }

    pub fn progress(&self, passive: NodeId) -> Result<Option<PassiveProgress>, ReplError> {
        let (reply, rx) = crossbeam::channel::bounded(1);
        self.submit(SenderCommand::Progress { passive, reply })?;
        rx.recv().map_err(|_| ReplError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SenderCommand::Shutdown);
    }
}

pub struct SenderRuntime {
    sender: ReplicationSender,
    tracker: PassiveAckTracker,
    transport: Arc<dyn ReplicationTransport>,
}

impl SenderRuntime {
    pub fn new(local: NodeId, transport: Arc<dyn ReplicationTransport>, limits: &Limits) -> Self {
        Self {
            sender: ReplicationSender::new(local),
            tracker: PassiveAckTracker::new(Duration::from_millis(limits.passive_ack_timeout_ms)),
            transport,
        }
    }

    /// Spawns the sender thread. The handle's channel is bounded by
    /// `repl_channel_capacity`.
    pub fn spawn(self, limits: &Limits) -> std::io::Result<(SenderHandle, JoinHandle<()>)> {
        let (tx, rx) = crossbeam::channel::bounded(limits.repl_channel_capacity.max(1));
        let tick = Duration::from_millis((limits.passive_ack_timeout_ms / 4).clamp(10, 1_000));
        let join = thread::Builder::new()
            .name("repl-sender".into())
            .spawn(move || self.run(rx, tick))?;
        Ok((SenderHandle::new(tx), join))
    }

    fn run(mut self, rx: Receiver<SenderCommand>, tick: Duration) {
        loop {
            match rx.recv_timeout(tick) {
                Ok(SenderCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle(command, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now = Instant::now();
            self.check_timeouts(now);
            for passive in self.tracker.resend_pending() {
                self.retransmit(passive, now);
            }
        }
        tracing::debug!("replication sender stopped");
    }

    pub fn handle(&mut self, command: SenderCommand, now: Instant) {
        match command {
            SenderCommand::Replicate { activity, callback } => {
                let outbound = self.sender.fan_out(&activity);
                for out in outbound {
                    self.dispatch(out, callback.clone(), now);
                }
            }
            SenderCommand::SendTo {
                passive,
                activity,
                callback,
            } => match self.sender.send_to(passive, activity) {
                Ok(out) => self.dispatch(out, callback, now),
                Err(err) => {
                    tracing::error!(passive = %passive, "sync frame rejected: {err}");
                    if let Some(callback) = callback {
                        callback(passive, DeliveryOutcome::Failed);
                    }
                    if err.is_fatal() {
                        self.drop_passive(passive);
                    }
                }
            },
            SenderCommand::StartSync {
                passive,
                snapshot,
                reply,
            } => {
                let sync_set = snapshot();
                let activity = SyncReplicationActivity::start_sync(sync_set.clone());
                let result = match self.sender.send_to(passive, activity) {
                    Ok(out) => {
                        tracing::info!(passive = %passive, entities = sync_set.len(), "passive sync started");
                        self.dispatch(out, None, now);
                        Ok(sync_set)
                    }
                    Err(err) => {
                        tracing::error!(passive = %passive, "cannot start sync: {err}");
                        Err(err)
                    }
                };
                let _ = reply.send(result);
            }
            SenderCommand::AddPassive(passive) => {
                tracing::info!(passive = %passive, "passive added");
                self.sender.add_passive(passive);
                self.tracker.add_passive(passive);
            }
            SenderCommand::RemovePassive(passive) => self.drop_passive(passive),
            SenderCommand::Reconnected(passive) => {
                tracing::info!(passive = %passive, "passive stream reconnected");
                self.tracker.rewind(passive);
                self.retransmit(passive, now);
            }
            SenderCommand::Acks(batch) => {
                for ack in batch.acks {
                    if let Err(err) = self.tracker.record_ack(batch.source, ack) {
                        tracing::warn!(passive = %batch.source, "ack rejected: {err}");
                    }
                }
            }
            SenderCommand::Progress { passive, reply } => {
                let _ = reply.send(self.tracker.progress(passive));
            }
            SenderCommand::Shutdown => {}
        }
    }

    fn dispatch(&mut self, out: Outbound, callback: Option<DeliveryCallback>, now: Instant) {
        let passive = out.passive;
        let Some(envelope) = out.envelope else {
            metrics::repl_filtered();
            if let Some(callback) = callback {
                callback(passive, DeliveryOutcome::Filtered);
            }
            return;
        };
        let sequence = envelope.sequence;
        let kind = envelope.activity.kind;
        if let Err(err) = self
            .tracker
            .record_sent(passive, envelope.clone(), now, callback)
        {
            tracing::warn!(passive = %passive, seq = sequence, "untracked send: {err}");
        }
        if self.tracker.needs_resend(passive) {
            // Queued behind the backlog so the passive sees no gap.
            self.retransmit(passive, now);
            return;
        }
        match self.transport.send(passive, ReplMessage::Activity(envelope)) {
            Ok(()) => {
                metrics::repl_sent(kind.as_str());
                tracing::trace!(passive = %passive, seq = sequence, %kind, "replicated");
            }
            Err(err) => {
                tracing::warn!(passive = %passive, seq = sequence, "replication send failed: {err}");
                metrics::repl_send_failed();
                self.tracker.record_failed(passive, sequence);
                if self.tracker.mark_degraded(passive) {
                    metrics::passive_degraded();
                }
            }
        }
    }

    /// Replays the passive's backlog in order, stopping at the first failure.
    fn retransmit(&mut self, passive: NodeId, now: Instant) {
        let backlog = self.tracker.resend_backlog(passive);
        let mut stalled_at = None;
        let mut resent = 0;
        for envelope in backlog {
            let sequence = envelope.sequence;
            if let Err(err) = self.transport.send(passive, ReplMessage::Activity(envelope)) {
                tracing::debug!(passive = %passive, seq = sequence, "retransmission stalled: {err}");
                stalled_at = Some(sequence);
                break;
            }
            resent += 1;
        }
        self.tracker.record_resent(passive, stalled_at, now);
        if resent > 0 {
            metrics::repl_resent(resent);
            tracing::debug!(passive = %passive, resent, caught_up = stalled_at.is_none(), "retransmitted backlog");
        }
    }

    fn drop_passive(&mut self, passive: NodeId) {
        if self.sender.remove_passive(passive) {
            tracing::info!(passive = %passive, "passive removed");
        }
        self.tracker.remove_passive(passive);
    }

    pub fn check_timeouts(&mut self, now: Instant) {
        for passive in self.tracker.check_timeouts(now) {
            tracing::warn!(passive = %passive, "passive missed its completion deadline; degraded");
            metrics::passive_degraded();
        }
    }

    pub fn sender(&self) -> &ReplicationSender {
        &self.sender
    }

    pub fn tracker(&self) -> &PassiveAckTracker {
        &self.tracker
    }
}
