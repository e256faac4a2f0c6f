//! Collaborators the pipeline consumes but does not implement.
//!
//! The entity registry owns concrete entity types, the order store owns
//! persistence, and the channel/transport traits own the sockets. In-memory
//! implementations for tests live in `crate::test_harness`.

use bytes::Bytes;
use thiserror::Error;

use super::repl::proto::{ReplMessage, ServerAck};
use crate::core::{
    ClientId, ConcurrencyKey, EntityDescriptor, EntityError, EntityId, EntityVersion, NodeId,
    ServerEntityAction, TransactionId,
};
use crate::error::{Effect, Transience};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is disconnected")]
    Disconnected(NodeId),
    #[error("send to peer {peer} failed: {reason}")]
    SendFailed { peer: NodeId, reason: String },
}

impl TransportError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }

    pub fn effect(&self) -> Effect {
        match self {
            TransportError::Disconnected(_) => Effect::None,
            TransportError::SendFailed { .. } => Effect::Unknown,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("client {0} is disconnected")]
    Disconnected(ClientId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transaction order store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }

    pub fn effect(&self) -> Effect {
        Effect::Unknown
    }
}

/// Current incarnation of a registered entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityInfo {
    pub version: EntityVersion,
    pub config: Bytes,
}

/// A message the entity sends to itself while handling another one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowUp {
    pub payload: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub result: Bytes,
    pub follow_ups: Vec<FollowUp>,
}

impl ApplyOutcome {
    pub fn new(result: impl Into<Bytes>) -> Self {
        Self {
            result: result.into(),
            follow_ups: Vec::new(),
        }
    }

    pub fn with_follow_up(mut self, payload: impl Into<Bytes>) -> Self {
        self.follow_ups.push(FollowUp {
            payload: payload.into(),
        });
        self
    }
}

pub trait EntityRegistry: Send + Sync {
    /// Creates a new incarnation. `None` allocates the next version; a passive
    /// passes the version it was told to mirror.
    fn create_entity(
        &self,
        entity: &EntityId,
        version: Option<EntityVersion>,
        config: &Bytes,
    ) -> Result<EntityVersion, EntityError>;

    fn get_entity(&self, entity: &EntityId) -> Option<EntityInfo>;

    /// Applies every non-create action, including destroy and sync actions.
    fn apply_action(
        &self,
        descriptor: &EntityDescriptor,
        action: ServerEntityAction,
        key: ConcurrencyKey,
        payload: &Bytes,
    ) -> Result<ApplyOutcome, EntityError>;

    /// Entity-defined partitioning of an invoke payload.
    fn partition_key_for(
        &self,
        entity: &EntityId,
        payload: &Bytes,
    ) -> Result<ConcurrencyKey, EntityError>;

    /// Live entities in creation order.
    fn entities(&self) -> Vec<(EntityId, EntityInfo)>;

    /// Keys holding state that a passive sync must transfer.
    fn concurrency_keys(&self, entity: &EntityId) -> Vec<ConcurrencyKey>;

    fn sync_payloads(
        &self,
        entity: &EntityId,
        key: ConcurrencyKey,
    ) -> Result<Vec<Bytes>, EntityError>;
}

/// An entity recorded by the order store, replayed on restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedEntity {
    pub entity: EntityId,
    pub version: EntityVersion,
    pub config: Bytes,
    pub creation_order: u64,
}

pub trait TransactionOrderStore: Send + Sync {
    /// Records that `transaction` entered the pipeline; entries below
    /// `oldest_outstanding` may be discarded.
    fn record_applied_order(
        &self,
        client: ClientId,
        transaction: TransactionId,
        oldest_outstanding: TransactionId,
    ) -> Result<(), StoreError>;

    fn record_result(
        &self,
        client: ClientId,
        transaction: TransactionId,
        result: &Result<Bytes, EntityError>,
    ) -> Result<(), StoreError>;

    fn journaled_result(
        &self,
        client: ClientId,
        transaction: TransactionId,
    ) -> Result<Option<Result<Bytes, EntityError>>, StoreError>;

    /// `passive` confirmed receipt of the client's `transaction`.
    fn record_replicated(
        &self,
        client: ClientId,
        transaction: TransactionId,
        passive: NodeId,
    ) -> Result<(), StoreError>;

    /// Last garbage-collection watermark the client reported.
    fn oldest_outstanding(&self, client: ClientId) -> Result<Option<TransactionId>, StoreError>;

    fn record_entity_created(
        &self,
        entity: &EntityId,
        version: EntityVersion,
        config: &Bytes,
    ) -> Result<(), StoreError>;

    fn record_entity_destroyed(&self, entity: &EntityId) -> Result<(), StoreError>;

    fn load_existing_entities(&self) -> Result<Vec<PersistedEntity>, StoreError>;

    fn forget_client(&self, client: ClientId) -> Result<(), StoreError>;
}

pub trait ClientChannels: Send + Sync {
    fn send(&self, client: ClientId, ack: ServerAck) -> Result<(), ChannelError>;
}

/// Ordered message channel to each peer node.
pub trait ReplicationTransport: Send + Sync {
    fn send(&self, peer: NodeId, message: ReplMessage) -> Result<(), TransportError>;
}
