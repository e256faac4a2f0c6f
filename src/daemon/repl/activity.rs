//! Replication activities: one unit of the interleaved sync + live stream.

use bytes::Bytes;

use crate::core::{
    ClientId, ConcurrencyKey, EntityId, EntityVersion, ServerEntityAction, TransactionId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    StartSync,
    EndSync,
    StartEntity,
    EndEntity,
    StartKey,
    EndKey,
    Payload,
    Create,
    Invoke,
    Destroy,
    Reconfigure,
    Noop,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::StartSync => "START_SYNC",
            ActivityKind::EndSync => "END_SYNC",
            ActivityKind::StartEntity => "START_ENTITY",
            ActivityKind::EndEntity => "END_ENTITY",
            ActivityKind::StartKey => "START_KEY",
            ActivityKind::EndKey => "END_KEY",
            ActivityKind::Payload => "PAYLOAD",
            ActivityKind::Create => "CREATE",
            ActivityKind::Invoke => "INVOKE",
            ActivityKind::Destroy => "DESTROY",
            ActivityKind::Reconfigure => "RECONFIGURE",
            ActivityKind::Noop => "NOOP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "START_SYNC" => ActivityKind::StartSync,
            "END_SYNC" => ActivityKind::EndSync,
            "START_ENTITY" => ActivityKind::StartEntity,
            "END_ENTITY" => ActivityKind::EndEntity,
            "START_KEY" => ActivityKind::StartKey,
            "END_KEY" => ActivityKind::EndKey,
            "PAYLOAD" => ActivityKind::Payload,
            "CREATE" => ActivityKind::Create,
            "INVOKE" => ActivityKind::Invoke,
            "DESTROY" => ActivityKind::Destroy,
            "RECONFIGURE" => ActivityKind::Reconfigure,
            "NOOP" => ActivityKind::Noop,
            _ => return None,
        })
    }

    /// Control and payload frames produced by a passive sync.
    pub fn is_sync(self) -> bool {
        matches!(
            self,
            ActivityKind::StartSync
                | ActivityKind::EndSync
                | ActivityKind::StartEntity
                | ActivityKind::EndEntity
                | ActivityKind::StartKey
                | ActivityKind::EndKey
                | ActivityKind::Payload
        )
    }

    /// Locally applied operations replicated as they happen.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ActivityKind::Create
                | ActivityKind::Invoke
                | ActivityKind::Destroy
                | ActivityKind::Reconfigure
        )
    }

    /// Whether the activity names an entity.
    pub fn has_entity(self) -> bool {
        !matches!(
            self,
            ActivityKind::StartSync | ActivityKind::EndSync | ActivityKind::Noop
        )
    }

    /// Action a passive performs for this activity, if any.
    pub fn server_action(self) -> Option<ServerEntityAction> {
        match self {
            ActivityKind::Create => Some(ServerEntityAction::Create),
            ActivityKind::Invoke => Some(ServerEntityAction::Invoke),
            ActivityKind::Destroy => Some(ServerEntityAction::Destroy),
            ActivityKind::Reconfigure => Some(ServerEntityAction::Reconfigure),
            ActivityKind::StartEntity => Some(ServerEntityAction::ReceiveSyncEntityStart),
            ActivityKind::StartKey => Some(ServerEntityAction::ReceiveSyncEntityKeyStart),
            ActivityKind::Payload => Some(ServerEntityAction::ReceiveSyncPayload),
            ActivityKind::EndKey => Some(ServerEntityAction::ReceiveSyncEntityKeyEnd),
            ActivityKind::EndEntity => Some(ServerEntityAction::ReceiveSyncEntityEnd),
            ActivityKind::StartSync | ActivityKind::EndSync | ActivityKind::Noop => None,
        }
    }

    pub fn from_live_action(action: ServerEntityAction) -> Option<Self> {
        match action {
            ServerEntityAction::Create => Some(ActivityKind::Create),
            ServerEntityAction::Invoke => Some(ActivityKind::Invoke),
            ServerEntityAction::Destroy => Some(ActivityKind::Destroy),
            ServerEntityAction::Reconfigure => Some(ActivityKind::Reconfigure),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entity of a sync snapshot, announced up front in `START_SYNC`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEntity {
    pub entity: EntityId,
    pub version: EntityVersion,
    pub config: Bytes,
}

/// Client bookkeeping carried with live operations so a passive can answer
/// resends after it takes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientOrigin {
    pub client: ClientId,
    pub transaction: TransactionId,
    pub oldest_outstanding: TransactionId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncReplicationActivity {
    pub kind: ActivityKind,
    /// `None` exactly when `kind.has_entity()` is false.
    pub entity: Option<EntityId>,
    pub version: EntityVersion,
    pub key: ConcurrencyKey,
    pub payload: Bytes,
    /// Populated only for `START_SYNC`.
    pub sync_set: Vec<SyncEntity>,
    pub origin: Option<ClientOrigin>,
}

impl SyncReplicationActivity {
    fn bare(kind: ActivityKind) -> Self {
        Self {
            kind,
            entity: None,
            version: EntityVersion::NONE,
            key: ConcurrencyKey::MANAGEMENT,
            payload: Bytes::new(),
            sync_set: Vec::new(),
            origin: None,
        }
    }

    fn for_entity(
        kind: ActivityKind,
        entity: EntityId,
        version: EntityVersion,
        key: ConcurrencyKey,
    ) -> Self {
        Self {
            entity: Some(entity),
            version,
            key,
            ..Self::bare(kind)
        }
    }

    pub fn start_sync(sync_set: Vec<SyncEntity>) -> Self {
        Self {
            sync_set,
            ..Self::bare(ActivityKind::StartSync)
        }
    }

    pub fn end_sync() -> Self {
        Self::bare(ActivityKind::EndSync)
    }

    pub fn noop() -> Self {
        Self::bare(ActivityKind::Noop)
    }

    pub fn start_entity(entity: EntityId, version: EntityVersion, config: Bytes) -> Self {
        Self {
            payload: config,
            ..Self::for_entity(
                ActivityKind::StartEntity,
                entity,
                version,
                ConcurrencyKey::MANAGEMENT,
            )
        }
    }

    pub fn end_entity(entity: EntityId, version: EntityVersion) -> Self {
        Self::for_entity(
            ActivityKind::EndEntity,
            entity,
            version,
            ConcurrencyKey::MANAGEMENT,
        )
    }

    pub fn start_key(entity: EntityId, version: EntityVersion, key: ConcurrencyKey) -> Self {
        Self::for_entity(ActivityKind::StartKey, entity, version, key)
    }

    pub fn end_key(entity: EntityId, version: EntityVersion, key: ConcurrencyKey) -> Self {
        Self::for_entity(ActivityKind::EndKey, entity, version, key)
    }

    pub fn sync_payload(
        entity: EntityId,
        version: EntityVersion,
        key: ConcurrencyKey,
        payload: Bytes,
    ) -> Self {
        Self {
            payload,
            ..Self::for_entity(ActivityKind::Payload, entity, version, key)
        }
    }

    /// A locally applied operation. `kind` must be live.
    pub fn live(
        kind: ActivityKind,
        entity: EntityId,
        version: EntityVersion,
        key: ConcurrencyKey,
        payload: Bytes,
        origin: Option<ClientOrigin>,
    ) -> Self {
        debug_assert!(kind.is_live(), "{kind} is not a live activity");
        Self {
            payload,
            origin,
            ..Self::for_entity(kind, entity, version, key)
        }
    }

    pub fn entity(&self) -> Option<&EntityId> {
        self.entity.as_ref()
    }

    pub fn encoded_len_hint(&self) -> usize {
        self.payload.len()
            + self
                .sync_set
                .iter()
                .map(|entry| entry.config.len())
                .sum::<usize>()
    }
}
