//! Server-side entity actions.

use serde::{Deserialize, Serialize};

/// What a [`ServerEntityRequest`](super::ServerEntityRequest) does to its entity.
///
/// The `ReceiveSync*` variants only exist on passives, where they are produced
/// from sync activities of the replication stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerEntityAction {
    Create,
    Invoke,
    Destroy,
    Reconfigure,
    ReceiveSyncEntityStart,
    ReceiveSyncEntityKeyStart,
    ReceiveSyncPayload,
    ReceiveSyncEntityKeyEnd,
    ReceiveSyncEntityEnd,
}

impl ServerEntityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerEntityAction::Create => "create",
            ServerEntityAction::Invoke => "invoke",
            ServerEntityAction::Destroy => "destroy",
            ServerEntityAction::Reconfigure => "reconfigure",
            ServerEntityAction::ReceiveSyncEntityStart => "sync_entity_start",
            ServerEntityAction::ReceiveSyncEntityKeyStart => "sync_key_start",
            ServerEntityAction::ReceiveSyncPayload => "sync_payload",
            ServerEntityAction::ReceiveSyncEntityKeyEnd => "sync_key_end",
            ServerEntityAction::ReceiveSyncEntityEnd => "sync_entity_end",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "create" => ServerEntityAction::Create,
            "invoke" => ServerEntityAction::Invoke,
            "destroy" => ServerEntityAction::Destroy,
            "reconfigure" => ServerEntityAction::Reconfigure,
            "sync_entity_start" => ServerEntityAction::ReceiveSyncEntityStart,
            "sync_key_start" => ServerEntityAction::ReceiveSyncEntityKeyStart,
            "sync_payload" => ServerEntityAction::ReceiveSyncPayload,
            "sync_key_end" => ServerEntityAction::ReceiveSyncEntityKeyEnd,
            "sync_entity_end" => ServerEntityAction::ReceiveSyncEntityEnd,
            _ => return None,
        })
    }

    /// Create, destroy and reconfigure run on the management key.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            ServerEntityAction::Create
                | ServerEntityAction::Destroy
                | ServerEntityAction::Reconfigure
        )
    }

    pub fn is_sync(self) -> bool {
        matches!(
            self,
            ServerEntityAction::ReceiveSyncEntityStart
                | ServerEntityAction::ReceiveSyncEntityKeyStart
                | ServerEntityAction::ReceiveSyncPayload
                | ServerEntityAction::ReceiveSyncEntityKeyEnd
                | ServerEntityAction::ReceiveSyncEntityEnd
        )
    }

    /// Whether a client may submit this action directly.
    pub fn is_client_action(self) -> bool {
        !self.is_sync()
    }
}

impl std::fmt::Display for ServerEntityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
