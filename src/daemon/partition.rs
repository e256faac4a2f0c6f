//! Concurrency partitioner: which lane of an entity a request runs on.

use bytes::Bytes;

use crate::core::{ConcurrencyKey, EntityError, EntityId, ServerEntityAction};
use crate::daemon::collab::EntityRegistry;

/// Lifecycle actions run on the management key; invokes on whatever key the
/// entity derives from the payload. Sync actions carry their key explicitly.
pub fn key_for(
    registry: &dyn EntityRegistry,
    entity: &EntityId,
    action: ServerEntityAction,
    payload: &Bytes,
    explicit: Option<ConcurrencyKey>,
) -> Result<ConcurrencyKey, EntityError> {
    match action {
        ServerEntityAction::Create
        | ServerEntityAction::Destroy
        | ServerEntityAction::Reconfigure => Ok(ConcurrencyKey::MANAGEMENT),
        ServerEntityAction::Invoke => registry.partition_key_for(entity, payload),
        ServerEntityAction::ReceiveSyncEntityStart | ServerEntityAction::ReceiveSyncEntityEnd => {
            Ok(ConcurrencyKey::MANAGEMENT)
        }
        ServerEntityAction::ReceiveSyncEntityKeyStart
        | ServerEntityAction::ReceiveSyncPayload
        | ServerEntityAction::ReceiveSyncEntityKeyEnd => {
            explicit.ok_or_else(|| EntityError::Refused {
                reason: format!("{action} requires an explicit concurrency key"),
            })
        }
    }
}
