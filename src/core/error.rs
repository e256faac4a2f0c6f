//! Core capability errors (identity validation, entity apply refusals).
//!
//! These are bounded and stable: core errors represent domain/refusal states,
//! not library implementation details.

use thiserror::Error;

use super::identity::{EntityId, EntityVersion};
use crate::error::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("entity class `{raw}` is invalid: {reason}")]
    EntityClass { raw: String, reason: String },
    #[error("entity instance `{raw}` is invalid: {reason}")]
    EntityInstance { raw: String, reason: String },
    #[error("client id `{raw}` is invalid: {reason}")]
    Client { raw: String, reason: String },
    #[error("node id `{raw}` is invalid: {reason}")]
    Node { raw: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

/// Refusal or failure attached to a single entity request.
///
/// Carried back to the client inside an APPLIED ack; never aborts a lane.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EntityError {
    #[error("entity {entity} not found")]
    NotFound { entity: EntityId },
    #[error("entity {entity} already exists at {version}")]
    AlreadyExists {
        entity: EntityId,
        version: EntityVersion,
    },
    #[error("entity {entity} version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        entity: EntityId,
        expected: EntityVersion,
        found: EntityVersion,
    },
    #[error("entity {entity} was destroyed before this request ran")]
    Destroyed { entity: EntityId },
    #[error("entity {entity} is still referenced and cannot be destroyed")]
    InUse { entity: EntityId },
    #[error("entity {entity} rejected request: {reason}")]
    ApplyFailed { entity: EntityId, reason: String },
    #[error("{subsystem} overloaded (capacity {capacity})")]
    Overloaded {
        subsystem: &'static str,
        capacity: usize,
    },
    #[error("request refused: {reason}")]
    Refused { reason: String },
}

impl EntityError {
    /// Stable machine-readable code carried on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            EntityError::NotFound { .. } => "not_found",
            EntityError::AlreadyExists { .. } => "already_exists",
            EntityError::VersionMismatch { .. } => "version_mismatch",
            EntityError::Destroyed { .. } => "destroyed",
            EntityError::InUse { .. } => "in_use",
            EntityError::ApplyFailed { .. } => "apply_failed",
            EntityError::Overloaded { .. } => "overloaded",
            EntityError::Refused { .. } => "refused",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            EntityError::Overloaded { .. } | EntityError::InUse { .. } => Transience::Retryable,
            EntityError::ApplyFailed { .. } => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            EntityError::ApplyFailed { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
