//! Replication error types.

use thiserror::Error;

use super::frame::FrameError;
use crate::core::{ConcurrencyKey, EntityId, NodeId};
use crate::daemon::collab::{StoreError, TransportError};
use crate::daemon::retirement::RetirementError;
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplError {
    #[error("sequence gap from {source_node}: expected {expected}, got {got}")]
    SequenceGap {
        source_node: NodeId,
        expected: u64,
        got: u64,
    },
    #[error("sync protocol violation: {reason}")]
    SyncProtocol { reason: String },
    #[error(
        "sync buffer overflow for {entity} key {key}: {ops} ops / {bytes} bytes exceeds limit"
    )]
    SyncBufferOverflow {
        entity: EntityId,
        key: ConcurrencyKey,
        ops: usize,
        bytes: usize,
    },
    #[error("unknown passive {0}")]
    UnknownPassive(NodeId),
    #[error("replication pipeline closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Retirement(#[from] RetirementError),
}

impl ReplError {
    pub fn sync_protocol(reason: impl Into<String>) -> Self {
        ReplError::SyncProtocol {
            reason: reason.into(),
        }
    }

    /// Fatal errors abort the replication session: ordering can no longer be
    /// trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReplError::SequenceGap { .. }
            | ReplError::SyncProtocol { .. }
            | ReplError::SyncBufferOverflow { .. }
            | ReplError::Retirement(_) => true,
            ReplError::Frame(err) => err.is_stream_fatal(),
            ReplError::UnknownPassive(_)
            | ReplError::Closed
            | ReplError::Transport(_)
            | ReplError::Store(_) => false,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            ReplError::Transport(err) => err.transience(),
            ReplError::Store(err) => err.transience(),
            ReplError::Frame(FrameError::Io(_)) => Transience::Retryable,
            ReplError::Closed | ReplError::UnknownPassive(_) => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ReplError::Transport(err) => err.effect(),
            ReplError::UnknownPassive(_) | ReplError::Closed => Effect::None,
            _ => Effect::Unknown,
        }
    }
}
