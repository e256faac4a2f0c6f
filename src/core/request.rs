//! Units of work flowing through the pipeline.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use super::action::ServerEntityAction;
use super::identity::{ClientId, ConcurrencyKey, EntityDescriptor, NodeId, TransactionId};

/// Opaque handle identifying one dispatched invocation for retirement.
///
/// Several requests may share a token; the token, not the request, is what
/// completes and what deferrals point at.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompletionToken(u64);

impl CompletionToken {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompletionToken({})", self.0)
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic token allocator shared by everything that dispatches work.
#[derive(Debug)]
pub struct TokenSource {
    next: AtomicU64,
}

impl TokenSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_token(&self) -> CompletionToken {
        CompletionToken(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Who asked for a request, and therefore who must hear about it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Submitted by a connected client; acks go back over its channel.
    Client {
        client: ClientId,
        transaction: TransactionId,
        oldest_outstanding: TransactionId,
    },
    /// Produced by the replication stream on a passive.
    Replicated { sequence: u64 },
    /// Synthetic server-side work (follow-ups, sync). Never purged.
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEntityRequest {
    pub descriptor: EntityDescriptor,
    pub action: ServerEntityAction,
    pub key: ConcurrencyKey,
    pub payload: Bytes,
    /// Node the request was first accepted on.
    pub source: NodeId,
    pub origin: RequestOrigin,
}

impl ServerEntityRequest {
    pub fn client(&self) -> Option<ClientId> {
        match &self.origin {
            RequestOrigin::Client { client, .. } => Some(*client),
            _ => None,
        }
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        match &self.origin {
            RequestOrigin::Client { transaction, .. } => Some(*transaction),
            _ => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.origin, RequestOrigin::Internal)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
