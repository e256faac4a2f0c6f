#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod telemetry;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    ClientId, ClientInstanceId, CompletionToken, ConcurrencyKey, EntityDescriptor, EntityError,
    EntityId, EntityVersion, Limits, NodeId, RequestOrigin, ServerEntityAction,
    ServerEntityRequest, TransactionId,
};
