//! Core domain types, in dependency order:
//! - identity: EntityId, EntityVersion, ClientId, NodeId, ConcurrencyKey
//! - action: ServerEntityAction
//! - request: ServerEntityRequest, CompletionToken
//! - limits: Limits
//! - error: CoreError, EntityError

pub mod action;
pub mod error;
pub mod identity;
pub mod limits;
pub mod request;

pub use action::ServerEntityAction;
pub use error::{CoreError, EntityError, InvalidId};
pub use identity::{
    ClientId, ClientInstanceId, ConcurrencyKey, EntityDescriptor, EntityId, EntityVersion, NodeId,
    TransactionId,
};
pub use limits::Limits;
pub use request::{CompletionToken, RequestOrigin, ServerEntityRequest, TokenSource};
