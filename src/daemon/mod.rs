//! The server-side pipeline.
//!
//! Provides:
//! - transaction ingress and per-(entity, key) execution lanes
//! - retirement ordering of client acknowledgements
//! - active to passive replication, including passive sync
//! - process assembly per server role

pub mod collab;
pub mod ingress;
pub mod lanes;
pub mod metrics;
pub mod node;
pub mod partition;
pub mod repl;
pub mod retirement;
pub mod sync_driver;

pub use collab::{
    ApplyOutcome, ChannelError, ClientChannels, EntityInfo, EntityRegistry, FollowUp,
    PersistedEntity, ReplicationTransport, StoreError, TransactionOrderStore, TransportError,
};
pub use ingress::{IngressParts, ResendOutcome, TransactionIngress};
pub use lanes::{JobClass, LaneJob, LanePool, LaneScheduler};
pub use node::{ActiveParts, ActiveServer, PassiveServer};
pub use retirement::{RetirementError, RetirementManager};
pub use sync_driver::{SyncDriver, SyncSummary};
