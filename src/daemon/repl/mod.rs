//! Active → passive replication.
//!
//! - activity: the unit carried by the stream (sync frames + live ops)
//! - proto / frame: CBOR wire messages and their length+crc framing
//! - sender: per-passive filtering and sequencing on the active
//! - receiver: sync interleaving and apply on the passive
//! - peer_acks: what each passive has acknowledged
//! - stream: framed byte-stream transport

pub mod activity;
pub mod error;
pub mod frame;
pub mod peer_acks;
pub mod proto;
pub mod receiver;
pub mod sender;
pub mod stream;

pub use activity::{ActivityKind, ClientOrigin, SyncEntity, SyncReplicationActivity};
pub use error::ReplError;
pub use frame::{FrameError, FrameReader, FrameWriter};
pub use peer_acks::{DeliveryCallback, DeliveryOutcome, PassiveAckTracker, PassiveProgress};
pub use proto::{
    AckBatch, AckKind, AckOutcome, ClientRequest, CompletionResult, ProtoDecodeError,
    ProtoEncodeError, ReplAckKind, ReplEnvelope, ReplMessage, ReplicationAck, ServerAck,
    decode_client_request, decode_repl_message, decode_server_ack, encode_client_request,
    encode_repl_message, encode_server_ack,
};
pub use receiver::{AckBatcher, ReceiverRuntime, ReplicationReceiver, SyncPhase};
pub use sender::{
    FilterVerdict, Outbound, PassiveFilter, ReplicationSender, SenderCommand, SenderHandle,
    SenderRuntime, StreamPhase,
};
pub use stream::{StreamTransport, pump_inbound};
