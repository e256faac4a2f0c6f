//! Wire message schemas and CBOR encoding.
//!
//! Two families share the codec: the client protocol (`ClientRequest`,
//! `ServerAck`) and the peer replication protocol (`ReplMessage`). Every
//! message is a definite-length CBOR map with string keys; unknown keys are
//! skipped and trailing bytes are rejected.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::activity::{ActivityKind, ClientOrigin, SyncEntity, SyncReplicationActivity};
use crate::core::{
    ClientId, ClientInstanceId, ConcurrencyKey, EntityDescriptor, EntityError, EntityId,
    EntityVersion, Limits, NodeId, ServerEntityAction, TransactionId,
};

pub const PROTOCOL_VERSION_V1: u32 = 1;

/// One replicated activity plus sequencing metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplEnvelope {
    pub source: NodeId,
    /// Monotonic per (source, passive) stream; starts at 1.
    pub sequence: u64,
    pub activity: SyncReplicationActivity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompletionResult {
    Success,
    Fail,
    /// Nothing was applied (ignored, duplicate or placeholder).
    None,
}

impl CompletionResult {
    fn as_str(self) -> &'static str {
        match self {
            CompletionResult::Success => "SUCCESS",
            CompletionResult::Fail => "FAIL",
            CompletionResult::None => "NONE",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SUCCESS" => Some(CompletionResult::Success),
            "FAIL" => Some(CompletionResult::Fail),
            "NONE" => Some(CompletionResult::None),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplAckKind {
    Received,
    Completed(CompletionResult),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReplicationAck {
    pub sequence: u64,
    pub kind: ReplAckKind,
}

impl ReplicationAck {
    pub fn received(sequence: u64) -> Self {
        Self {
            sequence,
            kind: ReplAckKind::Received,
        }
    }

    pub fn completed(sequence: u64, result: CompletionResult) -> Self {
        Self {
            sequence,
            kind: ReplAckKind::Completed(result),
        }
    }
}

/// Acks from one passive, in the order they were produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckBatch {
    pub source: NodeId,
    pub acks: Vec<ReplicationAck>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplMessage {
    Activity(ReplEnvelope),
    Acks(AckBatch),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRequest {
    pub descriptor: EntityDescriptor,
    pub transaction: TransactionId,
    pub oldest_outstanding: TransactionId,
    pub action: ServerEntityAction,
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckKind {
    Received,
    Applied,
    Retired,
}

impl AckKind {
    fn as_str(self) -> &'static str {
        match self {
            AckKind::Received => "RECEIVED",
            AckKind::Applied => "APPLIED",
            AckKind::Retired => "RETIRED",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RECEIVED" => Some(AckKind::Received),
            "APPLIED" => Some(AckKind::Applied),
            "RETIRED" => Some(AckKind::Retired),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    None,
    Result(Bytes),
    Error { code: String, message: String },
}

impl AckOutcome {
    pub fn from_result(result: &Result<Bytes, EntityError>) -> Self {
        match result {
            Ok(bytes) => AckOutcome::Result(bytes.clone()),
            Err(err) => AckOutcome::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAck {
    pub transaction: TransactionId,
    pub kind: AckKind,
    pub outcome: AckOutcome,
}

impl ServerAck {
    pub fn received(transaction: TransactionId) -> Self {
        Self {
            transaction,
            kind: AckKind::Received,
            outcome: AckOutcome::None,
        }
    }

    pub fn applied(transaction: TransactionId, result: &Result<Bytes, EntityError>) -> Self {
        Self {
            transaction,
            kind: AckKind::Applied,
            outcome: AckOutcome::from_result(result),
        }
    }

    pub fn retired(transaction: TransactionId) -> Self {
        Self {
            transaction,
            kind: AckKind::Retired,
            outcome: AckOutcome::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Activity,
    Acks,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Activity => "ACTIVITY",
            MessageType::Acks => "ACKS",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ACTIVITY" => Some(MessageType::Activity),
            "ACKS" => Some(MessageType::Acks),
            _ => None,
        }
    }
}

impl ReplMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ReplMessage::Activity(_) => MessageType::Activity,
            ReplMessage::Acks(_) => MessageType::Acks,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

impl ProtoDecodeError {
    /// Client-facing refusal for a request that never entered the pipeline.
    pub fn to_entity_error(&self) -> EntityError {
        EntityError::Refused {
            reason: format!("malformed request: {}", reason_string(self)),
        }
    }
}

pub fn encode_repl_message(message: &ReplMessage) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(PROTOCOL_VERSION_V1)?;
    enc.str("type")?;
    enc.str(message.message_type().as_str())?;
    enc.str("body")?;
    match message {
        ReplMessage::Activity(envelope) => encode_envelope_body(&mut enc, envelope)?,
        ReplMessage::Acks(batch) => encode_ack_batch(&mut enc, batch)?,
    }
    Ok(buf)
}

pub fn decode_repl_message(bytes: &[u8], limits: &Limits) -> Result<ReplMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                let end = dec.position();
                body_span = Some((start, end));
            }
            _ => skip_value(&mut dec)?,
        }
    }
    ensure_consumed(&dec)?;

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != PROTOCOL_VERSION_V1 {
        return Err(ProtoDecodeError::UnsupportedVersion(version));
    }
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;

    let mut body = Decoder::new(&bytes[start..end]);
    let message = match message_type {
        MessageType::Activity => ReplMessage::Activity(decode_envelope_body(&mut body, limits)?),
        MessageType::Acks => ReplMessage::Acks(decode_ack_batch(&mut body, limits)?),
    };
    ensure_consumed(&body)?;
    Ok(message)
}

/// Convenience wrapper for a single activity envelope.
pub fn encode_envelope(envelope: &ReplEnvelope) -> Result<Vec<u8>, ProtoEncodeError> {
    encode_repl_message(&ReplMessage::Activity(envelope.clone()))
}

fn encode_envelope_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    envelope: &ReplEnvelope,
) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("source")?;
    encode_node_id(enc, envelope.source)?;
    enc.str("seq")?;
    enc.u64(envelope.sequence)?;
    enc.str("activity")?;
    encode_activity(enc, &envelope.activity)?;
    Ok(())
}

fn decode_envelope_body(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<ReplEnvelope, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 0)?;
    let mut source = None;
    let mut sequence = None;
    let mut activity = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "source" => source = Some(decode_node_id(dec, limits, "source")?),
            "seq" => sequence = Some(dec.u64()?),
            "activity" => activity = Some(decode_activity(dec, limits, 1)?),
            _ => skip_value(dec)?,
        }
    }
    let sequence = sequence.ok_or(ProtoDecodeError::MissingField("seq"))?;
    if sequence == 0 {
        return Err(ProtoDecodeError::InvalidField {
            field: "seq",
            reason: "sequence numbers start at 1".into(),
        });
    }
    Ok(ReplEnvelope {
        source: source.ok_or(ProtoDecodeError::MissingField("source"))?,
        sequence,
        activity: activity.ok_or(ProtoDecodeError::MissingField("activity"))?,
    })
}

fn encode_activity(
    enc: &mut Encoder<&mut Vec<u8>>,
    activity: &SyncReplicationActivity,
) -> Result<(), ProtoEncodeError> {
    let mut len = 4;
    if activity.entity.is_some() {
        len += 1;
    }
    if !activity.sync_set.is_empty() {
        len += 1;
    }
    if activity.origin.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("kind")?;
    enc.str(activity.kind.as_str())?;
    if let Some(entity) = &activity.entity {
        enc.str("entity")?;
        encode_entity_id(enc, entity)?;
    }
    enc.str("version")?;
    enc.u64(activity.version.get())?;
    enc.str("key")?;
    enc.i32(activity.key.get())?;
    enc.str("payload")?;
    enc.bytes(&activity.payload)?;
    if !activity.sync_set.is_empty() {
        enc.str("sync_set")?;
        enc.array(activity.sync_set.len() as u64)?;
        for entry in &activity.sync_set {
            enc.map(3)?;
            enc.str("entity")?;
            encode_entity_id(enc, &entry.entity)?;
            enc.str("version")?;
            enc.u64(entry.version.get())?;
            enc.str("config")?;
            enc.bytes(&entry.config)?;
        }
    }
    if let Some(origin) = &activity.origin {
        enc.str("origin")?;
        enc.map(3)?;
        enc.str("client")?;
        enc.str(&origin.client.to_string())?;
        enc.str("tx")?;
        enc.u64(origin.transaction.get())?;
        enc.str("oldest")?;
        enc.u64(origin.oldest_outstanding.get())?;
    }
    Ok(())
}

fn decode_activity(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<SyncReplicationActivity, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut kind = None;
    let mut entity = None;
    let mut version = None;
    let mut key = None;
    let mut payload = None;
    let mut sync_set = Vec::new();
    let mut origin = None;
    for _ in 0..map_len {
        let field = decode_text(dec, limits)?;
        match field {
            "kind" => {
                let raw = decode_text(dec, limits)?;
                kind = Some(ActivityKind::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "kind",
                        reason: format!("unknown activity kind {raw}"),
                    }
                })?);
            }
            "entity" => entity = Some(decode_entity_id(dec, limits, depth + 1)?),
            "version" => version = Some(EntityVersion::new(dec.u64()?)),
            "key" => key = Some(ConcurrencyKey::new(dec.i32()?)),
            "payload" => {
                payload = Some(Bytes::copy_from_slice(decode_bytes(dec, limits, "payload")?))
            }
            "sync_set" => sync_set = decode_sync_set(dec, limits, depth + 1)?,
            "origin" => origin = Some(decode_origin(dec, limits, depth + 1)?),
            _ => skip_value(dec)?,
        }
    }
    let kind = kind.ok_or(ProtoDecodeError::MissingField("kind"))?;
    if kind.has_entity() != entity.is_some() {
        return Err(ProtoDecodeError::InvalidField {
            field: "entity",
            reason: format!("entity presence does not match {kind}"),
        });
    }
    Ok(SyncReplicationActivity {
        kind,
        entity,
        version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        key: key.ok_or(ProtoDecodeError::MissingField("key"))?,
        payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
        sync_set,
        origin,
    })
}

fn decode_sync_set(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<Vec<SyncEntity>, ProtoDecodeError> {
    let len = decode_array_len(dec, limits, depth)?;
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        let map_len = decode_map_len(dec, limits, depth + 1)?;
        let mut entity = None;
        let mut version = None;
        let mut config = None;
        for _ in 0..map_len {
            let field = decode_text(dec, limits)?;
            match field {
                "entity" => entity = Some(decode_entity_id(dec, limits, depth + 2)?),
                "version" => version = Some(EntityVersion::new(dec.u64()?)),
                "config" => {
                    config = Some(Bytes::copy_from_slice(decode_bytes(dec, limits, "config")?))
                }
                _ => skip_value(dec)?,
            }
        }
        out.push(SyncEntity {
            entity: entity.ok_or(ProtoDecodeError::MissingField("sync_set.entity"))?,
            version: version.ok_or(ProtoDecodeError::MissingField("sync_set.version"))?,
            config: config.unwrap_or_default(),
        });
    }
    Ok(out)
}

fn decode_origin(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<ClientOrigin, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut client = None;
    let mut transaction = None;
    let mut oldest = None;
    for _ in 0..map_len {
        let field = decode_text(dec, limits)?;
        match field {
            "client" => {
                let raw = decode_text(dec, limits)?;
                client = Some(ClientId::parse_str(raw).map_err(|e| {
                    ProtoDecodeError::InvalidField {
                        field: "origin.client",
                        reason: e.to_string(),
                    }
                })?);
            }
            "tx" => transaction = Some(TransactionId::new(dec.u64()?)),
            "oldest" => oldest = Some(TransactionId::new(dec.u64()?)),
            _ => skip_value(dec)?,
        }
    }
    Ok(ClientOrigin {
        client: client.ok_or(ProtoDecodeError::MissingField("origin.client"))?,
        transaction: transaction.ok_or(ProtoDecodeError::MissingField("origin.tx"))?,
        oldest_outstanding: oldest.ok_or(ProtoDecodeError::MissingField("origin.oldest"))?,
    })
}

fn encode_ack_batch(
    enc: &mut Encoder<&mut Vec<u8>>,
    batch: &AckBatch,
) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("source")?;
    encode_node_id(enc, batch.source)?;
    enc.str("acks")?;
    enc.array(batch.acks.len() as u64)?;
    for ack in &batch.acks {
        match ack.kind {
            ReplAckKind::Received => {
                enc.map(2)?;
                enc.str("seq")?;
                enc.u64(ack.sequence)?;
                enc.str("kind")?;
                enc.str("RECEIVED")?;
            }
            ReplAckKind::Completed(result) => {
                enc.map(3)?;
                enc.str("seq")?;
                enc.u64(ack.sequence)?;
                enc.str("kind")?;
                enc.str("COMPLETED")?;
                enc.str("result")?;
                enc.str(result.as_str())?;
            }
        }
    }
    Ok(())
}

fn decode_ack_batch(dec: &mut Decoder, limits: &Limits) -> Result<AckBatch, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 0)?;
    let mut source = None;
    let mut acks = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "source" => source = Some(decode_node_id(dec, limits, "source")?),
            "acks" => {
                let len = decode_array_len(dec, limits, 1)?;
                let mut collected = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    collected.push(decode_repl_ack(dec, limits)?);
                }
                acks = Some(collected);
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(AckBatch {
        source: source.ok_or(ProtoDecodeError::MissingField("source"))?,
        acks: acks.ok_or(ProtoDecodeError::MissingField("acks"))?,
    })
}

fn decode_repl_ack(dec: &mut Decoder, limits: &Limits) -> Result<ReplicationAck, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 2)?;
    let mut sequence = None;
    let mut kind = None;
    let mut result = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "seq" => sequence = Some(dec.u64()?),
            "kind" => kind = Some(decode_text(dec, limits)?),
            "result" => {
                let raw = decode_text(dec, limits)?;
                result = Some(CompletionResult::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "result",
                        reason: format!("unknown completion result {raw}"),
                    }
                })?);
            }
            _ => skip_value(dec)?,
        }
    }
    let sequence = sequence.ok_or(ProtoDecodeError::MissingField("seq"))?;
    let kind = match kind.ok_or(ProtoDecodeError::MissingField("kind"))? {
        "RECEIVED" => ReplAckKind::Received,
        "COMPLETED" => {
            ReplAckKind::Completed(result.ok_or(ProtoDecodeError::MissingField("result"))?)
        }
        other => {
            return Err(ProtoDecodeError::InvalidField {
                field: "kind",
                reason: format!("unknown ack kind {other}"),
            });
        }
    };
    Ok(ReplicationAck { sequence, kind })
}

pub fn encode_client_request(request: &ClientRequest) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(7)?;
    enc.str("entity")?;
    encode_entity_id(&mut enc, &request.descriptor.entity)?;
    enc.str("version")?;
    enc.u64(request.descriptor.version.get())?;
    enc.str("instance")?;
    enc.u64(request.descriptor.instance.get())?;
    enc.str("tx")?;
    enc.u64(request.transaction.get())?;
    enc.str("oldest")?;
    enc.u64(request.oldest_outstanding.get())?;
    enc.str("action")?;
    enc.str(request.action.as_str())?;
    enc.str("payload")?;
    enc.bytes(&request.payload)?;
    Ok(buf)
}

pub fn decode_client_request(
    bytes: &[u8],
    limits: &Limits,
) -> Result<ClientRequest, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;
    let mut entity = None;
    let mut version = None;
    let mut instance = None;
    let mut transaction = None;
    let mut oldest = None;
    let mut action = None;
    let mut payload = None;
    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "entity" => entity = Some(decode_entity_id(&mut dec, limits, 1)?),
            "version" => version = Some(EntityVersion::new(dec.u64()?)),
            "instance" => instance = Some(ClientInstanceId::new(dec.u64()?)),
            "tx" => transaction = Some(TransactionId::new(dec.u64()?)),
            "oldest" => oldest = Some(TransactionId::new(dec.u64()?)),
            "action" => {
                let raw = decode_text(&mut dec, limits)?;
                let parsed = ServerEntityAction::parse(raw)
                    .filter(|action| action.is_client_action())
                    .ok_or_else(|| ProtoDecodeError::InvalidField {
                        field: "action",
                        reason: format!("{raw} is not a client action"),
                    })?;
                action = Some(parsed);
            }
            "payload" => {
                payload = Some(Bytes::copy_from_slice(decode_bytes(
                    &mut dec, limits, "payload",
                )?))
            }
            _ => skip_value(&mut dec)?,
        }
    }
    ensure_consumed(&dec)?;
    let transaction = transaction.ok_or(ProtoDecodeError::MissingField("tx"))?;
    let oldest = oldest.ok_or(ProtoDecodeError::MissingField("oldest"))?;
    if oldest > transaction {
        return Err(ProtoDecodeError::InvalidField {
            field: "oldest",
            reason: format!("oldest outstanding {oldest} is after {transaction}"),
        });
    }
    Ok(ClientRequest {
        descriptor: EntityDescriptor::new(
            entity.ok_or(ProtoDecodeError::MissingField("entity"))?,
            version.ok_or(ProtoDecodeError::MissingField("version"))?,
            instance.unwrap_or(ClientInstanceId::NONE),
        ),
        transaction,
        oldest_outstanding: oldest,
        action: action.ok_or(ProtoDecodeError::MissingField("action"))?,
        payload: payload.unwrap_or_default(),
    })
}

pub fn encode_server_ack(ack: &ServerAck) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let len = match ack.outcome {
        AckOutcome::None => 2,
        _ => 3,
    };
    enc.map(len)?;
    enc.str("tx")?;
    enc.u64(ack.transaction.get())?;
    enc.str("kind")?;
    enc.str(ack.kind.as_str())?;
    match &ack.outcome {
        AckOutcome::None => {}
        AckOutcome::Result(bytes) => {
            enc.str("result")?;
            enc.bytes(bytes)?;
        }
        AckOutcome::Error { code, message } => {
            enc.str("error")?;
            enc.map(2)?;
            enc.str("code")?;
            enc.str(code)?;
            enc.str("message")?;
            enc.str(message)?;
        }
    }
    Ok(buf)
}

pub fn decode_server_ack(bytes: &[u8], limits: &Limits) -> Result<ServerAck, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;
    let mut transaction = None;
    let mut kind = None;
    let mut outcome = AckOutcome::None;
    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "tx" => transaction = Some(TransactionId::new(dec.u64()?)),
            "kind" => {
                let raw = decode_text(&mut dec, limits)?;
                kind = Some(AckKind::parse(raw).ok_or_else(|| ProtoDecodeError::InvalidField {
                    field: "kind",
                    reason: format!("unknown ack kind {raw}"),
                })?);
            }
            "result" => {
                outcome = AckOutcome::Result(Bytes::copy_from_slice(decode_bytes(
                    &mut dec, limits, "result",
                )?))
            }
            "error" => {
                let err_len = decode_map_len(&mut dec, limits, 1)?;
                let mut code = None;
                let mut message = None;
                for _ in 0..err_len {
                    let field = decode_text(&mut dec, limits)?;
                    match field {
                        "code" => code = Some(decode_text(&mut dec, limits)?.to_string()),
                        "message" => message = Some(decode_text(&mut dec, limits)?.to_string()),
                        _ => skip_value(&mut dec)?,
                    }
                }
                outcome = AckOutcome::Error {
                    code: code.ok_or(ProtoDecodeError::MissingField("error.code"))?,
                    message: message.unwrap_or_default(),
                };
            }
            _ => skip_value(&mut dec)?,
        }
    }
    ensure_consumed(&dec)?;
    Ok(ServerAck {
        transaction: transaction.ok_or(ProtoDecodeError::MissingField("tx"))?,
        kind: kind.ok_or(ProtoDecodeError::MissingField("kind"))?,
        outcome,
    })
}

fn encode_entity_id(
    enc: &mut Encoder<&mut Vec<u8>>,
    entity: &EntityId,
) -> Result<(), ProtoEncodeError> {
    enc.array(2)?;
    enc.str(entity.class_name())?;
    enc.str(entity.instance_name())?;
    Ok(())
}

fn decode_entity_id(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<EntityId, ProtoDecodeError> {
    let len = decode_array_len(dec, limits, depth)?;
    if len != 2 {
        return Err(ProtoDecodeError::InvalidField {
            field: "entity",
            reason: format!("expected [class, instance], got {len} elements"),
        });
    }
    let class = decode_text(dec, limits)?;
    let instance = decode_text(dec, limits)?;
    EntityId::new(class, instance).map_err(|e| ProtoDecodeError::InvalidField {
        field: "entity",
        reason: e.to_string(),
    })
}

fn encode_node_id(enc: &mut Encoder<&mut Vec<u8>>, node: NodeId) -> Result<(), ProtoEncodeError> {
    enc.str(&node.to_string())?;
    Ok(())
}

fn decode_node_id(
    dec: &mut Decoder,
    limits: &Limits,
    field: &'static str,
) -> Result<NodeId, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    NodeId::parse_str(raw).map_err(|e| ProtoDecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn decode_map_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    ensure_depth(limits, depth)?;
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_map_entries"))
}

fn decode_array_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    ensure_depth(limits, depth)?;
    let len = dec.array()?;
    let Some(len) = len else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_array_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_array_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_array_entries"))
}

fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a str, ProtoDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_string_len {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_text_string_len"));
    }
    Ok(s)
}

fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &Limits,
    field: &'static str,
) -> Result<&'a [u8], ProtoDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_cbor_bytes_string_len || bytes.len() > limits.max_payload_bytes {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds limit".into(),
        });
    }
    Ok(bytes)
}

fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

fn ensure_depth(limits: &Limits, depth: usize) -> Result<(), ProtoDecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_depth"));
    }
    Ok(())
}

fn skip_value(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    let ty = dec.datatype()?;
    if matches!(
        ty,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

fn ensure_consumed(dec: &Decoder) -> Result<(), ProtoDecodeError> {
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(())
}

fn reason_string(err: &ProtoDecodeError) -> String {
    match err {
        ProtoDecodeError::DecodeLimit(reason) => reason.to_string(),
        ProtoDecodeError::IndefiniteLength => "indefinite-length CBOR".to_string(),
        ProtoDecodeError::TrailingBytes => "trailing bytes".to_string(),
        ProtoDecodeError::Cbor(e) => e.to_string(),
        other => other.to_string(),
    }
}
