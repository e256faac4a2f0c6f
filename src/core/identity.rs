//! Identity atoms
//!
//! EntityId: class + instance name of a logical entity
//! EntityVersion: incarnation counter bumped on every successful create
//! ClientId / NodeId: uuid identities of clients and server nodes
//! ConcurrencyKey: per-entity ordering partition

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

/// Logical entity name: entity type (class) plus instance name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    class_name: String,
    instance_name: String,
}

impl EntityId {
    pub fn new(
        class_name: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let class_name = class_name.into();
        let instance_name = instance_name.into();
        if class_name.trim().is_empty() {
            return Err(InvalidId::EntityClass {
                raw: class_name,
                reason: "empty".into(),
            }
            .into());
        }
        if instance_name.chars().any(char::is_control) {
            return Err(InvalidId::EntityInstance {
                raw: instance_name,
                reason: "contains control characters".into(),
            }
            .into());
        }
        Ok(Self {
            class_name,
            instance_name,
        })
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}:{})", self.class_name, self.instance_name)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_name, self.instance_name)
    }
}

/// Incarnation of an entity. Zero means "no incarnation yet".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityVersion(u64);

impl EntityVersion {
    pub const NONE: EntityVersion = EntityVersion(0);
    pub const FIRST: EntityVersion = EntityVersion(1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

fn parse_uuid_id(
    raw: &str,
    invalid: impl FnOnce(String, String) -> InvalidId,
) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw).map_err(|e| invalid(raw.to_string(), e.to_string()).into())
}

/// Identity of a connected client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self, CoreError> {
        parse_uuid_id(s, |raw, reason| InvalidId::Client { raw, reason }).map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Identity of a server node (active or passive).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self, CoreError> {
        parse_uuid_id(s, |raw, reason| InvalidId::Node { raw, reason }).map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        NodeId::parse_str(&s)
    }
}

impl From<Uuid> for NodeId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<NodeId> for Uuid {
    fn from(id: NodeId) -> Uuid {
        id.0
    }
}

/// Per-client handle distinguishing multiple references to the same entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientInstanceId(u64);

impl ClientInstanceId {
    pub const NONE: ClientInstanceId = ClientInstanceId(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Per-client, strictly increasing transaction sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Ordering partition within one entity.
///
/// Requests sharing a key on the same entity execute and retire in submission
/// order. [`ConcurrencyKey::MANAGEMENT`] and [`ConcurrencyKey::UNIVERSAL`] act
/// as barriers against every other key of the entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyKey(i32);

impl ConcurrencyKey {
    /// Lifecycle operations (create, destroy, reconfigure).
    pub const MANAGEMENT: ConcurrencyKey = ConcurrencyKey(0);
    /// Operations that must observe every key of the entity.
    pub const UNIVERSAL: ConcurrencyKey = ConcurrencyKey(-1);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    pub fn is_management(self) -> bool {
        self == Self::MANAGEMENT
    }

    pub fn is_universal(self) -> bool {
        self == Self::UNIVERSAL
    }

    pub fn is_barrier(self) -> bool {
        self.is_management() || self.is_universal()
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MANAGEMENT => f.write_str("management"),
            Self::UNIVERSAL => f.write_str("universal"),
            Self(raw) => write!(f, "{raw}"),
        }
    }
}

/// A client's reference to one incarnation of an entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity: EntityId,
    pub version: EntityVersion,
    pub instance: ClientInstanceId,
}

impl EntityDescriptor {
    pub fn new(entity: EntityId, version: EntityVersion, instance: ClientInstanceId) -> Self {
        Self {
            entity,
            version,
            instance,
        }
    }

    /// Descriptor used by server-internal requests that have no client handle.
    pub fn internal(entity: EntityId, version: EntityVersion) -> Self {
        Self::new(entity, version, ClientInstanceId::NONE)
    }
}
