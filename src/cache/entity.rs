use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Kinds of remote entity mirrored by the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Guild,
    Channel,
    User,
    Member,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Guild => "guild",
            EntityKind::Channel => "channel",
            EntityKind::User => "user",
            EntityKind::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "guild" => Some(EntityKind::Guild),
            "channel" => Some(EntityKind::Channel),
            "user" => Some(EntityKind::User),
            "member" => Some(EntityKind::Member),
            _ => None,
        }
    }
}

/// Cache identity: at most one in-memory entity per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Write ordering for cached entities.
///
/// Sequences restart with every new gateway session, so the session epoch is
/// compared first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    pub epoch: u64,
    pub sequence: u64,
}

impl Version {
    pub fn new(epoch: u64, sequence: u64) -> Self {
        Self { epoch, sequence }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.sequence)
    }
}

/// Payload keys lifted into `refs` when they hold an identifier.
const REF_FIELDS: &[&str] = &["guild_id", "parent_id", "owner_id", "channel_id", "user_id"];

/// Nested collections that become entities of their own and are not kept as fields.
const NESTED_FIELDS: &[&str] = &[
    "channels",
    "threads",
    "members",
    "presences",
    "voice_states",
];

/// Mirror of one remote entity.
///
/// Relationships are identifier references in `refs`, never nested handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub kind: EntityKind,
    pub id: u64,
    /// Session epoch and gateway sequence of the last write
    pub version: Version,
    pub last_seen: DateTime<Utc>,
    pub fields: Map<String, Value>,
    pub refs: BTreeMap<String, u64>,
}

impl CachedEntity {
    pub fn new(kind: EntityKind, id: u64, version: Version) -> Self {
        Self {
            kind,
            id,
            version,
            last_seen: Utc::now(),
            fields: Map::new(),
            refs: BTreeMap::new(),
        }
    }

    /// Build from a remote JSON object, lifting identifier refs out of it.
    pub fn from_payload(kind: EntityKind, id: u64, version: Version, data: &Value) -> Self {
        let mut entity = Self::new(kind, id, version);
        if let Some(obj) = data.as_object() {
            for (name, value) in obj {
                if NESTED_FIELDS.contains(&name.as_str()) {
                    continue;
                }
                if REF_FIELDS.contains(&name.as_str()) {
                    if let Some(target) = snowflake(value) {
                        entity.refs.insert(name.clone(), target);
                    }
                    continue;
                }
                entity.fields.insert(name.clone(), value.clone());
            }
        }
        entity
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id)
    }

    pub fn with_ref(mut self, name: &str, target: u64) -> Self {
        self.refs.insert(name.to_string(), target);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Apply a newer write. Snapshots replace fields and refs, partial writes merge them.
    pub(crate) fn absorb(&mut self, incoming: CachedEntity, snapshot: bool) {
        if snapshot {
            self.fields = incoming.fields;
            self.refs = incoming.refs;
        } else {
            self.fields.extend(incoming.fields);
            self.refs.extend(incoming.refs);
        }
        self.version = incoming.version;
        self.last_seen = incoming.last_seen;
    }
}

/// Parse an identifier sent either as a decimal string or a JSON number.
pub fn snowflake(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
