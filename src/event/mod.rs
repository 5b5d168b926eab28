use serde::Serialize;
use serde_json::Value;

use crate::cache::{EntityKey, EntityKind};

mod decode;

/// An inbound gateway event.
///
/// Immutable once decoded; shared as `Arc<Event>` while handlers run.
#[derive(Clone, Debug)]
pub struct Event {
    /// Gateway sequence number (monotonic within a session)
    pub sequence: u64,
    /// Session epoch, assigned by the state store when the event is dispatched
    pub epoch: Option<u64>,
    pub body: EventBody,
}

#[derive(Clone, Debug)]
pub enum EventBody {
    Ready(Ready),
    Resumed,
    /// Guild, channel, user or member created or changed. `snapshot` marks a full
    /// representation that replaces cached fields instead of merging into them.
    EntityUpsert {
        kind: EntityKind,
        id: u64,
        snapshot: bool,
        data: Value,
    },
    EntityDelete {
        kind: EntityKind,
        id: u64,
        guild_id: Option<u64>,
    },
    MessageCreate(Message),
    MessageUpdate {
        id: u64,
        channel_id: u64,
        guild_id: Option<u64>,
        data: Value,
    },
    MessageDelete {
        id: u64,
        channel_id: u64,
        guild_id: Option<u64>,
    },
    /// Dispatch name we do not model. Dropped by the dispatcher.
    Unknown { name: String },
}

/// Session information delivered once per IDENTIFY.
#[derive(Clone, Debug)]
pub struct Ready {
    pub session_id: String,
    pub resume_url: Option<String>,
    pub user: Author,
    pub guild_ids: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Author {
    pub id: u64,
    pub username: String,
    pub bot: bool,
}

#[derive(Clone, Debug)]
pub struct Message {
    pub id: u64,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub author: Author,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub embeds: Vec<Embed>,
    /// Raw author object, used to refresh the cached user
    pub author_data: Value,
    /// Partial member object for guild messages
    pub member: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub id: u64,
    pub url: String,
    pub filename: String,
}

/// The countable parts of a message embed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Embed {
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub footer: Option<String>,
    pub author: Option<String>,
    /// Field names and values
    pub fields: Vec<(String, String)>,
}

impl Embed {
    /// Characters of visible text, the way the platform counts embed length.
    pub fn text_len(&self) -> usize {
        let count = |s: &Option<String>| s.as_deref().map_or(0, |s| s.chars().count());
        count(&self.title)
            + count(&self.description)
            + count(&self.footer)
            + count(&self.author)
            + self
                .fields
                .iter()
                .map(|(name, value)| name.chars().count() + value.chars().count())
                .sum::<usize>()
    }
}

/// Fieldless discriminant of `EventBody`, used for listener filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ready,
    Resumed,
    EntityUpsert,
    EntityDelete,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    Unknown,
}

impl Event {
    pub fn new(sequence: u64, body: EventBody) -> Self {
        Self {
            sequence,
            epoch: None,
            body,
        }
    }

    /// Decode a dispatch frame (`t`, `s`, `d`) into an event.
    pub fn decode(name: &str, sequence: u64, data: Value) -> crate::Result<Self> {
        decode::decode(name, sequence, data)
    }

    pub fn kind(&self) -> EventKind {
        match &self.body {
            EventBody::Ready(_) => EventKind::Ready,
            EventBody::Resumed => EventKind::Resumed,
            EventBody::EntityUpsert { .. } => EventKind::EntityUpsert,
            EventBody::EntityDelete { .. } => EventKind::EntityDelete,
            EventBody::MessageCreate(_) => EventKind::MessageCreate,
            EventBody::MessageUpdate { .. } => EventKind::MessageUpdate,
            EventBody::MessageDelete { .. } => EventKind::MessageDelete,
            EventBody::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Entity whose events must be handled in arrival order.
    ///
    /// Messages are ordered per channel. Session events have no key.
    pub fn ordering_key(&self) -> Option<EntityKey> {
        match &self.body {
            EventBody::EntityUpsert { kind, id, .. } | EventBody::EntityDelete { kind, id, .. } => {
                Some(EntityKey::new(*kind, *id))
            }
            EventBody::MessageCreate(message) => {
                Some(EntityKey::new(EntityKind::Channel, message.channel_id))
            }
            EventBody::MessageUpdate { channel_id, .. }
            | EventBody::MessageDelete { channel_id, .. } => {
                Some(EntityKey::new(EntityKind::Channel, *channel_id))
            }
            EventBody::Ready(_) | EventBody::Resumed | EventBody::Unknown { .. } => None,
        }
    }
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Resumed => "resumed",
            EventKind::EntityUpsert => "entity_upsert",
            EventKind::EntityDelete => "entity_delete",
            EventKind::MessageCreate => "message_create",
            EventKind::MessageUpdate => "message_update",
            EventKind::MessageDelete => "message_delete",
            EventKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
