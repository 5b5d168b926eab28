use serde_json::Value;

use super::{Attachment, Author, Embed, Event, EventBody, Message, Ready};
use crate::cache::{snowflake, EntityKind};
use crate::error::{Error, Result};

/// Map a dispatch name and payload onto an `Event`.
///
/// Names outside the modelled set decode to `Unknown`. A modelled name with a
/// malformed payload is a decode error.
pub fn decode(name: &str, sequence: u64, data: Value) -> Result<Event> {
    let body = match name {
        "READY" => EventBody::Ready(decode_ready(&data)?),
        "RESUMED" => EventBody::Resumed,

        "GUILD_CREATE" => upsert(EntityKind::Guild, id_field(name, &data, "id")?, true, data),
        "GUILD_UPDATE" => upsert(EntityKind::Guild, id_field(name, &data, "id")?, false, data),
        // An unavailable guild is an outage, not a removal
        "GUILD_DELETE" if data.get("unavailable").and_then(Value::as_bool) == Some(true) => {
            upsert(EntityKind::Guild, id_field(name, &data, "id")?, false, data)
        }
        "GUILD_DELETE" => EventBody::EntityDelete {
            kind: EntityKind::Guild,
            id: id_field(name, &data, "id")?,
            guild_id: None,
        },

        "CHANNEL_CREATE" | "THREAD_CREATE" => {
            upsert(EntityKind::Channel, id_field(name, &data, "id")?, true, data)
        }
        "CHANNEL_UPDATE" | "THREAD_UPDATE" => {
            upsert(EntityKind::Channel, id_field(name, &data, "id")?, false, data)
        }
        "CHANNEL_DELETE" | "THREAD_DELETE" => EventBody::EntityDelete {
            kind: EntityKind::Channel,
            id: id_field(name, &data, "id")?,
            guild_id: data.get("guild_id").and_then(snowflake),
        },

        "USER_UPDATE" => upsert(EntityKind::User, id_field(name, &data, "id")?, false, data),

        "GUILD_MEMBER_ADD" => upsert(EntityKind::Member, member_id(name, &data)?, true, data),
        "GUILD_MEMBER_UPDATE" => {
            upsert(EntityKind::Member, member_id(name, &data)?, false, data)
        }
        "GUILD_MEMBER_REMOVE" => EventBody::EntityDelete {
            kind: EntityKind::Member,
            id: member_id(name, &data)?,
            guild_id: data.get("guild_id").and_then(snowflake),
        },

        "MESSAGE_CREATE" => EventBody::MessageCreate(decode_message(&data)?),
        "MESSAGE_UPDATE" => EventBody::MessageUpdate {
            id: id_field(name, &data, "id")?,
            channel_id: id_field(name, &data, "channel_id")?,
            guild_id: data.get("guild_id").and_then(snowflake),
            data,
        },
        "MESSAGE_DELETE" => EventBody::MessageDelete {
            id: id_field(name, &data, "id")?,
            channel_id: id_field(name, &data, "channel_id")?,
            guild_id: data.get("guild_id").and_then(snowflake),
        },

        other => EventBody::Unknown {
            name: other.to_string(),
        },
    };

    Ok(Event::new(sequence, body))
}

fn upsert(kind: EntityKind, id: u64, snapshot: bool, data: Value) -> EventBody {
    EventBody::EntityUpsert {
        kind,
        id,
        snapshot,
        data,
    }
}

fn id_field(event: &str, data: &Value, field: &str) -> Result<u64> {
    data.get(field)
        .and_then(snowflake)
        .ok_or_else(|| Error::Decode(format!("{} missing '{}'", event, field)))
}

fn member_id(event: &str, data: &Value) -> Result<u64> {
    data.get("user")
        .and_then(|user| user.get("id"))
        .and_then(snowflake)
        .ok_or_else(|| Error::Decode(format!("{} missing 'user.id'", event)))
}

fn decode_author(event: &str, data: &Value) -> Result<Author> {
    Ok(Author {
        id: id_field(event, data, "id")?,
        username: data
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        bot: data.get("bot").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn decode_ready(data: &Value) -> Result<Ready> {
    let session_id = data
        .get("session_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Decode("READY missing 'session_id'".to_string()))?
        .to_string();
    let user = data
        .get("user")
        .ok_or_else(|| Error::Decode("READY missing 'user'".to_string()))?;
    let guild_ids = data
        .get("guilds")
        .and_then(Value::as_array)
        .map(|guilds| {
            guilds
                .iter()
                .filter_map(|g| g.get("id").and_then(snowflake))
                .collect()
        })
        .unwrap_or_default();

    Ok(Ready {
        session_id,
        resume_url: data
            .get("resume_gateway_url")
            .and_then(Value::as_str)
            .map(str::to_string),
        user: decode_author("READY", user)?,
        guild_ids,
    })
}

fn decode_message(data: &Value) -> Result<Message> {
    let author_data = data
        .get("author")
        .cloned()
        .ok_or_else(|| Error::Decode("MESSAGE_CREATE missing 'author'".to_string()))?;

    Ok(Message {
        id: id_field("MESSAGE_CREATE", data, "id")?,
        channel_id: id_field("MESSAGE_CREATE", data, "channel_id")?,
        guild_id: data.get("guild_id").and_then(snowflake),
        author: decode_author("MESSAGE_CREATE", &author_data)?,
        content: data
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        attachments: data
            .get("attachments")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(decode_attachment).collect())
            .unwrap_or_default(),
        embeds: data
            .get("embeds")
            .and_then(Value::as_array)
            .map(|embeds| embeds.iter().map(decode_embed).collect())
            .unwrap_or_default(),
        author_data,
        member: data.get("member").cloned(),
    })
}

// Attachments without an id or url are skipped
fn decode_attachment(data: &Value) -> Option<Attachment> {
    Some(Attachment {
        id: data.get("id").and_then(snowflake)?,
        url: data.get("url").and_then(Value::as_str)?.to_string(),
        filename: data
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn decode_embed(data: &Value) -> Embed {
    let text = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_string);
    Embed {
        url: text(data.get("url")),
        title: text(data.get("title")),
        description: text(data.get("description")),
        footer: text(data.get("footer").and_then(|f| f.get("text"))),
        author: text(data.get("author").and_then(|a| a.get("name"))),
        fields: data
            .get("fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .map(|f| {
                        (
                            text(f.get("name")).unwrap_or_default(),
                            text(f.get("value")).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}
