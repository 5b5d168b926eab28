//! Relays images posted in threads under a booru channel back to the channel.

use herald::cache::EntityKind;
use herald::event::{Event, EventBody, EventKind, Message};
use herald::registry::{EventFilter, Extension};
use herald::{Context, Error, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::channels::{self, ANNOUNCEMENT_THREAD, PUBLIC_THREAD};
use crate::settings::SettingsStore;

pub const NAME: &str = "booru";

const JUMP_BASE: &str = "https://discord.com/channels";

pub struct Booru {
    settings: Arc<SettingsStore>,
    // Keeps each notice next to its image link
    relay: Mutex<()>,
}

impl Booru {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            relay: Mutex::new(()),
        }
    }

    pub async fn on_message(&self, ctx: &Context, message: &Message) -> Result<()> {
        if message.attachments.is_empty() {
            return Ok(());
        }
        let Some(guild_id) = message.guild_id else {
            return Ok(());
        };
        let Ok(thread) = ctx.cache.get(EntityKind::Channel, message.channel_id).await else {
            return Ok(());
        };
        // Private threads stay private
        if !matches!(
            channels::kind(&thread),
            Some(ANNOUNCEMENT_THREAD | PUBLIC_THREAD)
        ) {
            return Ok(());
        }
        let Some(&parent) = thread.refs.get("parent_id") else {
            return Ok(());
        };
        if !self.settings.get(guild_id)?.is_booru_channel(parent) {
            return Ok(());
        }

        let count = message.attachments.len();
        let label = if count == 1 {
            "an image".to_string()
        } else {
            format!("{} images", count)
        };
        let notice = format!(
            "<@{}> posted {} in <#{}>: {}/{}/{}/{}",
            message.author.id, label, message.channel_id, JUMP_BASE, guild_id, message.channel_id, message.id
        );

        let _guard = self.relay.lock().await;
        ctx.send(parent, quiet(notice)).await?;
        if let [only] = message.attachments.as_slice() {
            ctx.send(parent, quiet(only.url.clone())).await?;
        }
        debug!(
            thread_id = message.channel_id,
            channel_id = parent,
            attachments = count,
            "Relayed thread images"
        );
        Ok(())
    }
}

/// A message that pings nobody.
fn quiet(content: String) -> serde_json::Value {
    json!({ "content": content, "allowed_mentions": { "parse": [] } })
}

pub fn extension(booru: Arc<Booru>) -> Extension {
    Extension::new(NAME).listener(
        EventFilter::kind(EventKind::MessageCreate),
        move |ctx: Context, event: Arc<Event>| {
            let booru = Arc::clone(&booru);
            async move {
                match &event.body {
                    EventBody::MessageCreate(message) => booru.on_message(&ctx, message).await,
                    _ => Err(Error::handler(NAME, "expected a message event")),
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald::cache::{CachedEntity, StateStore, Version};
    use herald::config::Credentials;
    use herald::event::{Attachment, Author};
    use herald::http::{HttpConfig, RequestPipeline};
    use herald::registry::{CollisionPolicy, Registry};
    use mockito::{Matcher, Server};
    use serde_json::Value;

    async fn context(base_url: String) -> Context {
        let config = HttpConfig {
            base_url,
            ..Default::default()
        };
        let http = RequestPipeline::new(config, &Credentials::new("t")).unwrap();
        let ctx = Context::new(
            Arc::new(http),
            Arc::new(StateStore::new()),
            Arc::new(Registry::new(CollisionPolicy::Reject)),
            Vec::new(),
        );
        for (id, kind) in [(31u64, PUBLIC_THREAD), (32, channels::PRIVATE_THREAD)] {
            ctx.cache
                .upsert(CachedEntity::from_payload(
                    EntityKind::Channel,
                    id,
                    Version::new(0, 1),
                    &json!({"id": id.to_string(), "type": kind, "parent_id": "30"}),
                ))
                .await
                .unwrap();
        }
        ctx
    }

    fn booru() -> Booru {
        let settings = SettingsStore::open(":memory:").unwrap();
        settings.update(1, |s| s.add_booru_channel(30)).unwrap();
        Booru::new(Arc::new(settings))
    }

    fn post(channel_id: u64, urls: &[&str]) -> Message {
        Message {
            id: 900,
            channel_id,
            guild_id: Some(1),
            author: Author {
                id: 55,
                username: "ana".to_string(),
                bot: false,
            },
            content: String::new(),
            attachments: urls
                .iter()
                .enumerate()
                .map(|(i, url)| Attachment {
                    id: i as u64 + 1,
                    url: url.to_string(),
                    filename: format!("{}.png", i),
                })
                .collect(),
            embeds: Vec::new(),
            author_data: Value::Null,
            member: None,
        }
    }

    async fn expect_post(server: &mut Server, content: &str) -> mockito::Mock {
        server
            .mock("POST", "/channels/30/messages")
            .match_body(Matcher::Json(
                json!({ "content": content, "allowed_mentions": { "parse": [] } }),
            ))
            .with_status(200)
            .with_body(r#"{"id":"1"}"#)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_single_image_is_relayed_with_its_link() {
        let mut server = Server::new_async().await;
        let ctx = context(server.url()).await;
        let notice = expect_post(
            &mut server,
            "<@55> posted an image in <#31>: https://discord.com/channels/1/31/900",
        )
        .await;
        let link = expect_post(&mut server, "https://cdn.example/a.png").await;

        booru()
            .on_message(&ctx, &post(31, &["https://cdn.example/a.png"]))
            .await
            .unwrap();
        notice.assert_async().await;
        link.assert_async().await;
    }

    #[tokio::test]
    async fn test_several_images_send_one_notice() {
        let mut server = Server::new_async().await;
        let ctx = context(server.url()).await;
        let notice = expect_post(
            &mut server,
            "<@55> posted 2 images in <#31>: https://discord.com/channels/1/31/900",
        )
        .await;

        booru()
            .on_message(&ctx, &post(31, &["https://cdn.example/a.png", "https://cdn.example/b.png"]))
            .await
            .unwrap();
        notice.assert_async().await;
    }

    #[tokio::test]
    async fn test_private_threads_and_plain_posts_are_ignored() {
        let mut server = Server::new_async().await;
        let ctx = context(server.url()).await;
        let nothing = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let booru = booru();
        booru
            .on_message(&ctx, &post(32, &["https://cdn.example/a.png"]))
            .await
            .unwrap();
        booru.on_message(&ctx, &post(31, &[])).await.unwrap();
        let mut elsewhere = post(31, &["https://cdn.example/a.png"]);
        elsewhere.guild_id = Some(2);
        booru.on_message(&ctx, &elsewhere).await.unwrap();
        nothing.assert_async().await;
    }
}
