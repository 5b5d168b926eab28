// Per-guild settings and the commands that change them

mod store;

pub use store::{BooruChannel, ServerSetting, SettingsStore};

use async_trait::async_trait;
use herald::cache::EntityKind;
use herald::command::CommandInvocation;
use herald::registry::{Extension, LifecycleHook};
use herald::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::channels::parse_channel;

pub const NAME: &str = "settings";

const USAGE: &str = "Usage: `booru_channel <add|remove> <#channel>`";

/// Server owners and bot owners may change a guild's settings.
async fn may_configure(ctx: &Context, guild_id: u64, user_id: u64) -> bool {
    if ctx.is_owner(user_id) {
        return true;
    }
    match ctx.cache.get(EntityKind::Guild, guild_id).await {
        Ok(guild) => guild.refs.get("owner_id") == Some(&user_id),
        Err(_) => false,
    }
}

/// `booru_channel add|remove <#channel>`
pub async fn booru_channel_command(
    settings: &SettingsStore,
    ctx: &Context,
    inv: &CommandInvocation,
) -> Result<()> {
    let reply_to = inv.context.channel_id;
    let Some(guild_id) = inv.context.guild_id else {
        ctx.reply(reply_to, "This command can only be used in a server.").await?;
        return Ok(());
    };
    if !may_configure(ctx, guild_id, inv.context.author_id).await {
        ctx.reply(reply_to, "Only the server owner can change settings.").await?;
        return Ok(());
    }

    let action = inv.arg(0).map(str::to_lowercase);
    let channel = inv.arg(1).and_then(parse_channel);
    let text = match (action.as_deref(), channel) {
        (Some("add"), Some(id)) => {
            if settings.update(guild_id, |s| s.add_booru_channel(id))? {
                info!(guild_id = guild_id, channel_id = id, "Added booru channel");
                format!("Added <#{}> as a booru channel.", id)
            } else {
                "This channel is already a booru channel!".to_string()
            }
        }
        (Some("remove"), Some(id)) => {
            if settings.update(guild_id, |s| s.remove_booru_channel(id))? {
                info!(guild_id = guild_id, channel_id = id, "Removed booru channel");
                format!("Removed <#{}> as a booru channel.", id)
            } else {
                "This channel is not a booru channel!".to_string()
            }
        }
        _ => USAGE.to_string(),
    };
    ctx.reply(reply_to, text).await?;
    Ok(())
}

struct SettingsLifecycle(Arc<SettingsStore>);

#[async_trait]
impl LifecycleHook for SettingsLifecycle {
    async fn on_load(&self, _ctx: Context) -> Result<()> {
        let guilds = self.0.preload()?;
        info!(extension = NAME, guilds = guilds, "Server settings loaded");
        Ok(())
    }
}

pub fn extension(settings: Arc<SettingsStore>) -> Extension {
    let command = Arc::clone(&settings);
    Extension::new(NAME)
        .command(
            "booru_channel",
            "Add or remove a channel whose thread images are relayed",
            move |ctx: Context, inv: CommandInvocation| {
                let settings = Arc::clone(&command);
                async move { booru_channel_command(&settings, &ctx, &inv).await }
            },
        )
        .lifecycle(SettingsLifecycle(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald::cache::{CachedEntity, StateStore, Version};
    use herald::command::InvocationContext;
    use herald::config::Credentials;
    use herald::http::{HttpConfig, RequestPipeline};
    use herald::registry::{CollisionPolicy, Registry};
    use mockito::{Matcher, Server};
    use serde_json::json;

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
            vec![99],
        );
        ctx.cache
            .upsert(CachedEntity::from_payload(
                EntityKind::Guild,
                1,
                Version::new(0, 1),
                &json!({"id": "1", "owner_id": "55"}),
            ))
            .await
            .unwrap();
        ctx
    }

    fn invocation(author_id: u64, args: &[&str]) -> CommandInvocation {
        CommandInvocation {
            trigger: "booru_channel".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            context: InvocationContext {
                guild_id: Some(1),
                channel_id: 20,
                author_id,
                message_id: 1,
            },
        }
    }

    async fn expect_reply(server: &mut Server, content: &str) -> mockito::Mock {
        server
            .mock("POST", "/channels/20/messages")
            .match_body(Matcher::Json(json!({ "content": content })))
            .with_status(200)
            .with_body(r#"{"id":"1"}"#)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_server_owner_adds_then_removes() {
        let mut server = Server::new_async().await;
        let ctx = context(server.url()).await;
        let settings = SettingsStore::open(":memory:").unwrap();

        let added = expect_reply(&mut server, "Added <#30> as a booru channel.").await;
        booru_channel_command(&settings, &ctx, &invocation(55, &["add", "<#30>"]))
            .await
            .unwrap();
        added.assert_async().await;
        assert!(settings.get(1).unwrap().is_booru_channel(30));

        let again = expect_reply(&mut server, "This channel is already a booru channel!").await;
        booru_channel_command(&settings, &ctx, &invocation(55, &["add", "30"]))
            .await
            .unwrap();
        again.assert_async().await;

        // Bot owners may configure any guild
        let removed = expect_reply(&mut server, "Removed <#30> as a booru channel.").await;
        booru_channel_command(&settings, &ctx, &invocation(99, &["remove", "<#30>"]))
            .await
            .unwrap();
        removed.assert_async().await;

        let missing = expect_reply(&mut server, "This channel is not a booru channel!").await;
        booru_channel_command(&settings, &ctx, &invocation(55, &["REMOVE", "<#30>"]))
            .await
            .unwrap();
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_other_members_cannot_change_settings() {
        let mut server = Server::new_async().await;
        let ctx = context(server.url()).await;
        let settings = SettingsStore::open(":memory:").unwrap();

        let denied = expect_reply(&mut server, "Only the server owner can change settings.").await;
        booru_channel_command(&settings, &ctx, &invocation(66, &["add", "<#30>"]))
            .await
            .unwrap();
        denied.assert_async().await;
        assert!(settings.get(1).unwrap().booru_channels.is_empty());
    }

    #[tokio::test]
    async fn test_bad_arguments_get_usage() {
        let mut server = Server::new_async().await;
        let ctx = context(server.url()).await;
        let settings = SettingsStore::open(":memory:").unwrap();

        let usage = expect_reply(&mut server, USAGE).await;
        booru_channel_command(&settings, &ctx, &invocation(55, &["add", "general"]))
            .await
            .unwrap();
        usage.assert_async().await;
    }
}
