//! Built-in meta commands: `ping`, `help`, and a READY listener.

use herald::command::CommandInvocation;
use herald::event::{Event, EventBody, EventKind};
use herald::registry::{EventFilter, Extension, Registry, TriggerPattern};
use herald::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub const NAME: &str = "meta";

/// Build the meta extension. `prefix` is only used to render `help`.
pub fn extension(prefix: &str) -> Extension {
    let prefix: Arc<str> = Arc::from(prefix);
    Extension::new(NAME)
        .command("ping", "Check that the bot is responsive", ping)
        .command("help", "List available commands", move |ctx: Context, inv: CommandInvocation| {
            let prefix = Arc::clone(&prefix);
            async move {
                let text = help_text(&ctx.registry, &prefix);
                ctx.reply(inv.context.channel_id, text).await?;
                Ok(())
            }
        })
        .listener(EventFilter::kind(EventKind::Ready), log_identity)
}

async fn ping(ctx: Context, inv: CommandInvocation) -> Result<()> {
    ctx.reply(inv.context.channel_id, "pong").await?;
    Ok(())
}

async fn log_identity(_ctx: Context, event: Arc<Event>) -> Result<()> {
    if let EventBody::Ready(ready) = &event.body {
        info!(
            user_id = ready.user.id,
            username = %ready.user.username,
            guilds = ready.guild_ids.len(),
            "Logged in"
        );
    }
    Ok(())
}

/// One line per active command, sorted by trigger.
pub fn help_text(registry: &Registry, prefix: &str) -> String {
    let commands = registry.commands();
    if commands.is_empty() {
        return "No commands are registered.".to_string();
    }

    let mut lines = vec!["**Commands**".to_string()];
    for (pattern, description, _extension) in commands {
        let usage = match &pattern {
            TriggerPattern::Exact(t) => format!("{}{}", prefix, t),
            TriggerPattern::Prefix(t) => format!("{}{}…", prefix, t),
        };
        if description.is_empty() {
            lines.push(format!("`{}`", usage));
        } else {
            lines.push(format!("`{}`: {}", usage, description));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald::cache::StateStore;
    use herald::command::InvocationContext;
    use herald::config::Credentials;
    use herald::http::{HttpConfig, RequestPipeline};
    use herald::registry::CollisionPolicy;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn context_for(base_url: String) -> Context {
        let config = HttpConfig {
            base_url,
            ..Default::default()
        };
        let http = RequestPipeline::new(config, &Credentials::new("t")).unwrap();
        Context::new(
            Arc::new(http),
            Arc::new(StateStore::new()),
            Arc::new(Registry::new(CollisionPolicy::Reject)),
            Vec::new(),
        )
    }

    fn invocation(trigger: &str) -> CommandInvocation {
        CommandInvocation {
            trigger: trigger.to_string(),
            args: Vec::new(),
            context: InvocationContext {
                guild_id: Some(1),
                channel_id: 30,
                author_id: 55,
                message_id: 900,
            },
        }
    }

    #[tokio::test]
    async fn test_ping_replies_pong() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/channels/30/messages")
            .match_body(Matcher::Json(json!({"content": "pong"})))
            .with_status(200)
            .with_body(r#"{"id":"901"}"#)
            .create_async()
            .await;

        ping(context_for(server.url()), invocation("ping"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_help_lists_registered_commands() {
        let registry = Registry::new(CollisionPolicy::Reject);
        registry.register(extension("?")).unwrap();

        let text = help_text(&registry, "?");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "**Commands**");
        assert_eq!(lines[1], "`?help`: List available commands");
        assert_eq!(lines[2], "`?ping`: Check that the bot is responsive");
    }

    #[test]
    fn test_help_with_no_commands() {
        let registry = Registry::new(CollisionPolicy::Reject);
        assert_eq!(help_text(&registry, "!"), "No commands are registered.");
    }
}
