// Command parsing: message text -> CommandInvocation

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::Message;
use crate::registry::CollisionPolicy;

/// Command configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Text prefixes that mark a message as a command
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    /// Also treat `<@bot>` / `<@!bot>` as a prefix
    #[serde(default = "default_true")]
    pub respond_to_mentions: bool,
    #[serde(default = "default_true")]
    pub ignore_bots: bool,
    #[serde(default)]
    pub collision: CollisionPolicy,
    /// User ids allowed to run owner-only commands
    #[serde(default)]
    pub owners: Vec<u64>,
    /// Reply in the channel when a command handler fails
    #[serde(default = "default_true")]
    pub error_notices: bool,
}

fn default_prefixes() -> Vec<String> {
    vec!["!".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            respond_to_mentions: default_true(),
            ignore_bots: default_true(),
            collision: CollisionPolicy::default(),
            owners: Vec::new(),
            error_notices: default_true(),
        }
    }
}

/// Where an invocation came from. Identifiers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationContext {
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    pub author_id: u64,
    pub message_id: u64,
}

/// A parsed command, consumed by exactly one handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Lowercased trigger name
    pub trigger: String,
    pub args: Vec<String>,
    pub context: InvocationContext,
}

impl CommandInvocation {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Recognizes commands in message content.
pub struct CommandParser {
    prefixes: Vec<String>,
    respond_to_mentions: bool,
    ignore_bots: bool,
    error_notices: bool,
    /// Bot user id, learned from READY. Zero until then.
    bot_id: AtomicU64,
}

impl CommandParser {
    pub fn new(config: &CommandConfig) -> Self {
        let mut prefixes: Vec<String> = config
            .prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        // Longest first so "!!" is not read as "!" followed by "!"
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()));

        Self {
            prefixes,
            respond_to_mentions: config.respond_to_mentions,
            ignore_bots: config.ignore_bots,
            error_notices: config.error_notices,
            bot_id: AtomicU64::new(0),
        }
    }

    pub fn set_bot_id(&self, id: u64) {
        self.bot_id.store(id, Ordering::Relaxed);
    }

    pub fn error_notices(&self) -> bool {
        self.error_notices
    }

    pub fn bot_id(&self) -> Option<u64> {
        match self.bot_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    /// Parse `message` into an invocation, or `None` if it is not a command.
    pub fn parse(&self, message: &Message) -> Option<CommandInvocation> {
        if self.ignore_bots && message.author.bot {
            return None;
        }

        let rest = self.strip_prefix(message.content.trim_start())?;
        let mut args = split_args(rest);
        if args.is_empty() {
            return None;
        }
        let trigger = args.remove(0).to_lowercase();

        Some(CommandInvocation {
            trigger,
            args,
            context: InvocationContext {
                guild_id: message.guild_id,
                channel_id: message.channel_id,
                author_id: message.author.id,
                message_id: message.id,
            },
        })
    }

    fn strip_prefix<'a>(&self, content: &'a str) -> Option<&'a str> {
        if self.respond_to_mentions {
            if let Some(id) = self.bot_id() {
                for mention in [format!("<@{}>", id), format!("<@!{}>", id)] {
                    if let Some(rest) = content.strip_prefix(mention.as_str()) {
                        return Some(rest);
                    }
                }
            }
        }

        self.prefixes
            .iter()
            .find_map(|prefix| content.strip_prefix(prefix.as_str()))
    }
}

/// Split on whitespace; a double-quoted run is one argument.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || quoted {
        args.push(current);
    }
    args
}
