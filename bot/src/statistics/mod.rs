// Message statistics: per (channel, thread, author, month) counters

mod backfill;
mod store;
mod views;

pub use backfill::{Backfill, Target};
pub use store::{
    AuthorTotal, BotFilter, ChannelTotal, MessageTally, Statistic, StatisticStore, ThreadScope,
};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use dashmap::DashMap;
use herald::cache::EntityKind;
use herald::command::CommandInvocation;
use herald::event::{Embed, Event, EventBody, EventKind, Message};
use herald::registry::{EventFilter, Extension, LifecycleHook};
use herald::{Context, Error, Result};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channels::{self, parse_user, PRIVATE_THREAD};

pub const NAME: &str = "statistics";

/// Channels listed in a `stats` reply
const TOP_CHANNELS: usize = 10;

/// Platform epoch for snowflake timestamps (2015-01-01T00:00:00Z)
const SNOWFLAKE_EPOCH_MS: u64 = 1_420_070_400_000;

const USAGE: &str = "Usage: `statistics <user|channel|threads|recalculate>`";

fn link_regex() -> &'static Regex {
    static LINKS: OnceLock<Regex> = OnceLock::new();
    LINKS.get_or_init(|| Regex::new(r"https?://\S{2,}").expect("valid regex"))
}

/// Listener state: the store plus one lock per channel.
pub struct Statistics {
    store: Arc<StatisticStore>,
    locks: DashMap<u64, Arc<Mutex<()>>>,
    backfill: Arc<Backfill>,
}

impl Statistics {
    pub fn new(store: Arc<StatisticStore>) -> Self {
        Self::with_backfill(Arc::clone(&store), Backfill::new(store))
    }

    pub fn with_backfill(store: Arc<StatisticStore>, backfill: Backfill) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            backfill: Arc::new(backfill),
        }
    }

    pub fn store(&self) -> &Arc<StatisticStore> {
        &self.store
    }

    fn lock_for(&self, channel_id: u64) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(channel_id).or_default().value())
    }

    /// Count one message. Updates for the same channel never interleave.
    pub async fn on_message(&self, ctx: &Context, message: &Message) -> Result<()> {
        let lock = self.lock_for(message.channel_id);
        let _guard = lock.lock().await;

        let place = resolve_place(ctx, message.channel_id).await;
        let tally = tally(message, place);
        self.store.record(&tally)?;

        debug!(
            channel_id = tally.channel_id,
            thread_id = ?tally.thread_id,
            author_id = tally.author_id,
            "Recorded message statistic"
        );
        Ok(())
    }

    /// `stats [user-id]`: reply with the user's totals in this guild.
    pub async fn stats_command(&self, ctx: &Context, inv: &CommandInvocation) -> Result<()> {
        let user_id = match inv.arg(0) {
            None => inv.context.author_id,
            Some(arg) => match parse_user(arg) {
                Some(id) => id,
                None => {
                    ctx.reply(inv.context.channel_id, format!("`{}` is not a user id.", arg))
                        .await?;
                    return Ok(());
                }
            },
        };

        let totals = self.store.totals_for_author(user_id, inv.context.guild_id)?;
        let text = render_summary(user_id, &totals, inv.context.guild_id.is_some());
        ctx.reply(inv.context.channel_id, text).await?;
        Ok(())
    }

    /// `statistics <view> ...`: route to one of the views or to `recalculate`.
    pub async fn group_command(&self, ctx: &Context, inv: &CommandInvocation) -> Result<()> {
        let mut sub = inv.clone();
        let view = if sub.args.is_empty() {
            String::new()
        } else {
            sub.args.remove(0).to_lowercase()
        };
        match view.as_str() {
            "user" => self.stats_command(ctx, &sub).await,
            "channel" => views::channel_command(&self.store, ctx, &sub).await,
            "threads" => views::threads_command(&self.store, ctx, &sub).await,
            "recalculate" => backfill::recalculate_command(&self.backfill, ctx, &sub).await,
            _ => {
                ctx.reply(inv.context.channel_id, USAGE).await?;
                Ok(())
            }
        }
    }
}

/// Where a message counts: the parent channel plus the thread, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Place {
    channel_id: u64,
    thread_id: Option<u64>,
    is_private: Option<bool>,
}

impl Place {
    fn channel(channel_id: u64) -> Self {
        Self {
            channel_id,
            thread_id: None,
            is_private: None,
        }
    }
}

async fn resolve_place(ctx: &Context, channel_id: u64) -> Place {
    // Unknown channels count as plain channels
    let Ok(channel) = ctx.cache.get(EntityKind::Channel, channel_id).await else {
        return Place::channel(channel_id);
    };
    match (channels::is_thread(&channel), channel.refs.get("parent_id")) {
        (true, Some(&parent)) => Place {
            channel_id: parent,
            thread_id: Some(channel_id),
            is_private: Some(channels::kind(&channel) == Some(PRIVATE_THREAD)),
        },
        _ => Place::channel(channel_id),
    }
}

/// What one message adds to its row.
fn tally(message: &Message, place: Place) -> MessageTally {
    let mut characters = message.content.chars().count();
    let mut links = count_links(&message.content);
    // Bot output mostly lives in embeds
    if message.author.bot {
        characters += message.embeds.iter().map(Embed::text_len).sum::<usize>();
        links += message.embeds.iter().filter(|e| e.url.is_some()).count();
    }

    MessageTally {
        guild_id: message.guild_id,
        channel_id: place.channel_id,
        thread_id: place.thread_id,
        author_id: message.author.id,
        month: month_bucket(message.id),
        words: message.content.split_whitespace().count() as u64,
        characters: characters as u64,
        attachments: message.attachments.len() as u64,
        links: links as u64,
        is_bot: message.author.bot,
        is_private: place.is_private,
    }
}

pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let millis = (id >> 22) + SNOWFLAKE_EPOCH_MS;
    DateTime::<Utc>::from_timestamp_millis(millis as i64).unwrap_or_else(Utc::now)
}

/// Smallest snowflake created at or after `at`.
pub fn snowflake_at(at: DateTime<Utc>) -> u64 {
    (at.timestamp_millis().max(0) as u64).saturating_sub(SNOWFLAKE_EPOCH_MS) << 22
}

/// First day of the New York month the message was created in.
pub fn month_bucket(message_id: u64) -> NaiveDate {
    let date = snowflake_time(message_id)
        .with_timezone(&New_York)
        .date_naive();
    date.with_day(1).unwrap_or(date)
}

/// The instant the New York month containing `at` began.
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let local = at.with_timezone(&New_York).date_naive();
    local
        .with_day(1)
        .and_then(|first| first.and_hms_opt(0, 0, 0))
        .and_then(|midnight| New_York.from_local_datetime(&midnight).earliest())
        .map_or(at, |start| start.with_timezone(&Utc))
}

pub fn count_links(content: &str) -> usize {
    link_regex().find_iter(content).count()
}

/// Thousands separators, the way counts are shown in views.
pub fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub fn render_summary(user_id: u64, totals: &[ChannelTotal], in_guild: bool) -> String {
    let total: u64 = totals.iter().map(|t| t.messages).sum();
    let mut lines = vec![
        format!("Statistics for <@{}>", user_id),
        format!("Total messages: **{}**", total),
    ];
    for entry in totals.iter().take(TOP_CHANNELS) {
        lines.push(format!("**<#{}>**: {}", entry.target_channel_id(), entry.messages));
    }

    if in_guild {
        let (threads, channels): (Vec<&ChannelTotal>, Vec<&ChannelTotal>) =
            totals.iter().partition(|t| t.thread_id.is_some());
        lines.push(String::new());
        lines.push(format!(
            "Total channels: **{}** channels, **{} messages**",
            channels.len(),
            channels.iter().map(|t| t.messages).sum::<u64>()
        ));
        lines.push(format!(
            "Total threads: **{}** threads, **{} messages**",
            threads.len(),
            threads.iter().map(|t| t.messages).sum::<u64>()
        ));
    }
    lines.join("\n")
}

struct StatisticsLifecycle;

#[async_trait]
impl LifecycleHook for StatisticsLifecycle {
    async fn on_load(&self, _ctx: Context) -> Result<()> {
        info!(extension = NAME, "Statistics tracking enabled");
        Ok(())
    }

    async fn on_unload(&self, _ctx: Context) -> Result<()> {
        info!(extension = NAME, "Statistics tracking disabled");
        Ok(())
    }
}

pub fn extension(statistics: Arc<Statistics>) -> Extension {
    let listener = Arc::clone(&statistics);
    let shortcut = Arc::clone(&statistics);
    let group = statistics;

    Extension::new(NAME)
        .listener(
            EventFilter::kind(EventKind::MessageCreate),
            move |ctx: Context, event: Arc<Event>| {
                let listener = Arc::clone(&listener);
                async move {
                    match &event.body {
                        EventBody::MessageCreate(message) => listener.on_message(&ctx, message).await,
                        _ => Err(Error::handler(NAME, "expected a message event")),
                    }
                }
            },
        )
        .command(
            "stats",
            "Message statistics for you or another user",
            move |ctx: Context, inv: CommandInvocation| {
                let command = Arc::clone(&shortcut);
                async move { command.stats_command(&ctx, &inv).await }
            },
        )
        .command(
            "statistics",
            "Statistics views for a user, channel or its threads; owners can recalculate",
            move |ctx: Context, inv: CommandInvocation| {
                let command = Arc::clone(&group);
                async move { command.group_command(&ctx, &inv).await }
            },
        )
        .lifecycle(StatisticsLifecycle)
}
