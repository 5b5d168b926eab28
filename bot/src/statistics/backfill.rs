// Recount statistics from channel history

use chrono::NaiveDate;
use herald::cache::{snowflake, EntityKind};
use herald::command::CommandInvocation;
use herald::event::{Event, EventBody, Message};
use herald::http::Request;
use herald::{Context, Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::{month_start, resolve_place, snowflake_at, tally, Place, Statistic, StatisticStore};
use crate::channels::{self, parse_channel, PRIVATE_THREAD};

/// Largest page the history endpoint returns
const PAGE_SIZE: usize = 100;

/// Channels recounted at once
const WORKERS: usize = 5;

/// One channel or thread whose history is recounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub guild_id: Option<u64>,
    /// The parent when `thread_id` is set
    pub channel_id: u64,
    pub thread_id: Option<u64>,
    pub is_private: Option<bool>,
}

impl Target {
    pub fn channel(guild_id: Option<u64>, channel_id: u64) -> Self {
        Self {
            guild_id,
            channel_id,
            thread_id: None,
            is_private: None,
        }
    }

    fn history_id(&self) -> u64 {
        self.thread_id.unwrap_or(self.channel_id)
    }

    fn place(&self) -> Place {
        Place {
            channel_id: self.channel_id,
            thread_id: self.thread_id,
            is_private: self.is_private,
        }
    }
}

/// Which rows a recalculation rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadMode {
    #[default]
    ChannelOnly,
    WithThreads,
    OnlyThreads,
}

pub struct Backfill {
    store: Arc<StatisticStore>,
    page_size: usize,
}

impl Backfill {
    pub fn new(store: Arc<StatisticStore>) -> Self {
        Self {
            store,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, PAGE_SIZE);
        self
    }

    /// Rebuild every month of `target` from its history, newest first.
    ///
    /// With `since_last`, history stops at the start of the month of the last
    /// stored update, so only whole months are replaced. Returns the number of
    /// messages read.
    pub async fn run(&self, ctx: &Context, target: Target, since_last: bool) -> Result<u64> {
        let cutoff = if since_last {
            self.store
                .last_updated(target.channel_id, target.thread_id)?
                .map(|at| snowflake_at(month_start(at)))
        } else {
            None
        };

        let mut month: Option<NaiveDate> = None;
        let mut rows: HashMap<u64, Statistic> = HashMap::new();
        let mut before = None;
        let mut processed = 0;

        'pages: loop {
            let page = self.fetch_page(ctx, target.history_id(), before).await?;
            let exhausted = page.len() < self.page_size;
            before = page.last().map(|m| m.id);

            for mut message in page {
                if cutoff.is_some_and(|cutoff| message.id < cutoff) {
                    break 'pages;
                }
                message.guild_id = message.guild_id.or(target.guild_id);
                let tally = tally(&message, target.place());
                if month != Some(tally.month) {
                    if let Some(done) = month {
                        self.flush(&target, done, &mut rows)?;
                    }
                    month = Some(tally.month);
                }
                rows.entry(tally.author_id)
                    .and_modify(|row| row.add(&tally))
                    .or_insert_with(|| Statistic::from_tally(&tally));
                processed += 1;
            }
            if exhausted || before.is_none() {
                break;
            }
        }
        if let Some(done) = month {
            self.flush(&target, done, &mut rows)?;
        }
        Ok(processed)
    }

    /// Run every target, `WORKERS` at a time. Failures are logged and count as zero.
    pub async fn run_all(self: &Arc<Self>, ctx: &Context, targets: Vec<Target>, since_last: bool) -> u64 {
        let permits = Arc::new(Semaphore::new(WORKERS));
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let backfill = Arc::clone(self);
            let ctx = ctx.clone();
            let permits = Arc::clone(&permits);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return 0;
                };
                match backfill.run(&ctx, target, since_last).await {
                    Ok(processed) => {
                        info!(
                            channel_id = target.history_id(),
                            processed = processed,
                            "Finished statistics recalculation"
                        );
                        processed
                    }
                    Err(e) => {
                        warn!(channel_id = target.history_id(), error = %e, "Statistics recalculation failed");
                        0
                    }
                }
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap_or(0);
        }
        total
    }

    fn flush(&self, target: &Target, month: NaiveDate, rows: &mut HashMap<u64, Statistic>) -> Result<()> {
        let mut batch: Vec<Statistic> = rows.drain().map(|(_, row)| row).collect();
        batch.sort_by_key(|row| row.author_id);
        self.store
            .replace_month(target.channel_id, target.thread_id, month, &batch)?;
        Ok(())
    }

    /// One page of history, newest first.
    async fn fetch_page(&self, ctx: &Context, channel_id: u64, before: Option<u64>) -> Result<Vec<Message>> {
        let route = format!("channels/{}/messages", channel_id);
        let mut path = format!("{}?limit={}", route, self.page_size);
        if let Some(before) = before {
            path.push_str(&format!("&before={}", before));
        }
        let response = ctx.http.submit(&route, Request::get(path)).await?;

        let Value::Array(items) = response.body else {
            return Err(Error::Decode(format!("history of {} is not a list", channel_id)));
        };
        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            if let EventBody::MessageCreate(message) = Event::decode("MESSAGE_CREATE", 0, item)?.body {
                messages.push(message);
            }
        }
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(messages)
    }
}

/// Parsed `recalculate` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    /// `None` means every text channel in the guild
    channel_id: Option<u64>,
    threads: ThreadMode,
    since_last: bool,
}

fn parse_plan(inv: &CommandInvocation) -> std::result::Result<Plan, String> {
    let mut plan = Plan {
        channel_id: Some(inv.context.channel_id),
        threads: ThreadMode::ChannelOnly,
        since_last: false,
    };
    for arg in &inv.args {
        match arg.to_lowercase().as_str() {
            "guild" => plan.channel_id = None,
            "threads" => plan.threads = ThreadMode::WithThreads,
            "only-threads" => plan.threads = ThreadMode::OnlyThreads,
            "since-last" => plan.since_last = true,
            _ => match parse_channel(arg) {
                Some(id) => plan.channel_id = Some(id),
                None => return Err(format!("`{}` is not a channel.", arg)),
            },
        }
    }
    Ok(plan)
}

/// Known threads under `channel_id`: cached ones plus archived public ones.
async fn threads_of(ctx: &Context, guild_id: Option<u64>, channel_id: u64) -> Result<Vec<Target>> {
    let mut threads: Vec<Target> = ctx
        .cache
        .referencing(EntityKind::Channel, "parent_id", channel_id)
        .iter()
        .filter(|c| channels::is_thread(c))
        .map(|c| Target {
            guild_id,
            channel_id,
            thread_id: Some(c.id),
            is_private: Some(channels::kind(c) == Some(PRIVATE_THREAD)),
        })
        .collect();

    let route = format!("channels/{}/threads/archived/public", channel_id);
    let mut before: Option<String> = None;
    loop {
        let mut path = format!("{}?limit={}", route, PAGE_SIZE);
        if let Some(before) = &before {
            path.push_str(&format!("&before={}", before));
        }
        let body = ctx.http.submit(&route, Request::get(path)).await?.body;
        let page = body
            .get("threads")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for thread in &page {
            let Some(id) = thread.get("id").and_then(snowflake) else {
                continue;
            };
            if threads.iter().all(|t| t.thread_id != Some(id)) {
                threads.push(Target {
                    guild_id,
                    channel_id,
                    thread_id: Some(id),
                    is_private: Some(false),
                });
            }
        }

        let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        before = page
            .last()
            .and_then(|t| t.pointer("/thread_metadata/archive_timestamp"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if !has_more || before.is_none() {
            break;
        }
    }
    Ok(threads)
}

/// Turn a plan into concrete targets.
async fn targets_for(ctx: &Context, guild_id: Option<u64>, plan: &Plan) -> Result<Vec<Target>> {
    let roots: Vec<u64> = match plan.channel_id {
        Some(id) => vec![id],
        None => match guild_id {
            Some(guild) => ctx
                .cache
                .referencing(EntityKind::Channel, "guild_id", guild)
                .iter()
                .filter(|c| channels::is_text(c))
                .map(|c| c.id)
                .collect(),
            None => Vec::new(),
        },
    };

    let mut targets = Vec::new();
    for root in roots {
        let place = resolve_place(ctx, root).await;
        // A thread named directly is recounted on its own
        if place.thread_id.is_some() {
            targets.push(Target {
                guild_id,
                channel_id: place.channel_id,
                thread_id: place.thread_id,
                is_private: place.is_private,
            });
            continue;
        }
        if plan.threads != ThreadMode::OnlyThreads {
            targets.push(Target::channel(guild_id, root));
        }
        if plan.threads != ThreadMode::ChannelOnly {
            targets.extend(threads_of(ctx, guild_id, root).await?);
        }
    }
    Ok(targets)
}

/// `statistics recalculate [#channel|guild] [threads|only-threads] [since-last]`
///
/// Owner only. Replies when the work starts and again when it ends.
pub async fn recalculate_command(backfill: &Arc<Backfill>, ctx: &Context, inv: &CommandInvocation) -> Result<()> {
    let reply_to = inv.context.channel_id;
    if !ctx.is_owner(inv.context.author_id) {
        ctx.reply(reply_to, "Only the bot owner can use this command.").await?;
        return Ok(());
    }
    let plan = match parse_plan(inv) {
        Ok(plan) => plan,
        Err(text) => {
            ctx.reply(reply_to, text).await?;
            return Ok(());
        }
    };
    if plan.channel_id.is_none() && inv.context.guild_id.is_none() {
        ctx.reply(reply_to, "This command can only be used in a server.").await?;
        return Ok(());
    }

    let targets = targets_for(ctx, inv.context.guild_id, &plan).await?;
    let label = match (plan.channel_id, targets.len()) {
        (Some(id), 1) => format!("<#{}>", id),
        (_, n) => format!("{} channels", n),
    };
    info!(targets = targets.len(), since_last = plan.since_last, "Starting statistics recalculation");
    ctx.reply(reply_to, format!("Starting statistics recalculation on {}.", label))
        .await?;

    let backfill = Arc::clone(backfill);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let processed = backfill.run_all(&ctx, targets, plan.since_last).await;
        let text = format!(
            "Finished statistics recalculation on {}. {} messages were processed.",
            label, processed
        );
        if let Err(e) = ctx.reply(reply_to, text).await {
            warn!(error = %e, "Failed to report recalculation result");
        }
    });
    Ok(())
}
