// Channel and thread leaderboards

use herald::command::CommandInvocation;
use herald::{Context, Result};

use super::{format_count, resolve_place, AuthorTotal, BotFilter, ChannelTotal, StatisticStore, ThreadScope};
use crate::channels::parse_channel;

/// Entries listed in a view
const VIEW_LIMIT: usize = 50;

/// Parsed `[#channel] [threads] [bots|only-bots]` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ViewArgs {
    channel_id: u64,
    include_threads: bool,
    bots: BotFilter,
}

fn parse_view_args(inv: &CommandInvocation) -> std::result::Result<ViewArgs, String> {
    let mut args = ViewArgs {
        channel_id: inv.context.channel_id,
        include_threads: false,
        bots: BotFilter::Exclude,
    };
    for arg in &inv.args {
        match arg.to_lowercase().as_str() {
            "threads" => args.include_threads = true,
            "bots" => args.bots = BotFilter::Include,
            "only-bots" => args.bots = BotFilter::Only,
            _ => match parse_channel(arg) {
                Some(id) => args.channel_id = id,
                None => return Err(format!("`{}` is not a channel.", arg)),
            },
        }
    }
    Ok(args)
}

/// Shared front half of both views. `None` means a reply was already sent.
async fn prepare(ctx: &Context, inv: &CommandInvocation) -> Result<Option<ViewArgs>> {
    if inv.context.guild_id.is_none() {
        ctx.reply(inv.context.channel_id, "This command can only be used in a server.")
            .await?;
        return Ok(None);
    }
    match parse_view_args(inv) {
        Ok(args) => Ok(Some(args)),
        Err(text) => {
            ctx.reply(inv.context.channel_id, text).await?;
            Ok(None)
        }
    }
}

/// `statistics channel [#channel] [threads] [bots|only-bots]`
pub async fn channel_command(store: &StatisticStore, ctx: &Context, inv: &CommandInvocation) -> Result<()> {
    let Some(args) = prepare(ctx, inv).await? else {
        return Ok(());
    };
    let place = resolve_place(ctx, args.channel_id).await;
    let scope = match place.thread_id {
        Some(thread) => ThreadScope::Thread(thread),
        None if args.include_threads => ThreadScope::WithThreads,
        None => ThreadScope::ChannelOnly,
    };

    let totals = store.author_totals(place.channel_id, scope, args.bots)?;
    ctx.reply(inv.context.channel_id, render_channel(args.channel_id, &totals))
        .await?;
    Ok(())
}

/// `statistics threads [#channel] [bots|only-bots]`
pub async fn threads_command(store: &StatisticStore, ctx: &Context, inv: &CommandInvocation) -> Result<()> {
    let Some(args) = prepare(ctx, inv).await? else {
        return Ok(());
    };
    // Asked from inside a thread: list its siblings
    let parent = resolve_place(ctx, args.channel_id).await.channel_id;

    let totals = store.thread_totals(parent, args.bots)?;
    ctx.reply(inv.context.channel_id, render_threads(parent, &totals))
        .await?;
    Ok(())
}

pub fn render_channel(channel_id: u64, totals: &[AuthorTotal]) -> String {
    let total: u64 = totals.iter().map(|t| t.messages).sum();
    let mut lines = vec![
        format!("Statistics for <#{}>", channel_id),
        format!("Total messages: **{}**", format_count(total)),
        format!("Total unique users: **{}**", format_count(totals.len() as u64)),
    ];
    for entry in totals.iter().take(VIEW_LIMIT) {
        lines.push(format!(
            "**<@{}>**: **{}**",
            entry.author_id,
            format_count(entry.messages)
        ));
    }
    lines.join("\n")
}

pub fn render_threads(channel_id: u64, totals: &[ChannelTotal]) -> String {
    let total: u64 = totals.iter().map(|t| t.messages).sum();
    let mut lines = vec![
        format!("Statistics for Threads in <#{}>", channel_id),
        format!("Total messages: **{}**", format_count(total)),
        format!("Total unique threads: **{}**", format_count(totals.len() as u64)),
    ];
    for entry in totals.iter().take(VIEW_LIMIT) {
        lines.push(format!(
            "**<#{}>**: **{}**",
            entry.target_channel_id(),
            format_count(entry.messages)
        ));
    }
    lines.join("\n")
}
