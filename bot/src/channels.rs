// Channel types and mention parsing shared by the extensions

use herald::cache::CachedEntity;

pub const GUILD_TEXT: u64 = 0;
pub const GUILD_ANNOUNCEMENT: u64 = 5;
pub const ANNOUNCEMENT_THREAD: u64 = 10;
pub const PUBLIC_THREAD: u64 = 11;
pub const PRIVATE_THREAD: u64 = 12;

pub fn kind(channel: &CachedEntity) -> Option<u64> {
    channel.field("type").and_then(|v| v.as_u64())
}

pub fn is_thread(channel: &CachedEntity) -> bool {
    matches!(
        kind(channel),
        Some(ANNOUNCEMENT_THREAD | PUBLIC_THREAD | PRIVATE_THREAD)
    )
}

/// Channels that hold messages of their own and can parent threads.
pub fn is_text(channel: &CachedEntity) -> bool {
    matches!(kind(channel), Some(GUILD_TEXT | GUILD_ANNOUNCEMENT))
}

/// Accepts a raw id or a `<#id>` mention.
pub fn parse_channel(arg: &str) -> Option<u64> {
    arg.strip_prefix("<#")
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(arg)
        .parse()
        .ok()
}

/// Accepts a raw id or a `<@id>` / `<@!id>` mention.
pub fn parse_user(arg: &str) -> Option<u64> {
    let id = arg
        .strip_prefix("<@")
        .and_then(|rest| rest.strip_suffix('>'))
        .map(|inner| inner.trim_start_matches('!'))
        .unwrap_or(arg);
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald::cache::{EntityKind, Version};
    use serde_json::json;

    fn channel(kind: u64) -> CachedEntity {
        CachedEntity::from_payload(
            EntityKind::Channel,
            31,
            Version::default(),
            &json!({"id": "31", "type": kind}),
        )
    }

    #[test]
    fn test_thread_and_text_kinds() {
        assert!(is_thread(&channel(PUBLIC_THREAD)));
        assert!(is_thread(&channel(PRIVATE_THREAD)));
        assert!(!is_thread(&channel(GUILD_TEXT)));
        assert!(is_text(&channel(GUILD_ANNOUNCEMENT)));
        assert!(!is_text(&channel(ANNOUNCEMENT_THREAD)));
    }

    #[test]
    fn test_parse_channel_accepts_mentions() {
        assert_eq!(parse_channel("30"), Some(30));
        assert_eq!(parse_channel("<#30>"), Some(30));
        assert_eq!(parse_channel("<@30>"), None);
        assert_eq!(parse_channel("general"), None);
    }

    #[test]
    fn test_parse_user_accepts_mentions() {
        assert_eq!(parse_user("55"), Some(55));
        assert_eq!(parse_user("<@55>"), Some(55));
        assert_eq!(parse_user("<@!55>"), Some(55));
        assert_eq!(parse_user("ana"), None);
    }
}
