// SQLite storage for per-guild settings, one JSON document per guild

use anyhow::{Context, Result};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooruChannel {
    pub id: u64,
}

/// Everything configurable for one guild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSetting {
    #[serde(default)]
    pub booru_channels: Vec<BooruChannel>,
}

impl ServerSetting {
    pub fn is_booru_channel(&self, channel_id: u64) -> bool {
        self.booru_channels.iter().any(|c| c.id == channel_id)
    }

    /// Returns false if the channel was already listed.
    pub fn add_booru_channel(&mut self, channel_id: u64) -> bool {
        if self.is_booru_channel(channel_id) {
            return false;
        }
        self.booru_channels.push(BooruChannel { id: channel_id });
        true
    }

    /// Returns false if the channel was not listed.
    pub fn remove_booru_channel(&mut self, channel_id: u64) -> bool {
        let before = self.booru_channels.len();
        self.booru_channels.retain(|c| c.id != channel_id);
        self.booru_channels.len() != before
    }
}

/// Settings rows plus an in-memory copy of every guild read so far.
pub struct SettingsStore {
    conn: Mutex<Connection>,
    loaded: DashMap<u64, ServerSetting>,
}

impl SettingsStore {
    /// Opens (or creates) the database at `path`. Use `":memory:"` for tests.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open settings DB at {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS server_settings (
                guild_id INTEGER PRIMARY KEY,
                settings TEXT NOT NULL
            );",
        )
        .context("Failed to create settings table")?;
        Ok(Self {
            conn: Mutex::new(conn),
            loaded: DashMap::new(),
        })
    }

    /// Read every stored guild into memory. Returns how many there were.
    pub fn preload(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT guild_id, settings FROM server_settings")
            .context("Failed to prepare settings query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?)))
            .context("Failed to query settings")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read settings")?;

        let count = rows.len();
        for (guild_id, json) in rows {
            self.loaded.insert(guild_id, parse(guild_id, &json)?);
        }
        Ok(count)
    }

    /// Settings for a guild. Guilds never configured get the defaults.
    pub fn get(&self, guild_id: u64) -> Result<ServerSetting> {
        if let Some(setting) = self.loaded.get(&guild_id) {
            return Ok(setting.clone());
        }
        let conn = self.conn.lock().unwrap();
        // An update may have landed while we waited for the connection
        if let Some(setting) = self.loaded.get(&guild_id) {
            return Ok(setting.clone());
        }
        let setting = load(&conn, guild_id)?;
        self.loaded.insert(guild_id, setting.clone());
        Ok(setting)
    }

    /// Apply `change` to a guild's settings and persist the result.
    ///
    /// Updates are serialized, so two changes to one guild never lose each other.
    pub fn update<T>(&self, guild_id: u64, change: impl FnOnce(&mut ServerSetting) -> T) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        let mut setting = match self.loaded.get(&guild_id) {
            Some(setting) => setting.clone(),
            None => load(&conn, guild_id)?,
        };
        let outcome = change(&mut setting);

        let json = serde_json::to_string(&setting).context("Failed to encode settings")?;
        conn.execute(
            "INSERT INTO server_settings (guild_id, settings) VALUES (?1, ?2)
             ON CONFLICT (guild_id) DO UPDATE SET settings = excluded.settings",
            params![guild_id as i64, json],
        )
        .context("Failed to save settings")?;
        self.loaded.insert(guild_id, setting);
        Ok(outcome)
    }
}

fn load(conn: &Connection, guild_id: u64) -> Result<ServerSetting> {
    let json: Option<String> = conn
        .query_row(
            "SELECT settings FROM server_settings WHERE guild_id = ?1",
            params![guild_id as i64],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query settings")?;
    match json {
        Some(json) => parse(guild_id, &json),
        None => Ok(ServerSetting::default()),
    }
}

fn parse(guild_id: u64, json: &str) -> Result<ServerSetting> {
    serde_json::from_str(json).with_context(|| format!("Corrupt settings for guild {}", guild_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_unknown_guild_gets_defaults() {
        let store = SettingsStore::open(":memory:").unwrap();
        assert_eq!(store.get(1).unwrap(), ServerSetting::default());
    }

    #[test]
    fn test_add_and_remove_booru_channels() {
        let store = SettingsStore::open(":memory:").unwrap();
        assert!(store.update(1, |s| s.add_booru_channel(30)).unwrap());
        assert!(!store.update(1, |s| s.add_booru_channel(30)).unwrap());
        assert!(store.get(1).unwrap().is_booru_channel(30));
        assert!(!store.get(2).unwrap().is_booru_channel(30));

        assert!(store.update(1, |s| s.remove_booru_channel(30)).unwrap());
        assert!(!store.update(1, |s| s.remove_booru_channel(30)).unwrap());
        assert!(store.get(1).unwrap().booru_channels.is_empty());
    }

    #[test]
    fn test_settings_are_stored_as_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.db");
        {
            let store = SettingsStore::open(&path).unwrap();
            store.update(1, |s| s.add_booru_channel(30)).unwrap();
            store.update(1, |s| s.add_booru_channel(31)).unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        let json: String = conn
            .query_row("SELECT settings FROM server_settings WHERE guild_id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(json, r#"{"booru_channels":[{"id":30},{"id":31}]}"#);

        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.preload().unwrap(), 1);
        assert!(store.get(1).unwrap().is_booru_channel(31));
    }

    #[test]
    fn test_missing_fields_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.db");
        let store = SettingsStore::open(&path).unwrap();
        Connection::open(&path)
            .unwrap()
            .execute(
                "INSERT INTO server_settings (guild_id, settings) VALUES (5, '{}')",
                [],
            )
            .unwrap();
        assert!(store.get(5).unwrap().booru_channels.is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(SettingsStore::open(":memory:").unwrap());
        let handles: Vec<_> = (0..16u64)
            .map(|id| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.update(1, |s| s.add_booru_channel(100 + id)).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(store.get(1).unwrap().booru_channels.len(), 16);
    }
}
