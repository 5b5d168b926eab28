//! Durable backing for the state store.
//!
//! The store only needs load/save/delete by key. Schema migration is owned
//! elsewhere; the table is created if missing.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::entity::{CachedEntity, EntityKey, EntityKind, Version};

/// Persistence boundary for cached entities.
pub trait DurableBacking: Send + Sync {
    fn load(&self, key: EntityKey) -> Result<Option<CachedEntity>>;
    /// Store `entity` unless the saved row carries a newer version.
    fn save(&self, entity: &CachedEntity) -> Result<()>;
    fn delete(&self, key: EntityKey) -> Result<()>;

    /// Highest session epoch among saved rows.
    fn latest_epoch(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Stores entities as JSON columns in SQLite.
pub struct SqliteBacking {
    conn: Mutex<Connection>,
}

impl SqliteBacking {
    /// Opens (or creates) the database at `path`. Use `":memory:"` for tests.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache DB at {}", path.display()))?;
        let backing = Self {
            conn: Mutex::new(conn),
        };
        backing.create_table()?;
        Ok(backing)
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cached_entities (
                kind      TEXT NOT NULL,
                id        INTEGER NOT NULL,
                epoch     INTEGER NOT NULL DEFAULT 0,
                sequence  INTEGER NOT NULL,
                last_seen TEXT NOT NULL,
                fields    TEXT NOT NULL,
                refs      TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );",
        )
        .context("Failed to create cached_entities table")?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM cached_entities", [], |row| row.get(0))
            .context("Failed to count cached entities")?;
        Ok(n as usize)
    }
}

impl DurableBacking for SqliteBacking {
    fn load(&self, key: EntityKey) -> Result<Option<CachedEntity>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT epoch, sequence, last_seen, fields, refs FROM cached_entities
                 WHERE kind = ?1 AND id = ?2",
                params![key.kind.as_str(), key.id as i64],
                |row| {
                    let epoch: i64 = row.get(0)?;
                    let sequence: i64 = row.get(1)?;
                    let last_seen: String = row.get(2)?;
                    let fields: String = row.get(3)?;
                    let refs: String = row.get(4)?;
                    Ok((Version::new(epoch as u64, sequence as u64), last_seen, fields, refs))
                },
            )
            .optional()
            .with_context(|| format!("Failed to load {}", key))?;

        let Some((version, last_seen, fields, refs)) = row else {
            return Ok(None);
        };

        Ok(Some(CachedEntity {
            kind: key.kind,
            id: key.id,
            version,
            last_seen: last_seen
                .parse()
                .with_context(|| format!("Failed to parse last_seen for {}", key))?,
            fields: serde_json::from_str(&fields)
                .with_context(|| format!("Failed to parse fields for {}", key))?,
            refs: serde_json::from_str(&refs)
                .with_context(|| format!("Failed to parse refs for {}", key))?,
        }))
    }

    fn save(&self, entity: &CachedEntity) -> Result<()> {
        let fields = serde_json::to_string(&entity.fields).context("Failed to encode fields")?;
        let refs = serde_json::to_string(&entity.refs).context("Failed to encode refs")?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cached_entities (kind, id, epoch, sequence, last_seen, fields, refs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (kind, id) DO UPDATE SET
                epoch = excluded.epoch,
                sequence = excluded.sequence,
                last_seen = excluded.last_seen,
                fields = excluded.fields,
                refs = excluded.refs
             WHERE (excluded.epoch, excluded.sequence)
                >= (cached_entities.epoch, cached_entities.sequence)",
            params![
                entity.kind.as_str(),
                entity.id as i64,
                entity.version.epoch as i64,
                entity.version.sequence as i64,
                entity.last_seen.to_rfc3339(),
                fields,
                refs
            ],
        )
        .with_context(|| format!("Failed to save {}", entity.key()))?;
        Ok(())
    }

    fn delete(&self, key: EntityKey) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM cached_entities WHERE kind = ?1 AND id = ?2",
            params![key.kind.as_str(), key.id as i64],
        )
        .with_context(|| format!("Failed to delete {}", key))?;
        Ok(())
    }

    fn latest_epoch(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let epoch: i64 = conn
            .query_row("SELECT COALESCE(MAX(epoch), 0) FROM cached_entities", [], |row| {
                row.get(0)
            })
            .context("Failed to read latest epoch")?;
        Ok(epoch as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn in_memory() -> SqliteBacking {
        SqliteBacking::open(":memory:").expect("in-memory backing failed")
    }

    fn user(key: EntityKey, version: Version, name: &str) -> CachedEntity {
        CachedEntity::from_payload(key.kind, key.id, version, &json!({ "username": name }))
    }

    #[test]
    fn test_save_load_delete() {
        let backing = in_memory();
        let entity = CachedEntity::from_payload(
            EntityKind::Channel,
            20,
            Version::new(0, 9),
            &json!({"name": "general", "guild_id": "1"}),
        );

        backing.save(&entity).unwrap();
        let loaded = backing.load(entity.key()).unwrap().unwrap();
        assert_eq!(loaded.version, Version::new(0, 9));
        assert_eq!(loaded.field_str("name"), Some("general"));
        assert_eq!(loaded.refs.get("guild_id"), Some(&1));
        assert_eq!(loaded.last_seen, entity.last_seen);

        backing.delete(entity.key()).unwrap();
        assert!(backing.load(entity.key()).unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_existing_row() {
        let backing = in_memory();
        let key = EntityKey::new(EntityKind::User, 5);

        backing.save(&user(key, Version::new(0, 1), "old")).unwrap();
        backing.save(&user(key, Version::new(0, 2), "new")).unwrap();

        assert_eq!(backing.count().unwrap(), 1);
        let loaded = backing.load(key).unwrap().unwrap();
        assert_eq!(loaded.field_str("username"), Some("new"));
    }

    #[test]
    fn test_older_save_does_not_overwrite_newer_row() {
        let backing = in_memory();
        let key = EntityKey::new(EntityKind::User, 5);

        backing.save(&user(key, Version::new(0, 8), "newer")).unwrap();
        backing.save(&user(key, Version::new(0, 3), "older")).unwrap();
        let loaded = backing.load(key).unwrap().unwrap();
        assert_eq!(loaded.field_str("username"), Some("newer"));
        assert_eq!(loaded.version, Version::new(0, 8));

        // A later session wins even with a lower sequence
        backing.save(&user(key, Version::new(1, 1), "next session")).unwrap();
        let loaded = backing.load(key).unwrap().unwrap();
        assert_eq!(loaded.field_str("username"), Some("next session"));
        assert_eq!(backing.latest_epoch().unwrap(), 1);
    }

    #[test]
    fn test_reopen_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let key = EntityKey::new(EntityKind::Guild, 1);

        {
            let backing = SqliteBacking::open(&path).unwrap();
            backing
                .save(&CachedEntity::new(key.kind, key.id, Version::new(2, 3)))
                .unwrap();
        }

        let reopened = SqliteBacking::open(&path).unwrap();
        assert_eq!(
            reopened.load(key).unwrap().map(|e| e.version),
            Some(Version::new(2, 3))
        );
        assert_eq!(reopened.latest_epoch().unwrap(), 2);
    }
}
