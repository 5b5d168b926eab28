// SQLite storage for per-author message statistics

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Counts contributed by a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTally {
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    /// Set when the message was posted in a thread; `channel_id` is then the parent.
    pub thread_id: Option<u64>,
    pub author_id: u64,
    pub month: NaiveDate,
    pub words: u64,
    pub characters: u64,
    pub attachments: u64,
    pub links: u64,
    pub is_bot: bool,
    /// Only meaningful for threads
    pub is_private: Option<bool>,
}

/// Aggregate row for one (channel, thread, author, month).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistic {
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    pub thread_id: Option<u64>,
    pub author_id: u64,
    pub month: NaiveDate,
    pub messages: u64,
    pub num_words: u64,
    pub num_characters: u64,
    pub num_attachments: u64,
    pub num_links: u64,
    pub is_bot: bool,
    pub is_private: Option<bool>,
}

impl Statistic {
    /// A fresh row holding a single message.
    pub fn from_tally(tally: &MessageTally) -> Self {
        Self {
            guild_id: tally.guild_id,
            channel_id: tally.channel_id,
            thread_id: tally.thread_id,
            author_id: tally.author_id,
            month: tally.month,
            messages: 1,
            num_words: tally.words,
            num_characters: tally.characters,
            num_attachments: tally.attachments,
            num_links: tally.links,
            is_bot: tally.is_bot,
            is_private: tally.is_private,
        }
    }

    pub fn add(&mut self, tally: &MessageTally) {
        self.messages += 1;
        self.num_words += tally.words;
        self.num_characters += tally.characters;
        self.num_attachments += tally.attachments;
        self.num_links += tally.links;
    }
}

/// Which authors a view counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BotFilter {
    #[default]
    Exclude,
    Include,
    Only,
}

impl BotFilter {
    fn clause(self) -> &'static str {
        match self {
            BotFilter::Exclude => " AND is_bot = 0",
            BotFilter::Include => "",
            BotFilter::Only => " AND is_bot = 1",
        }
    }
}

/// Which rows of a channel a view covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadScope {
    /// The channel itself
    ChannelOnly,
    /// The channel and every thread under it
    WithThreads,
    /// A single thread
    Thread(u64),
}

/// Message total for one author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorTotal {
    pub author_id: u64,
    pub messages: u64,
}

/// Message total for one channel or thread across all months.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTotal {
    pub channel_id: u64,
    pub thread_id: Option<u64>,
    pub messages: u64,
}

impl ChannelTotal {
    /// The thread if there is one, else the channel.
    pub fn target_channel_id(&self) -> u64 {
        self.thread_id.unwrap_or(self.channel_id)
    }
}

pub struct StatisticStore {
    conn: Mutex<Connection>,
}

// thread_id is stored as 0 for "no thread" so the unique key also covers channel rows
const NO_THREAD: i64 = 0;

impl StatisticStore {
    /// Opens (or creates) the database at `path`. Use `":memory:"` for tests.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open statistics DB at {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_table()?;
        Ok(store)
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS statistics (
                guild_id        INTEGER,
                channel_id      INTEGER NOT NULL,
                thread_id       INTEGER NOT NULL DEFAULT 0,
                author_id       INTEGER NOT NULL,
                month           TEXT NOT NULL,
                messages        INTEGER NOT NULL DEFAULT 0,
                num_words       INTEGER NOT NULL DEFAULT 0,
                num_characters  INTEGER NOT NULL DEFAULT 0,
                num_attachments INTEGER NOT NULL DEFAULT 0,
                num_links       INTEGER NOT NULL DEFAULT 0,
                is_bot          INTEGER NOT NULL DEFAULT 0,
                is_private      INTEGER,
                last_updated    TEXT NOT NULL,
                PRIMARY KEY (channel_id, thread_id, author_id, month)
            );
            CREATE INDEX IF NOT EXISTS idx_statistics_author
                ON statistics(author_id, guild_id);",
        )
        .context("Failed to create statistics table")?;
        Ok(())
    }

    /// Add one message to its aggregate row, creating the row if needed.
    pub fn record(&self, tally: &MessageTally) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO statistics (
                guild_id, channel_id, thread_id, author_id, month, messages,
                num_words, num_characters, num_attachments, num_links,
                is_bot, is_private, last_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (channel_id, thread_id, author_id, month) DO UPDATE SET
                messages = messages + 1,
                num_words = num_words + excluded.num_words,
                num_characters = num_characters + excluded.num_characters,
                num_attachments = num_attachments + excluded.num_attachments,
                num_links = num_links + excluded.num_links,
                last_updated = excluded.last_updated",
            params![
                tally.guild_id.map(|id| id as i64),
                tally.channel_id as i64,
                tally.thread_id.map_or(NO_THREAD, |id| id as i64),
                tally.author_id as i64,
                tally.month.to_string(),
                tally.words as i64,
                tally.characters as i64,
                tally.attachments as i64,
                tally.links as i64,
                tally.is_bot,
                tally.is_private,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to record message statistic")?;
        Ok(())
    }

    pub fn get(
        &self,
        channel_id: u64,
        thread_id: Option<u64>,
        author_id: u64,
        month: NaiveDate,
    ) -> Result<Option<Statistic>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT guild_id, channel_id, thread_id, author_id, month, messages,
                    num_words, num_characters, num_attachments, num_links, is_bot, is_private
             FROM statistics
             WHERE channel_id = ?1 AND thread_id = ?2 AND author_id = ?3 AND month = ?4",
            params![
                channel_id as i64,
                thread_id.map_or(NO_THREAD, |id| id as i64),
                author_id as i64,
                month.to_string()
            ],
            |row| {
                let month: String = row.get(4)?;
                let thread: i64 = row.get(2)?;
                Ok(Statistic {
                    guild_id: row.get::<_, Option<i64>>(0)?.map(|id| id as u64),
                    channel_id: row.get::<_, i64>(1)? as u64,
                    thread_id: (thread != NO_THREAD).then_some(thread as u64),
                    author_id: row.get::<_, i64>(3)? as u64,
                    month: NaiveDate::parse_from_str(&month, "%Y-%m-%d").map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            4,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    messages: row.get::<_, i64>(5)? as u64,
                    num_words: row.get::<_, i64>(6)? as u64,
                    num_characters: row.get::<_, i64>(7)? as u64,
                    num_attachments: row.get::<_, i64>(8)? as u64,
                    num_links: row.get::<_, i64>(9)? as u64,
                    is_bot: row.get(10)?,
                    is_private: row.get(11)?,
                })
            },
        )
        .optional()
        .context("Failed to query statistic")
    }

    /// Totals per channel and thread for an author, busiest first.
    ///
    /// `guild_id` of `None` selects direct-message statistics.
    pub fn totals_for_author(&self, author_id: u64, guild_id: Option<u64>) -> Result<Vec<ChannelTotal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT channel_id, thread_id, SUM(messages) AS total
                 FROM statistics
                 WHERE author_id = ?1 AND guild_id IS ?2
                 GROUP BY channel_id, thread_id
                 ORDER BY total DESC, channel_id, thread_id",
            )
            .context("Failed to prepare statistics query")?;

        let rows = stmt
            .query_map(
                params![author_id as i64, guild_id.map(|id| id as i64)],
                |row| {
                    let thread: i64 = row.get(1)?;
                    Ok(ChannelTotal {
                        channel_id: row.get::<_, i64>(0)? as u64,
                        thread_id: (thread != NO_THREAD).then_some(thread as u64),
                        messages: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .context("Failed to query author statistics")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read author statistics")
    }

    /// Per-author totals for a channel, busiest first.
    pub fn author_totals(
        &self,
        channel_id: u64,
        scope: ThreadScope,
        bots: BotFilter,
    ) -> Result<Vec<AuthorTotal>> {
        let mut args = vec![channel_id as i64];
        let threads = match scope {
            ThreadScope::ChannelOnly => {
                args.push(NO_THREAD);
                " AND thread_id = ?2"
            }
            ThreadScope::WithThreads => "",
            ThreadScope::Thread(id) => {
                args.push(id as i64);
                " AND thread_id = ?2"
            }
        };
        let sql = format!(
            "SELECT author_id, SUM(messages) AS total
             FROM statistics
             WHERE channel_id = ?1{}{}
             GROUP BY author_id
             ORDER BY total DESC, author_id",
            threads,
            bots.clause()
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare channel statistics query")?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(AuthorTotal {
                    author_id: row.get::<_, i64>(0)? as u64,
                    messages: row.get::<_, i64>(1)? as u64,
                })
            })
            .context("Failed to query channel statistics")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read channel statistics")
    }

    /// Per-thread totals under a channel, busiest first.
    pub fn thread_totals(&self, channel_id: u64, bots: BotFilter) -> Result<Vec<ChannelTotal>> {
        let sql = format!(
            "SELECT thread_id, SUM(messages) AS total
             FROM statistics
             WHERE channel_id = ?1 AND thread_id != ?2{}
             GROUP BY thread_id
             ORDER BY total DESC, thread_id",
            bots.clause()
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare thread statistics query")?;
        let rows = stmt
            .query_map(params![channel_id as i64, NO_THREAD], |row| {
                Ok(ChannelTotal {
                    channel_id,
                    thread_id: Some(row.get::<_, i64>(0)? as u64),
                    messages: row.get::<_, i64>(1)? as u64,
                })
            })
            .context("Failed to query thread statistics")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read thread statistics")
    }

    /// When a channel or thread was last written, if ever.
    pub fn last_updated(&self, channel_id: u64, thread_id: Option<u64>) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let latest: Option<String> = conn
            .query_row(
                "SELECT MAX(last_updated) FROM statistics WHERE channel_id = ?1 AND thread_id = ?2",
                params![channel_id as i64, thread_id.map_or(NO_THREAD, |id| id as i64)],
                |row| row.get(0),
            )
            .context("Failed to query last update")?;

        latest
            .map(|text| {
                DateTime::parse_from_rfc3339(&text)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("Bad last_updated value {}", text))
            })
            .transpose()
    }

    /// Swap every row of one channel-or-thread month for `rows`, atomically.
    pub fn replace_month(
        &self,
        channel_id: u64,
        thread_id: Option<u64>,
        month: NaiveDate,
        rows: &[Statistic],
    ) -> Result<()> {
        let thread = thread_id.map_or(NO_THREAD, |id| id as i64);
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .context("Failed to start statistics transaction")?;
        tx.execute(
            "DELETE FROM statistics WHERE channel_id = ?1 AND thread_id = ?2 AND month = ?3",
            params![channel_id as i64, thread, month.to_string()],
        )
        .context("Failed to clear statistics month")?;
        for row in rows {
            tx.execute(
                "INSERT INTO statistics (
                    guild_id, channel_id, thread_id, author_id, month, messages,
                    num_words, num_characters, num_attachments, num_links,
                    is_bot, is_private, last_updated
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.guild_id.map(|id| id as i64),
                    channel_id as i64,
                    thread,
                    row.author_id as i64,
                    month.to_string(),
                    row.messages as i64,
                    row.num_words as i64,
                    row.num_characters as i64,
                    row.num_attachments as i64,
                    row.num_links as i64,
                    row.is_bot,
                    row.is_private,
                    now,
                ],
            )
            .context("Failed to write recalculated statistic")?;
        }
        tx.commit().context("Failed to commit recalculated month")?;
        Ok(())
    }
}
