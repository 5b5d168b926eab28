// State store: read-through entity cache ordered by session epoch and gateway sequence.
//
// Memory first, then the durable backing, then a remote fetch. Concurrent misses on
// one key share a single in-flight fetch. Every write carries the version that
// produced it and older writes never replace newer ones. A READY opens a new epoch,
// since the gateway restarts sequences with each session.

mod backing;
mod entity;
mod fetch;

pub use backing::{DurableBacking, SqliteBacking};
pub use entity::{snowflake, CachedEntity, EntityKey, EntityKind, Version};
pub use fetch::{EntityFetcher, RestFetcher};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventBody};

/// When durable saves happen relative to the in-memory write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Save completes before the write returns
    #[default]
    WriteThrough,
    /// Saves are queued to a background writer
    WriteBehind,
}

/// Cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub consistency: Consistency,
    /// SQLite file for the durable backing. Memory-only when unset.
    #[serde(default)]
    pub database: Option<PathBuf>,
}

/// Result of resolving a miss, shared by every coalesced caller.
#[derive(Clone)]
struct Resolved {
    entity: CachedEntity,
    /// True when it came from the remote side rather than the backing
    remote: bool,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Resolved>>>;

enum WriteOp {
    Save(CachedEntity),
    Delete(EntityKey),
    Flush(oneshot::Sender<()>),
}

/// Sequence-ordered entity cache.
pub struct StateStore {
    entries: DashMap<EntityKey, CachedEntity>,
    /// Current session epoch
    epoch: AtomicU64,
    /// Highest version observed so far
    high_water: Mutex<Version>,
    in_flight: DashMap<EntityKey, SharedFetch>,
    fetcher: Option<Arc<dyn EntityFetcher>>,
    backing: Option<Arc<dyn DurableBacking>>,
    consistency: Consistency,
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl StateStore {
    /// Memory-only store without a remote fetcher.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch: AtomicU64::new(0),
            high_water: Mutex::new(Version::default()),
            in_flight: DashMap::new(),
            fetcher: None,
            backing: None,
            consistency: Consistency::WriteThrough,
            writer: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn EntityFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Attach a durable backing. `WriteBehind` spawns the writer task, so it must be
    /// called inside a tokio runtime.
    ///
    /// The epoch resumes from the newest saved row so the next session outranks
    /// everything persisted by earlier runs.
    pub fn with_backing(mut self, backing: Arc<dyn DurableBacking>, consistency: Consistency) -> Self {
        match backing.latest_epoch() {
            Ok(epoch) => {
                self.epoch = AtomicU64::new(epoch);
                self.high_water = Mutex::new(Version::new(epoch, 0));
            }
            Err(e) => warn!(error = %format!("{:#}", e), "Could not read saved epoch"),
        }
        if consistency == Consistency::WriteBehind {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(Arc::clone(&backing), rx));
            self.writer = Some(tx);
        }
        self.backing = Some(backing);
        self.consistency = consistency;
        self
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn high_water(&self) -> Version {
        *self.high_water.lock().unwrap()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Record that the gateway has delivered `version`.
    pub fn observe(&self, version: Version) {
        let mut high = self.high_water.lock().unwrap();
        if version > *high {
            *high = version;
        }
    }

    /// Assign the event its session epoch, opening a new one for READY.
    ///
    /// Must be called in gateway delivery order.
    pub fn stamp(&self, event: &mut Event) {
        if event.epoch.is_none() {
            event.epoch = Some(self.admit(event));
        }
    }

    fn admit(&self, event: &Event) -> u64 {
        if matches!(event.body, EventBody::Ready(_)) {
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(epoch = epoch, "New session epoch");
            epoch
        } else {
            self.epoch()
        }
    }

    /// Memory-only lookup.
    pub fn peek(&self, kind: EntityKind, id: u64) -> Option<CachedEntity> {
        self.entries
            .get(&EntityKey::new(kind, id))
            .map(|e| e.value().clone())
    }

    /// Memory-only scan for entities of `kind` whose `reference` points at `target`,
    /// ordered by id. Used to list a guild's channels or a channel's threads.
    pub fn referencing(&self, kind: EntityKind, reference: &str, target: u64) -> Vec<CachedEntity> {
        let mut found: Vec<CachedEntity> = self
            .entries
            .iter()
            .filter(|e| e.key().kind == kind && e.value().refs.get(reference) == Some(&target))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|e| e.id);
        found
    }

    /// Read-through lookup. A miss loads from the backing or fetches remotely.
    pub async fn get(&self, kind: EntityKind, id: u64) -> Result<CachedEntity> {
        let key = EntityKey::new(kind, id);
        if let Some(entity) = self.entries.get(&key) {
            return Ok(entity.value().clone());
        }

        let fetch = match self.in_flight.entry(key) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                // Stamp with the version as of fetch start; any live write that lands
                // meanwhile carries a higher version and wins.
                let stamp = self.high_water();
                let fetch = resolve(
                    key,
                    stamp,
                    self.backing.clone(),
                    self.fetcher.clone(),
                )
                .boxed()
                .shared();
                debug!(entity = %key, stamp = %stamp, "Cache miss, resolving");
                v.insert(fetch.clone());
                fetch
            }
        };

        let outcome = fetch.clone().await;
        self.in_flight.remove_if(&key, |_, f| f.ptr_eq(&fetch));

        let resolved = outcome?;
        let (entity, inserted) = self.install(resolved.entity);
        if inserted && resolved.remote {
            self.persist(WriteOp::Save(entity.clone())).await?;
        }
        Ok(entity)
    }

    /// Insert a resolved entity unless a write of equal or newer version is present.
    /// Returns the entity now cached and whether this call inserted it.
    fn install(&self, entity: CachedEntity) -> (CachedEntity, bool) {
        match self.entries.entry(entity.key()) {
            Entry::Occupied(mut e) => {
                if e.get().version >= entity.version {
                    (e.get().clone(), false)
                } else {
                    e.insert(entity.clone());
                    (entity, true)
                }
            }
            Entry::Vacant(v) => {
                v.insert(entity.clone());
                (entity, true)
            }
        }
    }

    /// Field-wise merge of a live write. Ignored when older than the cached version.
    pub async fn upsert(&self, entity: CachedEntity) -> Result<bool> {
        self.write(entity, false).await
    }

    /// Full-snapshot write: replaces cached fields. Same ordering rule as `upsert`.
    pub async fn replace(&self, entity: CachedEntity) -> Result<bool> {
        self.write(entity, true).await
    }

    async fn write(&self, entity: CachedEntity, snapshot: bool) -> Result<bool> {
        self.observe(entity.version);
        let key = entity.key();

        let stored = match self.entries.entry(key) {
            Entry::Occupied(mut e) => {
                if entity.version < e.get().version {
                    debug!(
                        entity = %key,
                        cached = %e.get().version,
                        incoming = %entity.version,
                        "Ignoring stale write"
                    );
                    return Ok(false);
                }
                e.get_mut().absorb(entity, snapshot);
                e.get().clone()
            }
            Entry::Vacant(v) => {
                v.insert(entity.clone());
                entity
            }
        };

        self.persist(WriteOp::Save(stored)).await?;
        Ok(true)
    }

    /// Drop an entity. Entities that reference it are left alone.
    pub async fn evict(&self, kind: EntityKind, id: u64) -> Result<Option<CachedEntity>> {
        let key = EntityKey::new(kind, id);
        let removed = self.entries.remove(&key).map(|(_, e)| e);
        self.persist(WriteOp::Delete(key)).await?;
        Ok(removed)
    }

    /// Wait until every queued write-behind operation has reached the backing.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            let (tx, rx) = oneshot::channel();
            if writer.send(WriteOp::Flush(tx)).is_ok() {
                let _ = rx.await;
            }
        }
    }

    async fn persist(&self, op: WriteOp) -> Result<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };

        match self.consistency {
            Consistency::WriteThrough => apply_write(backing.as_ref(), op).map_err(Error::from),
            Consistency::WriteBehind => {
                if let Some(writer) = &self.writer {
                    writer
                        .send(op)
                        .map_err(|_| Error::Storage("write-behind queue closed".to_string()))?;
                }
                Ok(())
            }
        }
    }

    /// Apply the cache mutation implied by a gateway event. Unstamped events are
    /// stamped here.
    pub async fn apply_event(&self, event: &Event) -> Result<()> {
        let epoch = event.epoch.unwrap_or_else(|| self.admit(event));
        let version = Version::new(epoch, event.sequence);
        self.observe(version);

        match &event.body {
            EventBody::Ready(ready) => {
                let mut user = CachedEntity::new(EntityKind::User, ready.user.id, version);
                user.fields
                    .insert("username".to_string(), Value::from(ready.user.username.clone()));
                user.fields.insert("bot".to_string(), Value::from(ready.user.bot));
                self.upsert(user).await?;
            }
            EventBody::EntityUpsert {
                kind,
                id,
                snapshot,
                data,
            } => {
                if *kind == EntityKind::Guild && *snapshot {
                    self.apply_guild_children(*id, version, data).await?;
                }
                if *kind == EntityKind::Member {
                    if let Some(user) = data.get("user") {
                        self.upsert(CachedEntity::from_payload(EntityKind::User, *id, version, user))
                            .await?;
                    }
                }
                let entity = CachedEntity::from_payload(*kind, *id, version, data);
                self.write(entity, *snapshot).await?;
            }
            EventBody::EntityDelete { kind, id, .. } => {
                self.evict(*kind, *id).await?;
            }
            EventBody::MessageCreate(message) => {
                self.upsert(CachedEntity::from_payload(
                    EntityKind::User,
                    message.author.id,
                    version,
                    &message.author_data,
                ))
                .await?;
                if let (Some(guild_id), Some(member)) = (message.guild_id, &message.member) {
                    let member = CachedEntity::from_payload(
                        EntityKind::Member,
                        message.author.id,
                        version,
                        member,
                    )
                    .with_ref("guild_id", guild_id);
                    self.upsert(member).await?;
                }
            }
            EventBody::Resumed
            | EventBody::MessageUpdate { .. }
            | EventBody::MessageDelete { .. }
            | EventBody::Unknown { .. } => {}
        }

        Ok(())
    }

    /// A guild snapshot embeds its channels, threads and members.
    async fn apply_guild_children(&self, guild_id: u64, version: Version, data: &Value) -> Result<()> {
        for field in ["channels", "threads"] {
            for channel in data.get(field).and_then(Value::as_array).into_iter().flatten() {
                let Some(id) = channel.get("id").and_then(snowflake) else {
                    continue;
                };
                let entity = CachedEntity::from_payload(EntityKind::Channel, id, version, channel)
                    .with_ref("guild_id", guild_id);
                self.replace(entity).await?;
            }
        }

        for member in data.get("members").and_then(Value::as_array).into_iter().flatten() {
            let Some(user) = member.get("user") else {
                continue;
            };
            let Some(id) = user.get("id").and_then(snowflake) else {
                continue;
            };
            self.upsert(CachedEntity::from_payload(EntityKind::User, id, version, user))
                .await?;
            let entity = CachedEntity::from_payload(EntityKind::Member, id, version, member)
                .with_ref("guild_id", guild_id);
            self.replace(entity).await?;
        }
        Ok(())
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve(
    key: EntityKey,
    stamp: Version,
    backing: Option<Arc<dyn DurableBacking>>,
    fetcher: Option<Arc<dyn EntityFetcher>>,
) -> Result<Resolved> {
    if let Some(backing) = &backing {
        match backing.load(key) {
            Ok(Some(entity)) => {
                return Ok(Resolved {
                    entity,
                    remote: false,
                })
            }
            Ok(None) => {}
            Err(e) => warn!(entity = %key, error = %format!("{:#}", e), "Backing load failed"),
        }
    }

    let fetcher = fetcher.ok_or_else(|| {
        Error::Storage(format!("{} is not cached and no fetcher is configured", key))
    })?;
    let data = fetcher.fetch(key).await?;

    Ok(Resolved {
        entity: CachedEntity::from_payload(key.kind, key.id, stamp, &data),
        remote: true,
    })
}

fn apply_write(backing: &dyn DurableBacking, op: WriteOp) -> anyhow::Result<()> {
    match op {
        WriteOp::Save(entity) => backing.save(&entity),
        WriteOp::Delete(key) => backing.delete(key),
        WriteOp::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
    }
}

async fn run_writer(backing: Arc<dyn DurableBacking>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        if let Err(e) = apply_write(backing.as_ref(), op) {
            warn!(error = %format!("{:#}", e), "Write-behind save failed");
        }
    }
    debug!("Write-behind writer stopped");
}
