use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::entity::{EntityKey, EntityKind};
use crate::error::{Error, Result};
use crate::http::{Request, RequestPipeline};

/// Fills cache misses from the remote service.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    /// Raw JSON payload for `key`.
    async fn fetch(&self, key: EntityKey) -> Result<Value>;
}

/// Fetches entities over REST through the rate-limited pipeline.
pub struct RestFetcher {
    pipeline: Arc<RequestPipeline>,
}

impl RestFetcher {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }
}

/// REST path for a single entity. Members are only addressable within a guild.
pub(crate) fn entity_path(key: EntityKey) -> Option<String> {
    match key.kind {
        EntityKind::Guild => Some(format!("guilds/{}", key.id)),
        EntityKind::Channel => Some(format!("channels/{}", key.id)),
        EntityKind::User => Some(format!("users/{}", key.id)),
        EntityKind::Member => None,
    }
}

#[async_trait]
impl EntityFetcher for RestFetcher {
    async fn fetch(&self, key: EntityKey) -> Result<Value> {
        let path = entity_path(key).ok_or_else(|| Error::Remote {
            resource: key.to_string(),
            status: None,
            message: "entity kind cannot be fetched by id alone".to_string(),
        })?;
        let response = self.pipeline.submit(&path, Request::get(path.clone())).await?;
        Ok(response.body)
    }
}
