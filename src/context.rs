use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::StateStore;
use crate::error::Result;
use crate::http::{Request, RequestPipeline, Response};
use crate::registry::Registry;

/// Handle passed to every handler invocation.
///
/// Cheap to clone; everything inside is shared.
#[derive(Clone)]
pub struct Context {
    pub http: Arc<RequestPipeline>,
    pub cache: Arc<StateStore>,
    pub registry: Arc<Registry>,
    owners: Arc<HashSet<u64>>,
}

impl Context {
    pub fn new(
        http: Arc<RequestPipeline>,
        cache: Arc<StateStore>,
        registry: Arc<Registry>,
        owners: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            http,
            cache,
            registry,
            owners: Arc::new(owners.into_iter().collect()),
        }
    }

    /// True if `user_id` is one of the configured bot owners.
    pub fn is_owner(&self, user_id: u64) -> bool {
        self.owners.contains(&user_id)
    }

    /// Post a plain text message to a channel.
    pub async fn reply(&self, channel_id: u64, content: impl Into<String>) -> Result<Response> {
        self.send(channel_id, json!({ "content": content.into() })).await
    }

    /// Post a full message body (content, allowed mentions, embeds) to a channel.
    pub async fn send(&self, channel_id: u64, body: Value) -> Result<Response> {
        let path = format!("channels/{}/messages", channel_id);
        let request = Request::post(path.clone()).json(body);
        self.http.submit(&path, request).await
    }
}
