// Outbound REST request pipeline

mod pipeline;

pub use pipeline::RequestPipeline;
pub use reqwest::Method;

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// REST client configuration
#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Total attempts for 5xx/network failures before surfacing RemoteError
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Budget assumed for a bucket before the remote side reports one
    #[serde(default = "default_budget")]
    pub default_budget: u32,
    #[serde(default = "default_window_ms")]
    pub default_window_ms: u64,
}

fn default_base_url() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_user_agent() -> String {
    format!("DiscordBot (herald, {})", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_seconds() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_budget() -> u32 {
    5
}

fn default_window_ms() -> u64 {
    1_000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout_seconds: default_timeout_seconds(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            default_budget: default_budget(),
            default_window_ms: default_window_ms(),
        }
    }
}

impl HttpConfig {
    pub fn default_window(&self) -> Duration {
        Duration::from_millis(self.default_window_ms)
    }
}

/// One outbound call, relative to `HttpConfig::base_url`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Sent as `X-Audit-Log-Reason`
    pub reason: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            reason: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Successful REST response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// JSON body, `Null` for empty bodies
    pub body: Value,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| Error::Decode(e.to_string()))
    }
}
