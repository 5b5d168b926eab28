// Streaming gateway connection with heartbeat, resume and bounded reconnect

mod connection;
pub mod protocol;
mod session;

pub use connection::{GatewayCloser, GatewayConnection};
pub use session::{ConnectionState, Session};

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;
use crate::event::Event;

/// Gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Fixed gateway URL. Fetched from `gateway/bot` when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: u8,
    /// Capability flags sent with IDENTIFY
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Consecutive failed RESUMEs before falling back to a fresh IDENTIFY
    #[serde(default = "default_max_resume_attempts")]
    pub max_resume_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// How long to wait for HELLO after the socket opens
    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,
}

fn default_api_version() -> u8 {
    10
}

fn default_intents() -> u64 {
    // GUILDS | GUILD_MEMBERS | GUILD_MESSAGES | MESSAGE_CONTENT
    33283
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_max_resume_attempts() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_handshake_timeout_seconds() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_version: default_api_version(),
            intents: default_intents(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_resume_attempts: default_max_resume_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            handshake_timeout_seconds: default_handshake_timeout_seconds(),
        }
    }
}

impl GatewayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

/// Receives decoded events from the connection. Must not block.
pub trait EventSink: Send + Sync {
    /// Returns false once the sink no longer accepts events.
    fn send_event(&self, event: Event) -> bool;
}

impl EventSink for Dispatcher {
    fn send_event(&self, event: Event) -> bool {
        self.dispatch(event)
    }
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn send_event(&self, event: Event) -> bool {
        self.send(event).is_ok()
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn send_event(&self, event: Event) -> bool {
        (**self).send_event(event)
    }
}
