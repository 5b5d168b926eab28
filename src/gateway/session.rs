use serde::Serialize;
use std::time::Duration;

/// Lifecycle of the streaming connection as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Connected,
    Closed,
}

/// Resumable session state. Owned by the connection and only mutated on its loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub session_id: Option<String>,
    /// Last dispatch sequence received
    pub sequence: Option<u64>,
    /// Gateway URL to use when resuming
    pub resume_url: Option<String>,
    pub heartbeat_interval: Option<Duration>,
}

impl Session {
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Forget the session so the next connection identifies from scratch.
    pub fn clear(&mut self) {
        *self = Session::default();
    }

    pub fn observe(&mut self, sequence: u64) {
        if self.sequence.map_or(true, |current| sequence > current) {
            self.sequence = Some(sequence);
        }
    }
}
