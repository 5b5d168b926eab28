// Error taxonomy for the bot core.
//
// Only connection-fatal and configuration errors terminate the process. Everything
// raised per event or per handler is isolated by the dispatcher and reported.

use std::time::Duration;

/// Core error type.
///
/// `Clone` so a single failed fetch can be handed to every caller that was
/// coalesced onto it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Credentials rejected by the gateway or the REST API. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Gateway rejected our protocol version, shard, or capability flags. Never retried.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Streaming connection dropped and could not be resumed or re-established.
    #[error("connection lost after {attempts} reconnect attempts: {reason}")]
    ConnectionLost { attempts: u32, reason: String },

    /// Remote rate-limit signal persisted past the automatic retry.
    #[error("rate limit exceeded for '{resource}' (retry after {retry_after:?})")]
    RateLimitExceeded {
        resource: String,
        retry_after: Duration,
    },

    /// Non-rate-limit remote failure (4xx, 5xx after retries, network).
    #[error("remote error on '{resource}': {message}")]
    Remote {
        resource: String,
        status: Option<u16>,
        message: String,
    },

    /// Failure raised inside an extension handler.
    #[error("handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("trigger '{trigger}' is already registered by extension '{existing}'")]
    DuplicateTrigger { trigger: String, existing: String },

    #[error("extension '{0}' is already registered")]
    DuplicateExtension(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// True for errors that must terminate the gateway loop without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::ProtocolMismatch(_))
    }

    /// Convenience for extensions returning a failure from a handler.
    pub fn handler(handler: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Handler {
            handler: handler.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Storage(format!("{:#}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Auth("bad token".into()).is_fatal());
        assert!(Error::ProtocolMismatch("4012".into()).is_fatal());
        assert!(!Error::ConnectionLost {
            attempts: 3,
            reason: "eof".into()
        }
        .is_fatal());
        assert!(!Error::Remote {
            resource: "channels/1".into(),
            status: Some(502),
            message: "bad gateway".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::DuplicateTrigger {
            trigger: "ping".into(),
            existing: "meta".into(),
        };
        assert_eq!(
            err.to_string(),
            "trigger 'ping' is already registered by extension 'meta'"
        );
    }
}
