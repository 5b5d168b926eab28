// Logging setup and handler error reporting

use tracing::error;
use uuid::Uuid;

use crate::error::Error;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "herald=info,herald_bot=info";

/// Install the global fmt subscriber. Safe to call more than once; later calls are
/// ignored.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}

/// Where a handler failure happened.
#[derive(Debug, Clone)]
pub struct FailureSite {
    pub extension: String,
    /// Trigger name or event kind
    pub handler: String,
    pub sequence: Option<u64>,
}

/// Collaborator that receives handler failures caught by the dispatcher.
pub trait ErrorReporter: Send + Sync {
    /// Record a failure. Returns an id that can be quoted to users.
    fn report(&self, site: &FailureSite, error: &Error) -> Uuid;
}

/// Longest message body the platform accepts
const NOTICE_LIMIT: usize = 2000;

/// Chat reply for a failed command. Owners see the error itself; everyone
/// else only gets the id to quote.
pub fn error_notice(owner: bool, error_id: Uuid, error: &Error) -> String {
    if !owner {
        return format!(
            "An error has occurred! Ask the bot operator for help. (error `{}`)",
            error_id
        );
    }
    let detailed = format!(
        "An error has occurred! (error `{}`)\n```\n{}\n```",
        error_id, error
    );
    if detailed.chars().count() > NOTICE_LIMIT {
        format!(
            "An error has occurred and the details are too large to send back. (error `{}`)",
            error_id
        )
    } else {
        detailed
    }
}

/// Reports failures as `error!` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, site: &FailureSite, error: &Error) -> Uuid {
        let error_id = Uuid::now_v7();
        error!(
            error_id = %error_id,
            extension = %site.extension,
            handler = %site.handler,
            sequence = ?site.sequence,
            error = %error,
            "Handler failed"
        );
        error_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_reporter_returns_distinct_ids() {
        let reporter = TracingReporter;
        let site = FailureSite {
            extension: "meta".into(),
            handler: "ping".into(),
            sequence: Some(3),
        };
        let err = Error::handler("ping", "boom");

        let a = reporter.report(&site, &err);
        let b = reporter.report(&site, &err);
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 7);
    }

    #[test]
    fn test_error_notice_hides_details_from_non_owners() {
        let id = Uuid::now_v7();
        let err = Error::handler("stats", "database is locked");

        let public = error_notice(false, id, &err);
        assert!(public.contains("Ask the bot operator"));
        assert!(public.contains(&id.to_string()));
        assert!(!public.contains("database is locked"));

        let owner = error_notice(true, id, &err);
        assert!(owner.contains("database is locked"));
        assert!(owner.contains("```"));
    }

    #[test]
    fn test_oversized_owner_notice_is_replaced() {
        let id = Uuid::now_v7();
        let err = Error::handler("stats", "x".repeat(3000));
        let notice = error_notice(true, id, &err);
        assert!(notice.contains("too large"));
        assert!(notice.chars().count() < 200);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(DEFAULT_FILTER);
        init_tracing("debug");
    }
}
