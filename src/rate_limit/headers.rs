use reqwest::header::HeaderMap;
use std::time::Duration;

/// Rate-limit information carried on a REST response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parse `X-RateLimit-*` and `Retry-After` headers. Missing or malformed values are `None`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        Self {
            limit: get("x-ratelimit-limit").and_then(|v| v.parse().ok()),
            remaining: get("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_after: get("x-ratelimit-reset-after").and_then(parse_seconds),
            bucket: get("x-ratelimit-bucket").map(str::to_string),
            global: get("x-ratelimit-global")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            retry_after: get("retry-after").and_then(parse_seconds),
        }
    }

    /// True if the response carried any bucket information worth applying.
    pub fn has_budget_info(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some() || self.reset_after.is_some()
    }
}

/// Seconds as integer or float ("1", "0.250").
pub(crate) fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parses_full_header_set() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4"));
        headers.insert("x-ratelimit-reset-after", HeaderValue::from_static("1.5"));
        headers.insert("x-ratelimit-bucket", HeaderValue::from_static("abcd1234"));

        let info = RateLimitHeaders::from_headers(&headers);
        assert_eq!(info.limit, Some(5));
        assert_eq!(info.remaining, Some(4));
        assert_eq!(info.reset_after, Some(Duration::from_millis(1500)));
        assert_eq!(info.bucket.as_deref(), Some("abcd1234"));
        assert!(!info.global);
        assert!(info.has_budget_info());
    }

    #[test]
    fn test_global_and_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-global", HeaderValue::from_static("true"));
        headers.insert("retry-after", HeaderValue::from_static("3"));

        let info = RateLimitHeaders::from_headers(&headers);
        assert!(info.global);
        assert_eq!(info.retry_after, Some(Duration::from_secs(3)));
        assert!(!info.has_budget_info());
    }

    #[test]
    fn test_malformed_values_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("-1"));
        headers.insert("x-ratelimit-reset-after", HeaderValue::from_static("soon"));

        let info = RateLimitHeaders::from_headers(&headers);
        assert_eq!(info, RateLimitHeaders::default());
        assert_eq!(parse_seconds("-2"), None);
    }
}
