use super::{HttpConfig, Request, Response};
use crate::backoff::Backoff;
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::rate_limit::{RateLimitHeaders, RateLimiter};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Rate-limit-aware REST pipeline.
///
/// Every call waits on its resource bucket before it is sent. Bucket state is fed back
/// from response headers.
/// - A 429 is retried once automatically. A second 429 surfaces as `RateLimitExceeded`.
/// - 5xx and network failures are retried with capped exponential backoff up to
///   `max_attempts` total attempts.
pub struct RequestPipeline {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    config: HttpConfig,
    authorization: String,
}

/// What to do with a response that did not succeed.
enum Outcome {
    Done(Response),
    RateLimited {
        retry_after: Duration,
        global: bool,
    },
    Retryable(Error),
    Failed(Error),
}

impl RequestPipeline {
    pub fn new(config: HttpConfig, credentials: &Credentials) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            config.default_budget,
            config.default_window(),
        ));
        Self::with_limiter(config, credentials, limiter)
    }

    /// Build on an existing limiter (shared between pipelines or inspected by tests).
    pub fn with_limiter(
        config: HttpConfig,
        credentials: &Credentials,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            limiter,
            config,
            authorization: credentials.authorization(),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Submit `request` against the bucket for `resource_key`.
    pub async fn submit(&self, resource_key: &str, request: Request) -> Result<Response> {
        let backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            self.limiter.acquire(resource_key).await;
            attempts += 1;

            debug!(
                resource = %resource_key,
                method = %request.method,
                path = %request.path,
                attempt = attempts,
                "Sending request"
            );

            let outcome = match self.send_once(&request).await {
                Ok(response) => self.classify(resource_key, response).await,
                Err(e) => Outcome::Retryable(Error::Remote {
                    resource: resource_key.to_string(),
                    status: None,
                    message: e.to_string(),
                }),
            };

            match outcome {
                Outcome::Done(response) => return Ok(response),
                Outcome::Failed(err) => return Err(err),
                Outcome::RateLimited {
                    retry_after,
                    global,
                } => {
                    if global {
                        self.limiter.pause_all(retry_after);
                    } else {
                        self.limiter.penalize(resource_key, retry_after).await;
                    }

                    if rate_limit_retries >= 1 {
                        warn!(resource = %resource_key, "Rate limited again after retry");
                        return Err(Error::RateLimitExceeded {
                            resource: resource_key.to_string(),
                            retry_after,
                        });
                    }
                    rate_limit_retries += 1;
                    // Rate-limit retries do not count against the failure budget
                    attempts -= 1;
                    warn!(
                        resource = %resource_key,
                        retry_after_ms = retry_after.as_millis() as u64,
                        global = global,
                        "Rate limited, retrying once"
                    );
                }
                Outcome::Retryable(err) => {
                    if attempts >= max_attempts {
                        warn!(resource = %resource_key, attempts = attempts, error = %err, "Giving up on request");
                        return Err(err);
                    }
                    let delay = backoff.delay(attempts);
                    warn!(
                        resource = %resource_key,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Request failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(&self, request: &Request) -> reqwest::Result<reqwest::Response> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header("Authorization", &self.authorization);
        if let Some(reason) = &request.reason {
            builder = builder.header("X-Audit-Log-Reason", reason);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await
    }

    async fn classify(&self, resource_key: &str, response: reqwest::Response) -> Outcome {
        let status = response.status();
        let info = RateLimitHeaders::from_headers(response.headers());
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 429 {
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let retry_after = body
                .get("retry_after")
                .and_then(Value::as_f64)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .or(info.retry_after)
                .or(info.reset_after)
                .unwrap_or(Duration::from_secs(1));
            let global = info.global
                || body.get("global").and_then(Value::as_bool).unwrap_or(false);
            return Outcome::RateLimited {
                retry_after,
                global,
            };
        }

        if info.has_budget_info() {
            self.limiter.update(resource_key, &info).await;
        }

        let remote = |message: String| Error::Remote {
            resource: resource_key.to_string(),
            status: Some(status.as_u16()),
            message,
        };

        if status.is_success() {
            let body = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            Outcome::Done(Response {
                status: status.as_u16(),
                body,
            })
        } else if status.is_server_error() {
            Outcome::Retryable(remote(error_message(&text, status)))
        } else if status.as_u16() == 401 {
            Outcome::Failed(Error::Auth(format!(
                "{} rejected credentials: {}",
                resource_key,
                error_message(&text, status)
            )))
        } else {
            Outcome::Failed(remote(error_message(&text, status)))
        }
    }
}

fn error_message(text: &str, status: reqwest::StatusCode) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status))
}
