//! Shared HTTP client with pacing and retry.

use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use prospector_shared::{ApiConfig, ProspectorError, Result, ScraperConfig};

/// User-Agent string for all outbound requests.
pub const USER_AGENT: &str = concat!("Prospector/", env!("CARGO_PKG_VERSION"));

/// Retry and pacing knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Base delay; attempt `n` waits `delay * (n + 1)`, doubled on 429.
    pub delay: Duration,
    /// Minimum gap between the start of two requests.
    pub min_interval: Duration,
}

impl RetryPolicy {
    /// Single attempt, no pacing.
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
            min_interval: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32, status: Option<StatusCode>) -> Duration {
        let factor = if status == Some(StatusCode::TOO_MANY_REQUESTS) {
            2
        } else {
            1
        };
        self.delay * factor * (attempt + 1)
    }
}

impl From<&ApiConfig> for RetryPolicy {
    fn from(config: &ApiConfig) -> Self {
        Self {
            retries: config.retry_attempts,
            delay: Duration::from_millis(config.retry_delay_ms),
            min_interval: Duration::from_millis(config.rate_limit_ms),
        }
    }
}

impl From<&ScraperConfig> for RetryPolicy {
    fn from(config: &ScraperConfig) -> Self {
        Self {
            retries: config.retry_attempts,
            delay: Duration::from_millis(config.retry_delay_ms),
            min_interval: Duration::ZERO,
        }
    }
}

/// reqwest client that paces requests and retries transient failures.
///
/// Timeouts, connection errors, 429 and 5xx are retried; any other 4xx is
/// returned immediately. 404 maps to `NotFound`, everything else that fails
/// to `ProviderUnavailable`.
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
    last_request: Mutex<Option<Instant>>,
}

impl HttpClient {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| ProspectorError::unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            policy,
            last_request: Mutex::new(None),
        })
    }

    /// The underlying client, for one-off requests outside the retry loop.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn pace(&self) {
        if self.policy.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.policy.min_interval {
                tokio::time::sleep(self.policy.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Send the request built by `build`, retrying per the policy.
    /// Returns the first successful response.
    pub async fn send<F>(&self, what: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut last_err = ProspectorError::unavailable(format!("{what}: no attempt made"));

        for attempt in 0..=self.policy.retries {
            self.pace().await;
            debug!(what, attempt = attempt + 1, "sending request");

            let (err, status) = match build(&self.client).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Err(ProspectorError::not_found(format!("{what}: HTTP {status}")));
                    }
                    let err = ProspectorError::unavailable(format!("{what}: HTTP {status}"));
                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        return Err(err);
                    }
                    (err, Some(status))
                }
                Err(e) if e.is_builder() => {
                    return Err(ProspectorError::validation(format!("{what}: {e}")));
                }
                Err(e) => (ProspectorError::unavailable(format!("{what}: {e}")), None),
            };

            warn!(what, attempt = attempt + 1, error = %err, "request failed");
            last_err = err;
            if attempt < self.policy.retries {
                tokio::time::sleep(self.policy.backoff(attempt, status)).await;
            }
        }

        Err(last_err)
    }

    /// `send`, then decode the body as JSON. A malformed body is a
    /// validation failure and is not retried.
    pub async fn send_json<T, F>(&self, what: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let body = self.send_text(what, build).await?;
        serde_json::from_str(&body)
            .map_err(|e| ProspectorError::validation(format!("{what}: invalid JSON: {e}")))
    }

    /// `send`, then read the body as text.
    pub async fn send_text<F>(&self, what: &str, build: F) -> Result<String>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.send(what, build)
            .await?
            .text()
            .await
            .map_err(|e| ProspectorError::unavailable(format!("{what}: failed to read body: {e}")))
    }
}
