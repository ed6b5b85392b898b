//! An HTTP client that posts JSON requests to the flag service.
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};

use crate::api::ApiError;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Configuration for [`TransportClient`].
#[derive(Debug, Clone)]
pub struct TransportClientConfig {
    /// Base URL all endpoint paths are appended to.
    pub base_url: String,
    /// Policy applied to retryable failures (5xx responses and request timeouts).
    pub retry_policy: RetryPolicy,
    /// Timeout for a single request attempt.
    pub request_timeout: Duration,
}

impl TransportClientConfig {
    /// Default value for [`TransportClientConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a configuration for `base_url` with no retries and the default timeout.
    pub fn new(base_url: impl Into<String>) -> TransportClientConfig {
        TransportClientConfig {
            base_url: base_url.into(),
            retry_policy: RetryPolicy::NoRetry,
            request_timeout: TransportClientConfig::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Update the retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> TransportClientConfig {
        self.retry_policy = retry_policy;
        self
    }

    /// Update the per-attempt request timeout.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> TransportClientConfig {
        self.request_timeout = request_timeout;
        self
    }
}

/// A client that issues single logical POST request/response cycles against the flag service.
///
/// One logical call may translate into several request attempts: server-class errors (5xx) and
/// request timeouts are retried according to the configured [`RetryPolicy`], with a fresh attempt
/// counter per call. Backoff sleeps never block other concurrent callers.
pub struct TransportClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base_url: String,
    retry_policy: RetryPolicy,
}

impl TransportClient {
    /// Create a new client from `config`.
    pub fn new(config: TransportClientConfig) -> Result<TransportClient> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(TransportClient {
            client,
            base_url: config.base_url,
            retry_policy: config.retry_policy,
        })
    }

    /// POST `request` to `path` (relative to the base URL) and decode the response.
    ///
    /// # Errors
    ///
    /// - [`Error::EncodingFailed`] if the request body cannot be serialized.
    /// - [`Error::RequestFailed`] for non-200 responses, carrying the decoded error body when the
    ///   server sent one.
    /// - [`Error::InvalidResponse`] if the transport layer produced no parseable HTTP response.
    pub async fn post<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        // Endpoint paths contain a colon (`flags:apply`), which Url::join would read as a URL
        // scheme, so the full URL is assembled textually first.
        let url = Url::parse(&format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path
        ))
        .map_err(Error::InvalidBaseUrl)?;
        let body = serde_json::to_vec(request)?;

        let mut attempt = 0;
        loop {
            match self.execute(&url, &body).await {
                Ok(response) => return Ok(response),
                Err(err) if is_retryable(&err) => match self.retry_policy.next_delay(attempt) {
                    Some(delay) => {
                        attempt += 1;
                        log::debug!(target: "beacon", "retrying {url} in {delay:?} after: {err}");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute<Resp>(&self, url: &Url, body: &[u8]) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        Err(Error::RequestFailed {
            status,
            detail: Some(decode_error_body(status, text)),
        })
    }
}

/// Decode the structured error body, falling back to an error synthesized from the raw status and
/// body text.
fn decode_error_body(status: StatusCode, text: String) -> ApiError {
    serde_json::from_str(&text).unwrap_or_else(|_| ApiError {
        code: status.as_u16().into(),
        message: text,
        details: vec![],
    })
}

fn is_retryable(error: &Error) -> bool {
    match error {
        Error::RequestFailed { status, .. } => status.is_server_error(),
        Error::InvalidResponse(err) => err.is_timeout(),
        _ => false,
    }
}
