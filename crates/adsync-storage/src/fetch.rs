//! Report download client with per-network concurrency limits and retry/backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// How a report endpoint's HTTP status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// Credentials missing, expired or revoked. Never retried.
    AuthRejected,
    /// Throttling or upstream trouble; worth another attempt.
    Transient,
    Fatal,
}

pub fn classify_response(status: StatusCode) -> ResponseClass {
    match status.as_u16() {
        200..=299 => ResponseClass::Success,
        401 | 403 => ResponseClass::AuthRejected,
        408 | 429 | 500..=599 => ResponseClass::Transient,
        _ => ResponseClass::Fatal,
    }
}

/// Connection-level failures that a later attempt may not hit.
pub fn is_transient_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Seconds from a numeric `Retry-After` header; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Doubling pause between attempts, bounded by `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub first_pause: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_pause: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (0-based). A server-supplied
    /// `Retry-After` wins when present, still bounded by `ceiling`.
    pub fn pause(&self, retry: u32, server_hint: Option<Duration>) -> Duration {
        let doubled = 2u32
            .checked_pow(retry)
            .map_or(self.ceiling, |factor| self.first_pause.saturating_mul(factor));
        server_hint.unwrap_or(doubled).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_network_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            per_network_concurrency: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// One report download. `query` is appended as URL parameters.
#[derive(Debug, Clone)]
pub struct ReportRequest<'a> {
    pub network: &'a str,
    pub url: &'a str,
    pub bearer_token: Option<&'a str>,
    pub query: Vec<(&'a str, String)>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("credentials rejected with http status {status} for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

#[derive(Debug)]
pub struct ReportFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_network_limit: usize,
    per_network: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl ReportFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_network_limit: config.per_network_concurrency.max(1),
            per_network: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn network_semaphore(&self, network: &str) -> Arc<Semaphore> {
        let mut map = self.per_network.lock().await;
        map.entry(network.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_network_limit)))
            .clone()
    }

    /// GETs a report, retrying transient failures. 401/403 are returned
    /// immediately as `Unauthorized`.
    pub async fn fetch_report(
        &self,
        run_id: Uuid,
        request: &ReportRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_network = self.network_semaphore(request.network).await;
        let _network = per_network
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("report_fetch", %run_id, network = request.network, url = request.url);
        self.fetch_with_retries(request).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        request: &ReportRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            let mut builder = self.client.get(request.url).query(&request.query);
            if let Some(token) = request.bearer_token {
                builder = builder.bearer_auth(token);
            }

            let server_hint = match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    match classify_response(status) {
                        ResponseClass::Success => {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }
                        ResponseClass::AuthRejected => {
                            return Err(FetchError::Unauthorized {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                        ResponseClass::Transient if retry < self.retry.retries => {
                            warn!(status = status.as_u16(), retry, "report endpoint busy; retrying");
                            retry_after(resp.headers())
                        }
                        ResponseClass::Transient | ResponseClass::Fatal => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                    }
                }
                Err(err) if is_transient_transport_error(&err) && retry < self.retry.retries => {
                    warn!(error = %err, retry, "report request failed; retrying");
                    None
                }
                Err(err) => return Err(FetchError::Request(err)),
            };

            tokio::time::sleep(self.retry.pause(retry, server_hint)).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn pause_doubles_until_ceiling() {
        let policy = RetryPolicy {
            retries: 5,
            first_pause: Duration::from_millis(250),
            ceiling: Duration::from_secs(1),
        };

        assert_eq!(policy.pause(0, None), Duration::from_millis(250));
        assert_eq!(policy.pause(1, None), Duration::from_millis(500));
        assert_eq!(policy.pause(3, None), Duration::from_secs(1));
        assert_eq!(policy.pause(64, None), Duration::from_secs(1));
    }

    #[test]
    fn server_hint_overrides_but_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.pause(0, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert_eq!(policy.pause(0, Some(Duration::from_secs(3600))), policy.ceiling);
    }

    #[test]
    fn statuses_map_to_report_handling() {
        assert_eq!(classify_response(StatusCode::OK), ResponseClass::Success);
        assert_eq!(classify_response(StatusCode::UNAUTHORIZED), ResponseClass::AuthRejected);
        assert_eq!(classify_response(StatusCode::FORBIDDEN), ResponseClass::AuthRejected);
        assert_eq!(classify_response(StatusCode::TOO_MANY_REQUESTS), ResponseClass::Transient);
        assert_eq!(classify_response(StatusCode::SERVICE_UNAVAILABLE), ResponseClass::Transient);
        assert_eq!(classify_response(StatusCode::NOT_FOUND), ResponseClass::Fatal);
    }

    #[test]
    fn numeric_retry_after_is_read() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }
}
