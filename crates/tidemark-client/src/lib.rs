//! Outbound HTTP for Tidemark: rate-limited API client, token refresh,
//! offset/limit pagination.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tidemark_core::{RawRecord, SyncAccount, SyncError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "tidemark-client";

/// Seconds before expiry at which a token counts as stale.
pub const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

const RETRY_AFTER_CAP_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Global request budget shared by every worker that talks to the API.
///
/// `acquire()` suspends cooperatively until the next call is within
/// budget; the internal counter is guarded by an async mutex so the
/// ceiling holds across concurrent holders of one `Arc<TokenBucket>`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Budget of roughly `rps` requests per second with burst `rps`.
    pub fn per_second(rps: u32) -> Self {
        let rps = rps.max(1);
        Self::new(rps, Duration::from_millis((1000 / rps as u64).max(1)))
    }

    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Bearer-authenticated JSON GET client with retry/backoff.
///
/// Every attempt, including retries, passes through the shared rate
/// limiter before hitting the wire.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
    limiter: Arc<TokenBucket>,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig, limiter: Arc<TokenBucket>) -> anyhow::Result<Self> {
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
            limiter,
        })
    }

    pub async fn get_json(
        &self,
        account_id: &str,
        bearer: &str,
        path: &str,
        params: &[(String, String)],
    ) -> Result<JsonValue, SyncError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let span = info_span!("api_get", account_id, url = url.as_str());
        self.get_json_at(account_id, bearer, &url, params)
            .instrument(span)
            .await
    }

    async fn get_json_at(
        &self,
        account_id: &str,
        bearer: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<JsonValue, SyncError> {
        let mut last_error = String::new();

        for attempt in 0..=self.backoff.max_retries {
            self.limiter.acquire().await;

            let resp_result = self
                .client
                .get(url)
                .bearer_auth(bearer)
                .query(params)
                .send()
                .await;

            let resp = match resp_result {
                Ok(resp) => resp,
                Err(err) => {
                    last_error = err.to_string();
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SyncError::TransientApi(format!("{url}: {err}")));
                }
            };

            let status = resp.status();

            if status.is_success() {
                return resp
                    .json::<JsonValue>()
                    .await
                    .map_err(|e| SyncError::TransientApi(format!("decoding {url}: {e}")));
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SyncError::Auth {
                    account_id: account_id.to_string(),
                    reason: format!("http {status} for {url}"),
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after_secs(&resp)
                    .map(|s| Duration::from_secs(s.min(RETRY_AFTER_CAP_SECS)))
                    .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
                last_error = format!("429 Too Many Requests for {url}");
                if attempt < self.backoff.max_retries {
                    warn!(wait_ms = wait.as_millis() as u64, "rate limited, backing off");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                return Err(SyncError::RateLimited(last_error));
            }

            if classify_status(status) == RetryDisposition::Retryable
                && attempt < self.backoff.max_retries
            {
                last_error = format!("http {status} for {url}");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                continue;
            }

            return Err(SyncError::TransientApi(format!("http {status} for {url}")));
        }

        Err(SyncError::TransientApi(format!(
            "retries exhausted: {last_error}"
        )))
    }
}

fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Fresh credentials produced by the token provider. A refreshed token is
/// a new value; the registry's `SyncAccount` is never mutated.
#[derive(Debug, Clone)]
pub struct AccessCredentials {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Resolves current valid credentials for an account, refreshing via the
/// refresh-token exchange when the access token is expired or inside the
/// expiry buffer.
#[derive(Debug, Clone)]
pub struct TokenProvider {
    http: reqwest::Client,
    token_url: String,
    expiry_buffer_secs: i64,
}

impl TokenProvider {
    pub fn new(token_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building token client")?;
        Ok(Self {
            http,
            token_url: token_url.into(),
            expiry_buffer_secs: TOKEN_EXPIRY_BUFFER_SECS,
        })
    }

    /// Callers must treat `SyncError::Auth` from here as non-retryable for
    /// the account: skip it, log it, continue with other accounts.
    pub async fn credentials_for(
        &self,
        account: &SyncAccount,
        now: DateTime<Utc>,
    ) -> Result<AccessCredentials, SyncError> {
        let remaining = account.expires_at.signed_duration_since(now);
        if remaining.num_seconds() > self.expiry_buffer_secs {
            return Ok(AccessCredentials {
                access_token: account.access_token.clone(),
                expires_at: account.expires_at,
            });
        }

        let Some(refresh_token) = account.refresh_token.as_deref() else {
            return Err(SyncError::Auth {
                account_id: account.account_id.clone(),
                reason: "access token expired and no refresh token".to_string(),
            });
        };

        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| SyncError::Auth {
                account_id: account.account_id.clone(),
                reason: format!("refresh exchange failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Auth {
                account_id: account.account_id.clone(),
                reason: format!("refresh exchange rejected: http {status}: {body}"),
            });
        }

        let token: TokenResponse = resp.json().await.map_err(|e| SyncError::Auth {
            account_id: account.account_id.clone(),
            reason: format!("decoding token response: {e}"),
        })?;

        Ok(AccessCredentials {
            access_token: token.access_token,
            expires_at: now + chrono::Duration::seconds(token.expires_in.unwrap_or(21_600)),
        })
    }
}

/// Base query for one paginated listing endpoint.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub page_size: u32,
}

/// Walks an offset/limit endpoint to exhaustion, yielding one page of raw
/// records at a time. Accepts bare-array responses and
/// `{results, paging: {offset, limit, total}}` envelopes.
///
/// Restartable via `resume_from`, but holds no durable resume state;
/// the orchestrator owns the watermark.
pub struct Paginator<'a> {
    client: &'a ApiClient,
    account_id: String,
    bearer: String,
    query: PageQuery,
    offset: u64,
    exhausted: bool,
}

impl<'a> Paginator<'a> {
    pub fn new(
        client: &'a ApiClient,
        account_id: impl Into<String>,
        bearer: impl Into<String>,
        query: PageQuery,
    ) -> Self {
        Self {
            client,
            account_id: account_id.into(),
            bearer: bearer.into(),
            query,
            offset: 0,
            exhausted: false,
        }
    }

    pub fn resume_from(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// `Ok(None)` signals exhaustion. A transient error aborts the walk;
    /// pages already yielded are unaffected.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, SyncError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut params = self.query.params.clone();
        params.push(("offset".to_string(), self.offset.to_string()));
        params.push(("limit".to_string(), self.query.page_size.to_string()));

        let value = self
            .client
            .get_json(&self.account_id, &self.bearer, &self.query.path, &params)
            .await?;

        let (records, total) = parse_page(value)?;
        let page_len = records.len() as u64;
        self.offset += page_len;

        if page_len < self.query.page_size as u64 {
            self.exhausted = true;
        }
        if let Some(total) = total {
            if self.offset >= total {
                self.exhausted = true;
            }
        }

        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records))
    }
}

fn parse_page(value: JsonValue) -> Result<(Vec<RawRecord>, Option<u64>), SyncError> {
    match value {
        JsonValue::Array(records) => Ok((records, None)),
        JsonValue::Object(mut map) => {
            let results = match map.remove("results") {
                Some(JsonValue::Array(records)) => records,
                _ => {
                    return Err(SyncError::TransientApi(
                        "unexpected response shape: object without results array".to_string(),
                    ))
                }
            };
            let total = map
                .get("paging")
                .and_then(|p| p.get("total"))
                .and_then(JsonValue::as_u64);
            Ok((results, total))
        }
        other => Err(SyncError::TransientApi(format!(
            "unexpected response shape: {other}"
        ))),
    }
}
