//! Resilient call layer.
//!
//! Every outbound request goes through [`RobustHttp::call`], which classifies
//! the response status, retries transient failures with backoff (honouring
//! `Retry-After`), and runs a second phase of attempts after invalidating the
//! cached credential once.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::auth::{CredentialError, Credentials};
use crate::backoff::Backoff;

const SNIPPET_CHARS: usize = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const USER_AGENT: &str = concat!("drivecopy/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{method} {url} failed after retries (last status={status:?}, body={body:?})")]
    Exhausted {
        method: Method,
        url: Url,
        status: Option<StatusCode>,
        body: String,
    },
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: Url,
        status: StatusCode,
        body: String,
    },
    #[error("credential acquisition failed: {0}")]
    Credential(#[from] CredentialError),
    #[error("http client error: {0}")]
    Request(#[from] reqwest::Error),
}

impl TransportError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Exhausted { status, .. } => *status,
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    Retryable,
    Auth,
    Hard,
}

pub fn classify_status(status: StatusCode, extra_ok: &[StatusCode]) -> StatusClass {
    match status.as_u16() {
        200 | 201 | 202 | 204 | 206 => StatusClass::Ok,
        _ if extra_ok.contains(&status) => StatusClass::Ok,
        408 | 416 | 425 | 429 | 500 | 502 | 503 | 504 => StatusClass::Retryable,
        401 | 403 => StatusClass::Auth,
        _ => StatusClass::Hard,
    }
}

/// Retryable statuses that signal the server wants the caller to slow down.
pub fn is_throttle(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503 | 504)
}

/// Parses a `Retry-After` value given either as delta-seconds or as an
/// HTTP-date. Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && (0.0..=f64::from(u32::MAX)).contains(&seconds) {
            return Some(Duration::from_secs_f64(seconds));
        }
        return None;
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

fn retry_after_of(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_retry_after(value, SystemTime::now()))
}

/// Receives every throttling response seen by the call layer.
pub trait ThrottleObserver: Send + Sync {
    fn throttle_observed(&self, status: StatusCode, retry_after: Option<Duration>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoThrottleObserver;

impl ThrottleObserver for NoThrottleObserver {
    fn throttle_observed(&self, _status: StatusCode, _retry_after: Option<Duration>) {}
}

#[derive(Debug, Clone)]
pub struct CallRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    extra_ok: Vec<StatusCode>,
    max_attempts: u32,
    authenticated: bool,
}

impl CallRequest {
    pub fn new(method: Method, url: Url) -> Self {
        let max_attempts = match method {
            Method::POST | Method::PATCH => 8,
            Method::PUT => 10,
            _ => 6,
        };
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            extra_ok: Vec::new(),
            max_attempts,
            authenticated: true,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: Url) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body))
    }

    /// Treats `status` as a successful outcome for this call only.
    pub fn accept(mut self, status: StatusCode) -> Self {
        self.extra_ok.push(status);
        self
    }

    pub fn attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// For pre-authenticated URLs (upload sessions) that reject a bearer header.
    pub fn without_auth(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Debug, Clone)]
pub struct CallResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CallResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn snippet(&self) -> String {
        snippet(&self.body)
    }
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(SNIPPET_CHARS)
        .collect::<String>()
        .replace(['\r', '\n'], " ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Refreshed,
}

enum PhaseOutcome {
    Done(CallResponse),
    AuthRejected,
    Exhausted,
}

#[derive(Clone)]
pub struct RobustHttp {
    http: Client,
    credentials: Arc<dyn Credentials>,
    throttle: Arc<dyn ThrottleObserver>,
    backoff: Backoff,
}

impl RobustHttp {
    pub fn new(credentials: Arc<dyn Credentials>) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::with_client(http, credentials))
    }

    pub fn with_client(http: Client, credentials: Arc<dyn Credentials>) -> Self {
        Self {
            http,
            credentials,
            throttle: Arc::new(NoThrottleObserver),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_throttle_observer(mut self, throttle: Arc<dyn ThrottleObserver>) -> Self {
        self.throttle = throttle;
        self
    }

    pub async fn call(&self, request: &CallRequest) -> Result<CallResponse, TransportError> {
        let mut last_seen: Option<(StatusCode, String)> = None;

        match self
            .run_phase(request, Phase::Initial, &mut last_seen)
            .await?
        {
            PhaseOutcome::Done(response) => return Ok(response),
            PhaseOutcome::AuthRejected | PhaseOutcome::Exhausted => {}
        }

        if let Err(err) = self.credentials.invalidate().await {
            tracing::debug!(error = %err, "credential invalidation failed; retrying anyway");
        }

        match self
            .run_phase(request, Phase::Refreshed, &mut last_seen)
            .await?
        {
            PhaseOutcome::Done(response) => Ok(response),
            PhaseOutcome::AuthRejected | PhaseOutcome::Exhausted => {
                let (status, body) = match last_seen {
                    Some((status, body)) => (Some(status), body),
                    None => (None, String::new()),
                };
                Err(TransportError::Exhausted {
                    method: request.method.clone(),
                    url: request.url.clone(),
                    status,
                    body,
                })
            }
        }
    }

    async fn run_phase(
        &self,
        request: &CallRequest,
        phase: Phase,
        last_seen: &mut Option<(StatusCode, String)>,
    ) -> Result<PhaseOutcome, TransportError> {
        for attempt in 0..request.max_attempts {
            let response = match self.send_once(request).await {
                Ok(response) => response,
                Err(TransportError::Request(err)) => {
                    tracing::debug!(
                        method = %request.method,
                        url = %request.url,
                        attempt,
                        error = %err,
                        "request error"
                    );
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let status = response.status();
            let headers = response.headers().clone();
            match classify_status(status, &request.extra_ok) {
                StatusClass::Ok => match response.bytes().await {
                    Ok(body) => {
                        return Ok(PhaseOutcome::Done(CallResponse {
                            status,
                            headers,
                            body,
                        }));
                    }
                    Err(err) => {
                        tracing::debug!(url = %request.url, error = %err, "body read failed");
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                },
                StatusClass::Retryable => {
                    let retry_after = retry_after_of(&headers);
                    if is_throttle(status) {
                        self.throttle.throttle_observed(status, retry_after);
                    }
                    let body = response.bytes().await.unwrap_or_default();
                    *last_seen = Some((status, snippet(&body)));
                    tracing::debug!(
                        method = %request.method,
                        url = %request.url,
                        %status,
                        attempt,
                        ?retry_after,
                        "retryable status"
                    );
                    let delay = retry_after
                        .filter(|wait| !wait.is_zero())
                        .unwrap_or_else(|| self.backoff.delay(attempt));
                    tokio::time::sleep(delay).await;
                }
                StatusClass::Auth if phase == Phase::Initial => {
                    let body = response.bytes().await.unwrap_or_default();
                    *last_seen = Some((status, snippet(&body)));
                    return Ok(PhaseOutcome::AuthRejected);
                }
                StatusClass::Auth | StatusClass::Hard => {
                    let body = response.bytes().await.unwrap_or_default();
                    return Err(TransportError::Status {
                        method: request.method.clone(),
                        url: request.url.clone(),
                        status,
                        body: snippet(&body),
                    });
                }
            }
        }
        Ok(PhaseOutcome::Exhausted)
    }

    async fn send_once(&self, request: &CallRequest) -> Result<reqwest::Response, TransportError> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if request.authenticated {
            let token = self.credentials.bearer_token().await?;
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder.send().await?)
    }
}
