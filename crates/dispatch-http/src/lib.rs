//! A single outbound HTTP call: timeout, response-time capture, and
//! structured-error lowering.
//!
//! Grounded on the teacher's `tower_resilience_executor::Executor` trait for
//! the async-boundary shape (an owned, `Clone + Send + Sync` handle to the
//! transport) and on PostHog's `WebhookJobError::from(&reqwest::Error)` for
//! the `reqwest::Error → structured condition` lowering idiom
//! (`is_timeout()`/`is_connect()`/catch-all).

pub mod error;

pub use error::HttpError;
pub use dispatch_classifier::TransportCondition;

use reqwest::Method;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single HTTP attempt to make.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HashMap::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Sent with every outbound call unless the caller already set the header.
const DEFAULT_CONTENT_TYPE: &str = "application/json";
const DEFAULT_USER_AGENT: &str = "POC-Excel-Formatter/1.0";

/// A terminated HTTP response — the executor's success path for any status
/// below 500, and the server-error error path's payload for 500+.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub response_description: Option<String>,
    pub duration: Duration,
}

/// Executes single HTTP attempts against a shared `reqwest::Client`.
///
/// Cheap to clone — `reqwest::Client` is internally an `Arc`.
#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Executes one attempt. `attempt` is zero-based and controls the
    /// per-attempt timeout: `10s + 5s * attempt`, capped at 30s.
    ///
    /// A transport failure or a status ≥ 500 surfaces as [`HttpError`];
    /// everything else (including 4xx) is returned so the pipeline's
    /// classifier can inspect it.
    pub async fn execute(&self, request: HttpRequest, attempt: u32) -> Result<HttpResponse, HttpError> {
        let timeout = per_attempt_timeout(attempt);
        let started = Instant::now();

        let mut builder = self.client.request(request.method, &request.url);
        if !has_header(&request.headers, "content-type") {
            builder = builder.header("Content-Type", DEFAULT_CONTENT_TYPE);
        }
        if !has_header(&request.headers, "user-agent") {
            builder = builder.header("User-Agent", DEFAULT_USER_AGENT);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let outcome = tokio::time::timeout(timeout, builder.send()).await;
        let duration = started.elapsed();

        let response = match outcome {
            Err(_) => {
                return Err(HttpError::Transport {
                    condition: TransportCondition::Timeout,
                    duration,
                    message: "request timed out".to_string(),
                });
            }
            Ok(Err(reqwest_err)) => return Err(lower_reqwest_error(&reqwest_err, duration)),
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let response_description = headers.get("response-description").cloned();
        let body = response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .unwrap_or_default();

        let resp = HttpResponse {
            status,
            headers,
            body,
            response_description,
            duration,
        };

        if status >= 500 {
            Err(HttpError::Server(resp))
        } else {
            Ok(resp)
        }
    }
}

fn has_header(headers: &HashMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

fn per_attempt_timeout(attempt: u32) -> Duration {
    let secs = 10u64 + 5 * attempt as u64;
    Duration::from_secs(secs.min(30))
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

fn lower_reqwest_error(error: &reqwest::Error, duration: Duration) -> HttpError {
    let condition = if error.is_timeout() {
        TransportCondition::Timeout
    } else if error.is_connect() {
        if error.to_string().to_lowercase().contains("dns") {
            TransportCondition::DnsNotFound
        } else {
            TransportCondition::ConnectionRefused
        }
    } else {
        TransportCondition::Other
    };

    HttpError::Transport {
        condition,
        duration,
        message: error.to_string(),
    }
}
