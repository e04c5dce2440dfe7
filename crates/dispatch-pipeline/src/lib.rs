//! Per-record pipeline (C5): gates a single outbound record through the
//! circuit breaker, submits it to the bounded worker pool, and inside the
//! worker runs the retry loop against the HTTP executor and classifier,
//! persisting a trace and session stats once the loop settles.
//!
//! Composed directly rather than through a generic `Service` stack — the
//! way `tower_resilience_retry` and `tower_resilience_reconnect` compose a
//! fixed set of layers in the teacher — but the ordering itself (breaker
//! gate, pool submit, per-attempt retry loop honoring `Retry-After`,
//! terminal-trace persistence, stats bookkeeping) is the contract's own,
//! not the teacher's layer stack.

mod error;

pub use error::PipelineError;

use dispatch_breaker::CircuitBreaker;
use dispatch_classifier::{classify, ApiError, Category, RawOutcome, TransportCondition};
use dispatch_http::{HttpError, HttpExecutor, HttpRequest, HttpResponse};
use dispatch_metrics::MetricsAggregator;
use dispatch_pool::{Handler, WorkerPool, WorkerPoolConfig};
use dispatch_ratelimiter::RateLimiter;
use dispatch_store::ContextStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `attempts=3` from the default job-retry contract: one initial try plus
/// three retries.
const MAX_RETRIES: u32 = 3;
const TERMINAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One record to submit through the pipeline.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub session_id: String,
    pub job_id: String,
    pub request_id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// One HTTP attempt's outcome, kept for the terminal trace.
#[derive(Debug, Clone)]
pub struct AttemptTrace {
    pub attempt: u32,
    pub status: Option<u16>,
    pub duration: Duration,
    pub is_retry: bool,
}

/// What the retry loop ended with.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(HttpResponse),
    Failure(ApiError),
}

/// Everything learned about one record after the retry loop settled.
#[derive(Debug, Clone)]
pub struct RecordResult {
    pub request: RecordRequest,
    pub attempts: Vec<AttemptTrace>,
    pub outcome: Outcome,
}

/// The pool's generic error type is uninhabited: every retry-loop failure
/// is captured inside [`Outcome::Failure`] rather than surfaced as a pool
/// `Err`, so the handler closure never actually returns `Err`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineTaskError {}

/// Per-record pipeline: breaker gate, pool submission, and durable
/// persistence of the terminal trace and session stats. Cheap to clone.
#[derive(Clone)]
pub struct RecordPipeline {
    breaker: CircuitBreaker,
    pool: Arc<WorkerPool<RecordRequest, RecordResult, PipelineTaskError>>,
    store: Arc<dyn ContextStore>,
}

impl RecordPipeline {
    pub fn new(
        breaker: CircuitBreaker,
        pool_config: WorkerPoolConfig,
        rate_limiter: RateLimiter,
        http: HttpExecutor,
        metrics: MetricsAggregator,
        store: Arc<dyn ContextStore>,
    ) -> Self {
        let handler: Handler<RecordRequest, RecordResult, PipelineTaskError> =
            Arc::new(move |request: RecordRequest| {
                let rate_limiter = rate_limiter.clone();
                let http = http.clone();
                let metrics = metrics.clone();
                Box::pin(async move {
                    let (attempts, outcome) =
                        run_attempts(&http, &rate_limiter, &metrics, &request).await;
                    Ok(RecordResult {
                        request,
                        attempts,
                        outcome,
                    })
                })
            });

        Self {
            breaker,
            pool: Arc::new(WorkerPool::new(pool_config, handler)),
            store,
        }
    }

    /// Gates, submits, runs the retry loop, and persists the terminal
    /// trace and session stats — the full record sequence for one record.
    pub async fn process_record(&self, request: RecordRequest) -> Result<RecordResult, PipelineError> {
        self.breaker.gate().map_err(PipelineError::CircuitOpen)?;
        let result = self.pool.submit(request).await?;
        self.persist(&result).await?;
        Ok(result)
    }

    pub fn live_workers(&self) -> usize {
        self.pool.live_workers()
    }

    /// Drains the pool. Only tears it down once every clone of this
    /// pipeline has been dropped.
    pub async fn shutdown(self) {
        if let Ok(pool) = Arc::try_unwrap(self.pool) {
            pool.shutdown().await;
        }
    }

    async fn persist(&self, result: &RecordResult) -> Result<(), PipelineError> {
        let session_id = &result.request.session_id;
        let job_id = &result.request.job_id;
        let request_id = &result.request.request_id;
        let now = now_millis();

        let (status_field, is_success) = match &result.outcome {
            Outcome::Success(resp) => (resp.status, true),
            Outcome::Failure(err) => (err.status_code.unwrap_or(0), false),
        };

        let trace = serde_json::json!({
            "requestId": request_id,
            "url": result.request.url,
            "attempts": result.attempts.iter().map(|a| serde_json::json!({
                "attempt": a.attempt,
                "status": a.status,
                "durationMs": a.duration.as_millis() as u64,
                "isRetry": a.is_retry,
            })).collect::<Vec<_>>(),
            "success": is_success,
            "status": status_field,
        });

        self.store
            .set(&format!("apidata:{session_id}:{request_id}"), &trace.to_string())
            .await?;
        self.store
            .zadd(&format!("apirequests:{session_id}"), request_id, now as f64)
            .await?;

        let success_field = if is_success { "success" } else { "failure" };
        self.store
            .hincrby_many(
                &format!("apistats:{session_id}"),
                &[
                    ("total", 1),
                    (success_field, 1),
                    (&format!("status:{status_field}"), 1),
                ],
                None,
            )
            .await?;

        match &result.outcome {
            Outcome::Success(resp) => self.persist_success(session_id, request_id, resp).await?,
            Outcome::Failure(err) => {
                self.persist_failure(session_id, job_id, request_id, &result.request.url, now, err)
                    .await?
            }
        }

        Ok(())
    }

    async fn persist_success(
        &self,
        session_id: &str,
        request_id: &str,
        response: &HttpResponse,
    ) -> Result<(), PipelineError> {
        let payload = serde_json::json!({
            "sessionId": session_id,
            "requestId": request_id,
            "status": response.status,
        });
        self.store
            .set_ex(&format!("successResponse:{request_id}"), &payload.to_string(), TERMINAL_TTL)
            .await?;
        let index_key = format!("successResponses:{session_id}");
        self.store.lpush(&index_key, request_id).await?;
        self.store.expire(&index_key, TERMINAL_TTL).await?;
        Ok(())
    }

    async fn persist_failure(
        &self,
        session_id: &str,
        job_id: &str,
        request_id: &str,
        url: &str,
        ts: u128,
        err: &ApiError,
    ) -> Result<(), PipelineError> {
        if err.category == Category::RequiresUserAction {
            let error_id = format!("{session_id}:{job_id}:{ts}");
            let payload = serde_json::json!({
                "errorId": error_id,
                "sessionId": session_id,
                "jobId": job_id,
                "ts": ts,
                "requestId": request_id,
                "statusCode": err.status_code,
                "category": err.category.as_str(),
                "message": err.message,
                "userActionGuidance": err.user_action_guidance,
                "resolved": false,
            });
            self.store
                .set_ex(&format!("userActionError:{error_id}"), &payload.to_string(), TERMINAL_TTL)
                .await?;
            let index_key = format!("userActionErrors:{session_id}");
            self.store.lpush(&index_key, &error_id).await?;
            self.store.expire(&index_key, TERMINAL_TTL).await?;
        }

        if err.status_code == Some(429) || err.status_code.is_some_and(|s| s >= 500) {
            let field = format!("{url}:{}", err.status_code.unwrap_or(0));
            self.store.hincrby("metrics:recordErrors", &field, 1).await?;
            self.store.hset("metrics:recordErrors", "lastError", &err.message).await?;
            self.store
                .hset("metrics:recordErrors", "lastErrorDetails", err.category.as_str())
                .await?;
        }

        Ok(())
    }
}

/// Runs the retry loop for one record: up to `MAX_RETRIES` retries beyond
/// the initial attempt, honoring `Retry-After` on 429, never retrying a
/// `REQUIRES_USER_ACTION` classification, and recording every attempt into
/// the metrics aggregator.
async fn run_attempts(
    http: &HttpExecutor,
    rate_limiter: &RateLimiter,
    metrics: &MetricsAggregator,
    request: &RecordRequest,
) -> (Vec<AttemptTrace>, Outcome) {
    let mut traces = Vec::new();

    for attempt in 0..=MAX_RETRIES {
        let mut http_request = HttpRequest::post(request.url.clone(), request.body.clone());
        for (name, value) in &request.headers {
            http_request = http_request.header(name.clone(), value.clone());
        }

        let scheduled = rate_limiter.schedule(|| http.execute(http_request, attempt)).await;
        let is_last_attempt = attempt == MAX_RETRIES;

        let (trace, outcome) = match scheduled {
            Err(_queue_full) => {
                let trace = AttemptTrace {
                    attempt,
                    status: None,
                    duration: Duration::ZERO,
                    is_retry: attempt > 0,
                };
                let err = classify(RawOutcome::Transport(TransportCondition::Other));
                metrics.record_call(0, Duration::ZERO, &request.url, true);
                (trace, Err((err, None)))
            }
            Ok(Ok(response)) if response.status < 400 => {
                let trace = AttemptTrace {
                    attempt,
                    status: Some(response.status),
                    duration: response.duration,
                    is_retry: attempt > 0,
                };
                metrics.record_call(response.status, response.duration, &request.url, false);
                (trace, Ok(response))
            }
            Ok(Ok(response)) => {
                let trace = AttemptTrace {
                    attempt,
                    status: Some(response.status),
                    duration: response.duration,
                    is_retry: attempt > 0,
                };
                let retry_after = (response.status == 429)
                    .then(|| parse_retry_after(&response.headers))
                    .flatten();
                let classified = classify(RawOutcome::Response {
                    status: response.status,
                    headers: &response.headers,
                    body: &response.body,
                    response_description: response.response_description.as_deref(),
                });
                metrics.record_call(response.status, response.duration, &request.url, true);
                (trace, Err((classified, retry_after)))
            }
            Ok(Err(HttpError::Server(response))) => {
                let trace = AttemptTrace {
                    attempt,
                    status: Some(response.status),
                    duration: response.duration,
                    is_retry: attempt > 0,
                };
                let classified = classify(RawOutcome::Response {
                    status: response.status,
                    headers: &response.headers,
                    body: &response.body,
                    response_description: response.response_description.as_deref(),
                });
                metrics.record_call(response.status, response.duration, &request.url, true);
                (trace, Err((classified, None)))
            }
            Ok(Err(HttpError::Transport { condition, duration, .. })) => {
                let trace = AttemptTrace {
                    attempt,
                    status: None,
                    duration,
                    is_retry: attempt > 0,
                };
                let classified = classify(RawOutcome::Transport(condition));
                metrics.record_call(0, duration, &request.url, true);
                (trace, Err((classified, None)))
            }
        };

        traces.push(trace);

        match outcome {
            Ok(response) => return (traces, Outcome::Success(response)),
            Err((api_error, retry_after)) => {
                let can_retry_more =
                    !is_last_attempt && api_error.can_retry && !api_error.user_action_required;
                if !can_retry_more {
                    return (traces, Outcome::Failure(api_error));
                }
                let wait = retry_after.unwrap_or_else(|| Duration::from_secs(1u64 << attempt));
                tokio::time::sleep(wait).await;
            }
        }
    }

    unreachable!("the loop above always returns by the last attempt")
}

/// Parses a `Retry-After` header as either delay-seconds or an HTTP-date,
/// floored at one second.
fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    let value = headers.get("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs.max(1)));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let now = chrono::Utc::now();
    let delta = date.with_timezone(&chrono::Utc) - now;
    Some(Duration::from_secs(delta.num_seconds().max(1) as u64))
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_store::InMemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(breaker: CircuitBreaker, store: Arc<dyn ContextStore>) -> RecordPipeline {
        RecordPipeline::new(
            breaker,
            WorkerPoolConfig {
                size: 2,
                task_timeout: Duration::from_secs(5),
            },
            RateLimiter::new(Default::default()),
            HttpExecutor::new(),
            MetricsAggregator::new(),
            store,
        )
    }

    fn request(url: String) -> RecordRequest {
        RecordRequest {
            session_id: "sess-1".to_string(),
            job_id: "job-1".to_string(),
            request_id: "req-1".to_string(),
            url,
            headers: HashMap::new(),
            body: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn successful_record_persists_trace_stats_and_success_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(CircuitBreaker::default(), Arc::clone(&store));

        let result = pipeline
            .process_record(request(format!("{}/ok", server.uri())))
            .await
            .unwrap();

        assert!(matches!(result.outcome, Outcome::Success(_)));
        assert_eq!(result.attempts.len(), 1);

        assert!(store.get("apidata:sess-1:req-1").await.unwrap().is_some());
        assert!(store.get("successResponse:req-1").await.unwrap().is_some());
        let stats = store.hgetall("apistats:sess-1").await.unwrap();
        assert_eq!(stats.get("total").map(String::as_str), Some("1"));
        assert_eq!(stats.get("success").map(String::as_str), Some("1"));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn requires_user_action_never_retries_and_persists_user_action_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({"errors": ["bad field"]})))
            .mount(&server)
            .await;

        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(CircuitBreaker::default(), Arc::clone(&store));

        let result = pipeline
            .process_record(request(format!("{}/bad", server.uri())))
            .await
            .unwrap();

        assert!(matches!(result.outcome, Outcome::Failure(ref err) if err.category == Category::RequiresUserAction));
        assert_eq!(result.attempts.len(), 1, "REQUIRES_USER_ACTION must not retry");

        let error_ids = store
            .lrange("userActionErrors:sess-1", 0, -1)
            .await
            .unwrap();
        assert_eq!(error_ids.len(), 1);
        let error_id = &error_ids[0];
        assert!(error_id.starts_with("sess-1:job-1:"));
        let error_doc = store
            .get(&format!("userActionError:{error_id}"))
            .await
            .unwrap()
            .unwrap();
        assert!(error_doc.contains("\"jobId\":\"job-1\""));
        assert!(error_doc.contains(&format!("\"errorId\":\"{error_id}\"")));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn server_error_is_terminal_on_first_attempt_and_bumps_error_metric() {
        // SYSTEM_ERROR (5xx) is not in the retryable category set, so this
        // fails on the very first attempt rather than exhausting retries.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(CircuitBreaker::default(), Arc::clone(&store));

        let result = pipeline
            .process_record(request(format!("{}/flaky", server.uri())))
            .await
            .unwrap();

        assert!(matches!(result.outcome, Outcome::Failure(ref err) if err.category == Category::SystemError));
        assert_eq!(result.attempts.len(), 1);

        let errors = store.hgetall("metrics:recordErrors").await.unwrap();
        assert!(errors.keys().any(|k| k.contains(":503")));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn temporary_failure_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rate-limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rate-limited"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(CircuitBreaker::default(), Arc::clone(&store));

        let result = pipeline
            .process_record(request(format!("{}/rate-limited", server.uri())))
            .await
            .unwrap();

        assert!(matches!(result.outcome, Outcome::Success(_)));
        assert_eq!(result.attempts.len(), 2);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn open_breaker_rejects_before_touching_the_pool() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        breaker.trip("avgError > 0.30");
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(breaker, store);

        let err = pipeline
            .process_record(request("http://127.0.0.1:1/unused".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CircuitOpen(_)));

        pipeline.shutdown().await;
    }

    #[test]
    fn retry_after_parses_integer_seconds_and_floors_at_one() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "0".to_string());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(1)));

        headers.insert("retry-after".to_string(), "5".to_string());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(5)));
    }
}
