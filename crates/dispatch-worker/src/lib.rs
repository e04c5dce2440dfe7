//! Batch worker (C8): drains the job queue at width `C` — the adaptive
//! controller's current concurrency limit — running each job's records
//! through the record pipeline in fixed sub-batches of ten.
//!
//! The poll/dispatch loop (sleep-and-retry when the queue is empty, one
//! spawned task per concurrently-processed job, a shutdown signal checked
//! every iteration) is grounded on the retrieval pack's `CortexLM-dataforge`
//! worker pool (`scheduler/worker_pool.rs::Worker::run`), adapted from its
//! broadcast-channel shutdown signal to `tokio_util::sync::CancellationToken`
//! to match this workspace's own graceful-shutdown primitive — the same
//! token `dispatch-pool` uses. Per-job bookkeeping (validate, load session,
//! build auth headers, sub-batch through the pipeline, progress/ metrics
//! persistence, terminal `complete`/`fail`) follows PostHog's
//! `pgqueue::Job` completion lifecycle.

mod auth;
mod error;
mod session;
mod validate;

pub use auth::build_auth_headers;
pub use error::WorkerError;
pub use session::{Session, SessionAuth};
pub use validate::{validate_records, InputRecord, ValidationError};

use dispatch_controller::{AdaptiveController, ConcurrencyAlgorithm};
use dispatch_pipeline::{Outcome, PipelineError, RecordPipeline, RecordRequest, RecordResult};
use dispatch_queue::{Job, JobId, JobQueue};
use dispatch_store::ContextStore;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const SUB_BATCH_SIZE: usize = 10;
const PROGRESS_HISTORY_CAP: usize = 20;

#[derive(Debug, Deserialize)]
struct JobData {
    #[serde(rename = "sessionId")]
    session_id: String,
    records: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
struct JobProgress {
    success_count: u64,
    failure_count: u64,
    user_action_required_count: u64,
    total_processing_time: Duration,
    processed_count: u64,
    progress_history: VecDeque<u64>,
}

/// Drains the job queue at width `C`, running each job's records through
/// the record pipeline in sub-batches of ten. Cheap to clone; clones share
/// the same queue, pipeline, store, controller, and cancellation token.
#[derive(Clone)]
pub struct BatchWorker {
    worker_id: String,
    queue: Arc<dyn JobQueue>,
    pipeline: RecordPipeline,
    store: Arc<dyn ContextStore>,
    controller: AdaptiveController,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl BatchWorker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        pipeline: RecordPipeline,
        store: Arc<dyn ContextStore>,
        controller: AdaptiveController,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            pipeline,
            store,
            controller,
            poll_interval: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// A clone of this worker's cancellation token. Cancelling it (or
    /// calling [`BatchWorker::shutdown`] on any clone) triggers graceful
    /// drain: stop dequeuing, let in-flight jobs finish, then return.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the poll/dispatch loop until cancelled. `limit()` is sampled
    /// once at loop start as the max number of concurrently processed
    /// jobs; a controller resize takes effect the next time this loop is
    /// (re)started.
    pub async fn run(self) {
        let limit = self.controller.limit().max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("semaphore is never closed")
                }
            };

            match self.queue.reserve_next().await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    handles.push(tokio::spawn(async move {
                        worker.process_job(job).await;
                        drop(permit);
                    }));
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "failed to reserve next job");
                    drop(permit);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }

            handles.retain(|h| !h.is_finished());
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        #[cfg(feature = "tracing")]
        tracing::info!(job_id, "START");

        match self.run_job(&job).await {
            Ok(()) => {
                let _ = self.queue.complete(job_id).await;
                #[cfg(feature = "tracing")]
                tracing::info!(job_id, "COMPLETE");
            }
            Err(err) => {
                let message = err.to_string();
                #[cfg(feature = "tracing")]
                tracing::warn!(job_id, error = %message, "job failed");
                let _ = self.queue.fail(job_id, &message).await;
            }
        }
    }

    async fn run_job(&self, job: &Job) -> Result<(), WorkerError> {
        let data: JobData = serde_json::from_value(job.data.clone()).map_err(|_| {
            WorkerError::SessionMalformed("job data missing sessionId/records".to_string())
        })?;

        let records = validate_records(&data.records)?;

        let session_raw = self
            .store
            .get(&format!("session:{}", data.session_id))
            .await?
            .ok_or(WorkerError::SessionNotFound)?;
        let session: Session = serde_json::from_str(&session_raw)
            .map_err(|e| WorkerError::SessionMalformed(e.to_string()))?;
        let headers = build_auth_headers(&session.auth);

        let total = records.len();
        let concurrency = self.controller.limit().max(1);
        let mut progress = JobProgress::default();

        for chunk in records.chunks(SUB_BATCH_SIZE) {
            let started = Instant::now();
            let results = self
                .process_sub_batch(&session.api_url, &headers, &data.session_id, job.id, chunk)
                .await;
            let elapsed = started.elapsed();

            for result in &results {
                match result {
                    Ok(record_result) => match &record_result.outcome {
                        Outcome::Success(_) => progress.success_count += 1,
                        Outcome::Failure(err) if err.user_action_required => {
                            progress.failure_count += 1;
                            progress.user_action_required_count += 1;
                        }
                        Outcome::Failure(_) => progress.failure_count += 1,
                    },
                    Err(_pool_or_store_error) => progress.failure_count += 1,
                }
            }

            progress.total_processing_time += elapsed;
            progress.processed_count += chunk.len() as u64;
            self.report_progress(job.id, &mut progress, total, concurrency)
                .await?;
        }

        self.store
            .hincrby_many(
                &format!("metrics:{}", job.id),
                &[
                    ("successCount", progress.success_count as i64),
                    ("failureCount", progress.failure_count as i64),
                    ("totalRecords", total as i64),
                ],
                None,
            )
            .await?;
        self.store
            .hset(
                &format!("metrics:{}", job.id),
                "completedAt",
                &now_millis().to_string(),
            )
            .await?;

        Ok(())
    }

    /// Submits every record in the sub-batch concurrently and awaits all
    /// settled (`batchProcess`'s submit-all/await-all-settled contract),
    /// falling back to serial per-record processing if every submission in
    /// the batch failed at the pool level rather than with a classified
    /// per-record outcome — the pipeline's pool disaster fallback.
    async fn process_sub_batch(
        &self,
        api_url: &str,
        headers: &HashMap<String, String>,
        session_id: &str,
        job_id: JobId,
        chunk: &[InputRecord],
    ) -> Vec<Result<RecordResult, PipelineError>> {
        let build_request = |record: &InputRecord| RecordRequest {
            session_id: session_id.to_string(),
            job_id: job_id.to_string(),
            request_id: record.request_id.clone(),
            url: api_url.to_string(),
            headers: headers.clone(),
            body: record.body.clone(),
        };

        let futures = chunk
            .iter()
            .map(|record| self.pipeline.process_record(build_request(record)));
        let results = join_all(futures).await;

        let pool_disaster = !results.is_empty()
            && results
                .iter()
                .all(|r| matches!(r, Err(PipelineError::Pool(_))));

        if !pool_disaster {
            return results;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!("pool disaster detected, falling back to serial processing");

        let mut serial = Vec::with_capacity(chunk.len());
        for record in chunk {
            serial.push(self.pipeline.process_record(build_request(record)).await);
        }
        serial
    }

    async fn report_progress(
        &self,
        job_id: JobId,
        progress: &mut JobProgress,
        total: usize,
        concurrency: usize,
    ) -> Result<(), WorkerError> {
        let records_left = total.saturating_sub(progress.processed_count as usize);
        let avg_time_per_record = if progress.processed_count > 0 {
            progress.total_processing_time / progress.processed_count as u32
        } else {
            Duration::ZERO
        };
        let est_time_left_sec = (avg_time_per_record.as_millis() as u64)
            .saturating_mul(records_left as u64)
            .div_ceil(concurrency as u64)
            .div_ceil(1000);

        progress.progress_history.push_back(progress.processed_count);
        if progress.progress_history.len() > PROGRESS_HISTORY_CAP {
            progress.progress_history.pop_front();
        }

        let progress_value = serde_json::json!({
            "successCount": progress.success_count,
            "failureCount": progress.failure_count,
            "userActionRequiredCount": progress.user_action_required_count,
            "avgTimePerRecordMs": avg_time_per_record.as_millis() as u64,
            "estTimeLeftSec": est_time_left_sec,
            "processedCount": progress.processed_count,
            "totalRecords": total,
            "backlog": records_left,
            "progressHistory": progress.progress_history.iter().copied().collect::<Vec<_>>(),
        });
        self.queue.update_progress(job_id, progress_value).await?;

        let status = self.controller.status();
        let snapshot = serde_json::json!({
            "workerId": self.worker_id,
            "jobId": job_id,
            "currentConcurrency": concurrency,
            "successCount": progress.success_count,
            "failureCount": progress.failure_count,
            "total": total,
            "completed": progress.processed_count,
            "avgTimePerRecordMs": avg_time_per_record.as_millis() as u64,
            "estTimeLeftSec": est_time_left_sec,
            "backlog": records_left,
            "progressHistory": progress.progress_history.iter().copied().collect::<Vec<_>>(),
            "avgCpu": status.avg_cpu,
            "avgMem": status.avg_mem,
            "avgError": status.avg_error,
            "status": format!("{status:?}"),
            "timestamp": now_millis(),
        });
        self.store
            .set(
                &format!("worker:globalMetrics:{}", self.worker_id),
                &snapshot.to_string(),
            )
            .await?;

        Ok(())
    }
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
    use dispatch_breaker::CircuitBreaker;
    use dispatch_http::HttpExecutor;
    use dispatch_metrics::MetricsAggregator;
    use dispatch_pool::WorkerPoolConfig;
    use dispatch_queue::{InMemoryJobQueue, JobQueueOptions};
    use dispatch_ratelimiter::RateLimiter;
    use dispatch_store::InMemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(store: Arc<dyn ContextStore>) -> RecordPipeline {
        RecordPipeline::new(
            CircuitBreaker::default(),
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

    #[tokio::test]
    async fn happy_path_job_completes_with_full_success_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        store
            .set(
                "session:S1",
                &serde_json::json!({
                    "apiUrl": format!("{}/echo", server.uri()),
                    "auth": {"userId": "u1", "apiKey": "k1"},
                })
                .to_string(),
            )
            .await
            .unwrap();

        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        let job_id = queue
            .add(
                "batch",
                serde_json::json!({
                    "sessionId": "S1",
                    "records": [{"memberId": "M1", "requestId": "R1"}],
                }),
                JobQueueOptions::default(),
            )
            .await
            .unwrap();
        let job = queue.reserve_next().await.unwrap().unwrap();
        assert_eq!(job.id, job_id);

        let worker = BatchWorker::new(
            "worker-1",
            Arc::clone(&queue),
            pipeline(Arc::clone(&store)),
            Arc::clone(&store),
            AdaptiveController::new(Default::default()),
        );

        worker.run_job(&job).await.unwrap();

        let metrics_key = format!("metrics:{job_id}");
        let metrics = store.hgetall(&metrics_key).await.unwrap();
        assert_eq!(metrics.get("successCount").map(String::as_str), Some("1"));
        assert_eq!(metrics.get("failureCount").map(String::as_str), Some("0"));

        let global = store
            .get("worker:globalMetrics:worker-1")
            .await
            .unwrap()
            .unwrap();
        assert!(global.contains("\"successCount\":1"));
        for field in [
            "avgTimePerRecordMs",
            "estTimeLeftSec",
            "backlog",
            "progressHistory",
            "avgCpu",
            "avgMem",
            "avgError",
            "status",
            "timestamp",
        ] {
            assert!(global.contains(field), "missing field {field} in {global}");
        }
    }

    #[tokio::test]
    async fn missing_session_fails_the_job_with_no_config_found() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        let job_id = queue
            .add(
                "batch",
                serde_json::json!({
                    "sessionId": "missing",
                    "records": [{"memberId": "M1", "requestId": "R1"}],
                }),
                JobQueueOptions::default(),
            )
            .await
            .unwrap();
        let job = queue.reserve_next().await.unwrap().unwrap();

        let worker = BatchWorker::new(
            "worker-1",
            Arc::clone(&queue),
            pipeline(Arc::clone(&store)),
            store,
            AdaptiveController::new(Default::default()),
        );

        let err = worker.run_job(&job).await.unwrap_err();
        assert!(matches!(err, WorkerError::SessionNotFound));
        assert_eq!(err.to_string(), "No config found");
        let _ = job_id;
    }

    #[tokio::test]
    async fn invalid_records_fail_the_job_with_offending_indices() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        store
            .set(
                "session:S1",
                &serde_json::json!({"apiUrl": "http://unused", "auth": {"userId": "u", "apiKey": "k"}})
                    .to_string(),
            )
            .await
            .unwrap();

        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        queue
            .add(
                "batch",
                serde_json::json!({
                    "sessionId": "S1",
                    "records": [{"memberId": "M1"}],
                }),
                JobQueueOptions::default(),
            )
            .await
            .unwrap();
        let job = queue.reserve_next().await.unwrap().unwrap();

        let worker = BatchWorker::new(
            "worker-1",
            Arc::clone(&queue),
            pipeline(Arc::clone(&store)),
            store,
            AdaptiveController::new(Default::default()),
        );

        let err = worker.run_job(&job).await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation(ValidationError::MissingFields(ref idx)) if idx == &[0]));
    }

    #[tokio::test]
    async fn run_drains_a_queued_job_end_to_end_then_honors_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        store
            .set(
                "session:S1",
                &serde_json::json!({
                    "apiUrl": format!("{}/echo", server.uri()),
                    "auth": {"userId": "u1", "apiKey": "k1"},
                })
                .to_string(),
            )
            .await
            .unwrap();

        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        let job_id = queue
            .add(
                "batch",
                serde_json::json!({
                    "sessionId": "S1",
                    "records": [{"memberId": "M1", "requestId": "R1"}],
                }),
                JobQueueOptions::default(),
            )
            .await
            .unwrap();

        let worker = BatchWorker::new(
            "worker-1",
            Arc::clone(&queue),
            pipeline(Arc::clone(&store)),
            Arc::clone(&store),
            AdaptiveController::new(Default::default()),
        )
        .with_poll_interval(Duration::from_millis(10));

        let token = worker.cancellation_token();
        let handle = tokio::spawn(worker.run());

        let completed_job = loop {
            if let Some(job) = queue.get_job(job_id).await.unwrap() {
                if job.status == dispatch_queue::JobStatus::Completed {
                    break job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(completed_job.status, dispatch_queue::JobStatus::Completed);

        token.cancel();
        handle.await.unwrap();
    }
}
