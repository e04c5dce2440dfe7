//! Umbrella crate (analogous to the teacher's own `crates/tower-resilience`):
//! wires the rate limiter, worker pool, circuit breaker, classifier, metrics
//! aggregator, adaptive controller, record pipeline and batch worker into
//! one process, owning the process-wide singletons each component reads —
//! mirroring the teacher's pattern of a single `Arc<Config>` threaded
//! through a service stack, generalized from one `Arc` to one struct of
//! `Arc`-backed component handles.
//!
//! [`DispatchEngine::spawn`] starts the controller's tick loop (cadence
//! `DispatchConfig::cooldown`, default 30s): it samples OS load average and
//! free-memory ratio, the queue backlog, and the metrics aggregator's
//! current error fraction and response time, runs one [`AdaptiveController`]
//! tick, drives the rate limiter's own auto-tune off the same error-rate/
//! response-time signals, publishes both the metrics and rate limiter
//! snapshots to the durable store, and — whenever the tick changes the
//! concurrency limit — cancels and restarts the batch worker so its
//! dequeue semaphore picks up the new width.

use dispatch_breaker::CircuitBreaker;
pub use dispatch_core::DispatchConfig;
use dispatch_controller::{AdaptiveController, ConcurrencyAlgorithm, ControllerConfig, Signals};
use dispatch_http::HttpExecutor;
use dispatch_metrics::MetricsAggregator;
use dispatch_pipeline::RecordPipeline;
use dispatch_pool::{default_pool_size, WorkerPoolConfig};
use dispatch_queue::{JobQueue, JobStatus};
use dispatch_ratelimiter::{RateLimiter, RateLimiterSettings};
use dispatch_store::ContextStore;
use dispatch_worker::BatchWorker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the dispatch stack needs, wired once. Cheap to clone; clones
/// share every component's state.
#[derive(Clone)]
pub struct DispatchEngine {
    config: DispatchConfig,
    breaker: CircuitBreaker,
    metrics: MetricsAggregator,
    controller: AdaptiveController,
    rate_limiter: RateLimiter,
    pipeline: RecordPipeline,
    store: Arc<dyn ContextStore>,
    queue: Arc<dyn JobQueue>,
    worker_seq: Arc<AtomicU64>,
}

/// A running engine. Dropping this without calling [`EngineHandle::shutdown`]
/// leaves the tick loop and worker running detached.
pub struct EngineHandle {
    cancel: CancellationToken,
    tick_handle: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.tick_handle.await;
    }
}

impl DispatchEngine {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn ContextStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.cb_reset_timeout);
        let metrics = MetricsAggregator::new();
        let controller = AdaptiveController::new(ControllerConfig {
            min_concurrency: config.min_concurrency,
            max_concurrency: config.max_concurrency,
            cooldown: config.cooldown,
            cb_error_threshold: config.cb_error_threshold,
            cb_reset_timeout: config.cb_reset_timeout,
            history_length: config.history_length,
            trend_history_length: config.trend_history_length,
            prediction_update_interval: config.prediction_update_interval,
            ..ControllerConfig::default()
        });
        let pool_config = WorkerPoolConfig {
            size: default_pool_size(),
            task_timeout: config.pool_task_timeout,
        };
        let rate_limiter = RateLimiter::new(RateLimiterSettings::default());
        let pipeline = RecordPipeline::new(
            breaker.clone(),
            pool_config,
            rate_limiter.clone(),
            HttpExecutor::new(),
            metrics.clone(),
            Arc::clone(&store),
        );

        Self {
            config,
            breaker,
            metrics,
            controller,
            rate_limiter,
            pipeline,
            store,
            queue,
            worker_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pipeline(&self) -> &RecordPipeline {
        &self.pipeline
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    /// Starts the tick loop and the first batch worker, returning a handle
    /// that stops both on [`EngineHandle::shutdown`].
    pub fn spawn(self) -> EngineHandle {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let tick_handle = tokio::spawn(async move { self.run_loop(loop_cancel).await });
        EngineHandle {
            cancel,
            tick_handle,
        }
    }

    async fn run_loop(self, cancel: CancellationToken) {
        let mut system = sysinfo::System::new();
        system.refresh_memory();

        let (mut worker_handle, mut worker_cancel) = self.spawn_worker();
        let mut last_limit = self.controller.limit();
        let mut ticker = tokio::time::interval(self.config.cooldown);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.run_tick(&mut system).await;

            let limit = self.controller.limit();
            if limit != last_limit {
                worker_cancel.cancel();
                let _ = worker_handle.await;
                let (handle, token) = self.spawn_worker();
                worker_handle = handle;
                worker_cancel = token;
                last_limit = limit;
            }
        }

        worker_cancel.cancel();
        let _ = worker_handle.await;
    }

    fn spawn_worker(&self) -> (JoinHandle<()>, CancellationToken) {
        let id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let worker = BatchWorker::new(
            format!("worker-{id}"),
            Arc::clone(&self.queue),
            self.pipeline.clone(),
            Arc::clone(&self.store),
            self.controller.clone(),
        );
        let token = worker.cancellation_token();
        (tokio::spawn(worker.run()), token)
    }

    /// One controller tick: sample OS load average, free-memory ratio,
    /// queue backlog and metrics-derived error fraction/response time, run
    /// the controller, and publish the resulting state.
    async fn run_tick(&self, system: &mut sysinfo::System) {
        system.refresh_memory();
        let load = sysinfo::System::load_average();
        let mem_free_ratio = if system.total_memory() > 0 {
            1.0 - (system.used_memory() as f64 / system.total_memory() as f64)
        } else {
            1.0
        };

        let backlog = self
            .queue
            .get_job_count_by_types(&[JobStatus::Waiting, JobStatus::Delayed])
            .await
            .unwrap_or(0) as f64;

        let bucket = self.metrics.calls_last_minute();
        let total_calls = bucket.success + bucket.error;
        let error_fraction = if total_calls > 0 {
            bucket.error as f64 / total_calls as f64
        } else {
            0.0
        };

        let signals = Signals {
            cpu: load.one,
            mem: mem_free_ratio.max(0.0),
            error: error_fraction,
            backlog,
            response_time: self.metrics.avg_response_time(),
        };

        use chrono::Timelike;
        let hour = chrono::Utc::now().hour();
        let decision = self.controller.tick(signals, &self.breaker, hour);

        let avg_response_time = self.metrics.avg_response_time();
        self.rate_limiter.auto_tune(error_fraction, avg_response_time);

        if let Err(_err) = self.metrics.publish(self.store.as_ref()).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "failed to publish metrics snapshot");
        }

        self.persist_controller_state(&decision).await;
        self.persist_rate_limiter_state(error_fraction, avg_response_time)
            .await;
    }

    async fn persist_controller_state(&self, decision: &dispatch_controller::Decision) {
        let snapshot = self.breaker.snapshot();
        let breaker_json = serde_json::json!({
            "tripped": snapshot.tripped,
            "reason": snapshot.reason,
        });
        if let Err(_err) = self
            .store
            .set("metrics:circuitBreaker", &breaker_json.to_string())
            .await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "failed to persist circuit breaker snapshot");
        }

        let controller_json = serde_json::json!({
            "concurrency": self.controller.limit(),
            "decision": format!("{decision:?}"),
        });
        if let Err(_err) = self
            .store
            .set("metrics:controller", &controller_json.to_string())
            .await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "failed to persist controller snapshot");
        }
    }

    /// Publishes the limiter's tuned settings alongside the signals
    /// `auto_tune` just consumed, for observability.
    async fn persist_rate_limiter_state(&self, error_rate: f64, avg_response_time: std::time::Duration) {
        let settings = self.rate_limiter.settings_snapshot();
        let snapshot = serde_json::json!({
            "maxConcurrent": settings.max_concurrent,
            "minTime": settings.min_time.as_millis(),
            "errorRate": error_rate,
            "avgResponseTime": avg_response_time.as_millis(),
            "lastUpdated": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(_err) = self
            .store
            .set("metrics:rateLimiter", &snapshot.to_string())
            .await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "failed to persist rate limiter snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_queue::{InMemoryJobQueue, JobQueueOptions};
    use dispatch_store::InMemoryStore;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            cooldown: Duration::from_millis(30),
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn spawn_runs_tick_loop_and_processes_queued_jobs() {
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

        let engine = DispatchEngine::new(test_config(), Arc::clone(&store), Arc::clone(&queue));
        let handle = engine.spawn();

        let mut completed = false;
        for _ in 0..200 {
            if let Some(job) = queue.get_job(job_id).await.unwrap() {
                if job.status == dispatch_queue::JobStatus::Completed {
                    completed = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed, "job should complete within the polling window");

        // Let at least one more tick run after the job completes before
        // shutting down, so the controller snapshot has been persisted.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;
        assert!(store.get("metrics:controller").await.unwrap().is_some());
        assert!(store.get("metrics:rateLimiter").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn controller_and_pipeline_are_accessible_after_construction() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        let engine = DispatchEngine::new(test_config(), store, queue);
        assert_eq!(engine.controller().limit(), engine.controller().min_limit());
        assert_eq!(engine.pipeline().live_workers(), 0);
    }
}
