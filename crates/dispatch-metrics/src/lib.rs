//! In-process rolling-window metrics aggregator (C6): response-time and
//! status-code history for the rate limiter tuner and adaptive controller,
//! per-endpoint latency patterns, and a local+durable error-timestamp
//! window feeding `get_api_error_rate`.
//!
//! Generalizes the teacher's `EventListeners`/rolling-window idiom
//! (`tower-resilience-core`'s event fan-out plus each pattern's own
//! count/time sliding window in `tower-resilience-circuitbreaker`) into a
//! single `Arc<Mutex<...>>`-guarded aggregator that every record pipeline
//! invocation reports into and the controller reads every tick, with a
//! `publish` method that snapshots it to the durable store the way
//! `tower-resilience-circuitbreaker`'s metrics feature snapshots to
//! Prometheus gauges.

pub mod normalize;

pub use normalize::normalize_url_pattern;

use dispatch_store::ContextStore;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RESPONSE_TIME_WINDOW: usize = 20;
const MINUTE_WINDOW: usize = 60;
const ENDPOINT_SAMPLE_WINDOW: usize = 10;
const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);
const DURABLE_ERROR_TIMESTAMPS_CAP: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct MinuteBucket {
    pub success: u64,
    pub error: u64,
    pub total_duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    pub avg_time: Duration,
    pub calls: u64,
    pub last_updated: Option<Instant>,
    samples: VecDeque<Duration>,
}

impl EndpointStats {
    fn record(&mut self, duration: Duration) {
        self.samples.push_back(duration);
        if self.samples.len() > ENDPOINT_SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.calls += 1;
        self.last_updated = Some(Instant::now());
        let total: Duration = self.samples.iter().sum();
        self.avg_time = total / self.samples.len() as u32;
    }
}

struct State {
    response_times: VecDeque<Duration>,
    status_code_counts: HashMap<u16, u64>,
    calls_by_minute: HashMap<i64, MinuteBucket>,
    endpoint_patterns: HashMap<String, EndpointStats>,
    error_timestamps: VecDeque<Instant>,
}

impl State {
    fn new() -> Self {
        Self {
            response_times: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
            status_code_counts: HashMap::new(),
            calls_by_minute: HashMap::new(),
            endpoint_patterns: HashMap::new(),
            error_timestamps: VecDeque::new(),
        }
    }

    fn minute_bucket(now: Instant) -> i64 {
        // Bucketed on process-relative seconds; only the relative distance
        // between buckets (for the 60-entry trim) matters here.
        (now.elapsed().as_secs() / 60) as i64
    }
}

/// Rolling-window metrics aggregator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MetricsAggregator {
    state: std::sync::Arc<Mutex<State>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            state: std::sync::Arc::new(Mutex::new(State::new())),
        }
    }

    /// Records one completed HTTP attempt. `url` is normalized into its
    /// pattern before being used as the endpoint key.
    pub fn record_call(&self, status: u16, duration: Duration, url: &str, is_error: bool) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        state.response_times.push_back(duration);
        if state.response_times.len() > RESPONSE_TIME_WINDOW {
            state.response_times.pop_front();
        }

        *state.status_code_counts.entry(status).or_insert(0) += 1;

        let bucket_key = State::minute_bucket(now);
        let bucket = state.calls_by_minute.entry(bucket_key).or_default();
        if is_error {
            bucket.error += 1;
        } else {
            bucket.success += 1;
        }
        bucket.total_duration += duration;
        if state.calls_by_minute.len() > MINUTE_WINDOW {
            if let Some(&oldest) = state.calls_by_minute.keys().min() {
                state.calls_by_minute.remove(&oldest);
            }
        }

        let pattern = normalize_url_pattern(url);
        state
            .endpoint_patterns
            .entry(pattern)
            .or_default()
            .record(duration);

        if is_error {
            state.error_timestamps.push_back(now);
        }
        while state
            .error_timestamps
            .front()
            .is_some_and(|t| t.elapsed() > ERROR_WINDOW)
        {
            state.error_timestamps.pop_front();
        }
    }

    pub fn avg_response_time(&self) -> Duration {
        let state = self.state.lock().unwrap();
        if state.response_times.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = state.response_times.iter().sum();
        total / state.response_times.len() as u32
    }

    pub fn status_code_counts(&self) -> HashMap<u16, u64> {
        self.state.lock().unwrap().status_code_counts.clone()
    }

    pub fn calls_last_minute(&self) -> MinuteBucket {
        let state = self.state.lock().unwrap();
        let current = State::minute_bucket(Instant::now());
        state.calls_by_minute.get(&current).cloned().unwrap_or_default()
    }

    pub fn endpoint_stats(&self, pattern: &str) -> Option<EndpointStats> {
        self.state.lock().unwrap().endpoint_patterns.get(pattern).cloned()
    }

    /// Errors per minute over the trailing 5-minute local window, the
    /// `avgError` signal the adaptive controller reads each tick.
    pub fn get_api_error_rate(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        while state
            .error_timestamps
            .front()
            .is_some_and(|t| t.elapsed() > ERROR_WINDOW)
        {
            state.error_timestamps.pop_front();
        }
        let count = state.error_timestamps.len() as f64;
        count / (ERROR_WINDOW.as_secs_f64() / 60.0)
    }

    /// Snapshots in-memory state to the durable store: `metrics:apiPerformance`,
    /// `metrics:endpoints`, and `metrics:errorTimestamps` (unioned with the
    /// already-durable list, trimmed to the last 100).
    pub async fn publish(
        &self,
        store: &dyn ContextStore,
    ) -> Result<(), dispatch_store::StoreError> {
        let (avg_response_time, calls, status_codes, endpoints, local_errors) = {
            let state = self.state.lock().unwrap();
            let current = State::minute_bucket(Instant::now());
            let calls = state.calls_by_minute.get(&current).cloned().unwrap_or_default();
            let avg = if state.response_times.is_empty() {
                Duration::ZERO
            } else {
                state.response_times.iter().sum::<Duration>() / state.response_times.len() as u32
            };
            (
                avg,
                calls,
                state.status_code_counts.clone(),
                state.endpoint_patterns.clone(),
                state.error_timestamps.len(),
            )
        };

        store
            .hincrby_many(
                "metrics:apiPerformance",
                &[
                    ("callsLastMinute", (calls.success + calls.error) as i64),
                    ("avgResponseTimeMs", avg_response_time.as_millis() as i64),
                ],
                None,
            )
            .await?;

        for code in status_codes.keys() {
            store
                .hset(
                    "metrics:apiPerformance",
                    &format!("statusCode:{code}"),
                    &status_codes[code].to_string(),
                )
                .await?;
        }

        for (pattern, stats) in endpoints {
            let json = format!(
                "{{\"avgTime\":{},\"calls\":{}}}",
                stats.avg_time.as_millis(),
                stats.calls
            );
            store.hset("metrics:endpoints", &pattern, &json).await?;
        }

        for _ in 0..local_errors {
            let now_ms = Instant::now().elapsed().as_millis().to_string();
            store.lpush("metrics:errorTimestamps", &now_ms).await?;
        }
        store.ltrim("metrics:errorTimestamps", 0, (DURABLE_ERROR_TIMESTAMPS_CAP as isize) - 1).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_store::InMemoryStore;

    #[test]
    fn response_times_cap_at_twenty() {
        let metrics = MetricsAggregator::new();
        for _ in 0..30 {
            metrics.record_call(200, Duration::from_millis(5), "/api/x", false);
        }
        assert_eq!(
            metrics.state.lock().unwrap().response_times.len(),
            RESPONSE_TIME_WINDOW
        );
    }

    #[test]
    fn status_code_counts_accumulate() {
        let metrics = MetricsAggregator::new();
        metrics.record_call(200, Duration::from_millis(5), "/x", false);
        metrics.record_call(200, Duration::from_millis(5), "/x", false);
        metrics.record_call(500, Duration::from_millis(5), "/x", true);
        let counts = metrics.status_code_counts();
        assert_eq!(counts[&200], 2);
        assert_eq!(counts[&500], 1);
    }

    #[test]
    fn error_rate_counts_errors_per_minute_over_five_minutes() {
        let metrics = MetricsAggregator::new();
        for _ in 0..10 {
            metrics.record_call(500, Duration::from_millis(5), "/x", true);
        }
        // 10 errors over a 5-minute window => 2/min
        assert_eq!(metrics.get_api_error_rate(), 2.0);
    }

    #[test]
    fn endpoint_patterns_average_the_last_ten_samples() {
        let metrics = MetricsAggregator::new();
        for i in 0..15u64 {
            metrics.record_call(200, Duration::from_millis(i * 10), "/members/123/x", false);
        }
        let stats = metrics.endpoint_stats("/members/:id/x").unwrap();
        assert_eq!(stats.calls, 15);
    }

    #[tokio::test]
    async fn publish_writes_durable_keys() {
        let metrics = MetricsAggregator::new();
        metrics.record_call(200, Duration::from_millis(10), "/x", false);
        metrics.record_call(500, Duration::from_millis(10), "/x", true);
        let store = InMemoryStore::new();
        metrics.publish(&store).await.unwrap();
        let perf = store.hgetall("metrics:apiPerformance").await.unwrap();
        assert!(perf.contains_key("callsLastMinute"));
        let endpoints = store.hgetall("metrics:endpoints").await.unwrap();
        assert!(endpoints.contains_key("/x"));
    }
}
