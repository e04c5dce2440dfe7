//! Adaptive concurrency controller (C7).
//!
//! Generalizes the teacher's `ConcurrencyAlgorithm` trait boundary
//! (`tower-resilience-adaptive::algorithm`) — an atomic `limit()` with
//! `min_limit()`/`max_limit()` accessors, swappable algorithm bodies behind
//! one interface — but the decision body here is not AIMD or Vegas. Each
//! `tick()` runs the ordered trip → recovery-exit → recovery-step →
//! increase → decrease → stable decision list against five rolling-average
//! signals and their trend scores, and drives the shared
//! [`dispatch_breaker::CircuitBreaker`] instead of a per-request sawtooth.

use dispatch_breaker::CircuitBreaker;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Trait boundary shared with the teacher's AIMD/Vegas algorithms: any
/// concurrency controller exposes its current limit and the band it's
/// clamped to.
pub trait ConcurrencyAlgorithm: Send + Sync {
    fn limit(&self) -> usize;
    fn min_limit(&self) -> usize;
    fn max_limit(&self) -> usize;
}

/// The five signals read once per tick.
#[derive(Debug, Clone, Copy)]
pub struct Signals {
    pub cpu: f64,
    pub mem: f64,
    pub error: f64,
    pub backlog: f64,
    pub response_time: Duration,
}

/// Which branch of the ordered decision list fired on a given tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    TripBreaker { reason: String },
    ExitBreakerToRecovery,
    RecoveryStep { new_limit: usize },
    Increase { by: usize, new_limit: usize },
    Decrease { by: usize, new_limit: usize },
    Stable { predictive_adjustment: i64, new_limit: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub cooldown: Duration,
    pub cb_error_threshold: f64,
    pub cb_reset_timeout: Duration,
    pub history_length: usize,
    pub trend_history_length: usize,
    pub concurrency_increase_rate: usize,
    pub concurrency_stability_threshold: u32,
    pub max_decrease_step: usize,
    pub max_recovery_steps: u32,
    pub prediction_update_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 20,
            max_concurrency: 50,
            cooldown: Duration::from_secs(30),
            cb_error_threshold: 0.30,
            cb_reset_timeout: Duration::from_secs(60),
            history_length: 5,
            trend_history_length: 3,
            concurrency_increase_rate: 2,
            concurrency_stability_threshold: 5,
            max_decrease_step: 3,
            max_recovery_steps: 5,
            prediction_update_interval: Duration::from_secs(15 * 60),
        }
    }
}

fn trend_sample(prev: f64, latest: f64) -> i8 {
    if latest > prev * 1.1 {
        1
    } else if latest < prev * 0.9 {
        -1
    } else {
        0
    }
}

fn push_capped<T>(deque: &mut VecDeque<T>, value: T, cap: usize) {
    deque.push_back(value);
    while deque.len() > cap {
        deque.pop_front();
    }
}

fn mean(deque: &VecDeque<f64>) -> f64 {
    if deque.is_empty() {
        0.0
    } else {
        deque.iter().sum::<f64>() / deque.len() as f64
    }
}

fn trend_mean(deque: &VecDeque<i8>) -> f64 {
    if deque.is_empty() {
        0.0
    } else {
        deque.iter().map(|&v| v as f64).sum::<f64>() / deque.len() as f64
    }
}

struct Recovery {
    target: usize,
    step_size: usize,
    steps_done: u32,
}

struct Inner {
    config: ControllerConfig,
    concurrency: usize,
    cpu_history: VecDeque<f64>,
    mem_history: VecDeque<f64>,
    error_history: VecDeque<f64>,
    backlog_history: VecDeque<f64>,
    response_history: VecDeque<f64>,
    cpu_trend: VecDeque<i8>,
    error_trend: VecDeque<i8>,
    backlog_trend: VecDeque<i8>,
    response_trend: VecDeque<i8>,
    stability_counter: u32,
    consecutive_decrease_triggers: u32,
    last_change: Option<Instant>,
    recovery: Option<Recovery>,
    pattern_history: HashMap<u32, Vec<usize>>,
    predictive_delta: i64,
    last_prediction_update: Option<Instant>,
}

/// Tick-driven adaptive concurrency controller. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct AdaptiveController {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl AdaptiveController {
    pub fn new(config: ControllerConfig) -> Self {
        let concurrency = config.min_concurrency;
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                config,
                concurrency,
                cpu_history: VecDeque::new(),
                mem_history: VecDeque::new(),
                error_history: VecDeque::new(),
                backlog_history: VecDeque::new(),
                response_history: VecDeque::new(),
                cpu_trend: VecDeque::new(),
                error_trend: VecDeque::new(),
                backlog_trend: VecDeque::new(),
                response_trend: VecDeque::new(),
                stability_counter: 0,
                consecutive_decrease_triggers: 0,
                last_change: None,
                recovery: None,
                pattern_history: HashMap::new(),
                predictive_delta: 0,
                last_prediction_update: None,
            })),
        }
    }

    /// Runs one controller tick. `hour_of_day` (0-23) drives the predictive
    /// pattern bucket; callers pass their own wall-clock hour so this stays
    /// deterministically testable.
    pub fn tick(&self, signals: Signals, breaker: &CircuitBreaker, hour_of_day: u32) -> Decision {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let cfg = inner.config;

        let response_ms = signals.response_time.as_secs_f64() * 1000.0;
        push_capped(&mut inner.cpu_history, signals.cpu, cfg.history_length);
        push_capped(&mut inner.mem_history, signals.mem, cfg.history_length);
        push_capped(&mut inner.error_history, signals.error, cfg.history_length);
        push_capped(&mut inner.backlog_history, signals.backlog, cfg.history_length);
        push_capped(&mut inner.response_history, response_ms, cfg.history_length);

        let avg_cpu = mean(&inner.cpu_history);
        let avg_mem = mean(&inner.mem_history);
        let avg_error = mean(&inner.error_history);
        let avg_backlog = mean(&inner.backlog_history);
        let avg_response_time = mean(&inner.response_history);
        let last_avg_response_time = inner
            .response_history
            .iter()
            .rev()
            .nth(1)
            .copied()
            .unwrap_or(avg_response_time);

        if inner.cpu_history.len() >= 2 {
            let cpu_sample = {
                let mut it = inner.cpu_history.iter().rev();
                let latest = *it.next().unwrap();
                let prev = *it.next().unwrap();
                trend_sample(prev, latest)
            };
            push_capped(&mut inner.cpu_trend, cpu_sample, cfg.trend_history_length);
        }
        if inner.error_history.len() >= 2 {
            let sample = {
                let mut it = inner.error_history.iter().rev();
                let latest = *it.next().unwrap();
                let prev = *it.next().unwrap();
                trend_sample(prev, latest)
            };
            push_capped(&mut inner.error_trend, sample, cfg.trend_history_length);
        }
        if inner.backlog_history.len() >= 2 {
            let sample = {
                let mut it = inner.backlog_history.iter().rev();
                let latest = *it.next().unwrap();
                let prev = *it.next().unwrap();
                trend_sample(prev, latest)
            };
            push_capped(&mut inner.backlog_trend, sample, cfg.trend_history_length);
        }
        if inner.response_history.len() >= 2 {
            let sample = {
                let mut it = inner.response_history.iter().rev();
                let latest = *it.next().unwrap();
                let prev = *it.next().unwrap();
                trend_sample(prev, latest)
            };
            push_capped(&mut inner.response_trend, sample, cfg.trend_history_length);
        }

        let cpu_trend = trend_mean(&inner.cpu_trend);
        let error_trend = trend_mean(&inner.error_trend);
        let backlog_trend = trend_mean(&inner.backlog_trend);
        let response_trend = trend_mean(&inner.response_trend);

        let system_health =
            0.3 * (-cpu_trend) + 0.3 * (-error_trend) + 0.2 * backlog_trend + 0.2 * (-response_trend);

        // Predictive pattern bookkeeping: only while healthy and above midpoint.
        let midpoint = (cfg.min_concurrency + cfg.max_concurrency) / 2;
        if system_health > 0.0 && inner.concurrency > midpoint {
            let current = inner.concurrency;
            inner.pattern_history.entry(hour_of_day).or_default().push(current);
        }
        let prediction_due = inner
            .last_prediction_update
            .is_none_or(|t| now.duration_since(t) >= cfg.prediction_update_interval);
        if prediction_due {
            let next_hour = (hour_of_day + 1) % 24;
            if let Some(samples) = inner.pattern_history.get(&next_hour) {
                if !samples.is_empty() {
                    let mean_c = samples.iter().sum::<usize>() as f64 / samples.len() as f64;
                    let delta = (mean_c - inner.concurrency as f64).round() as i64;
                    inner.predictive_delta = delta.clamp(-5, 5);
                }
            }
            inner.last_prediction_update = Some(now);
        }

        let decision = if avg_error > cfg.cb_error_threshold || system_health < -0.7 {
            let reason = if avg_error > cfg.cb_error_threshold {
                format!("avgError {avg_error:.3} > {:.2}", cfg.cb_error_threshold)
            } else {
                format!("systemHealth {system_health:.3} < -0.7")
            };
            breaker.trip(reason.clone());
            inner.concurrency = cfg.min_concurrency;
            inner.recovery = None;
            inner.stability_counter = 0;
            inner.consecutive_decrease_triggers = 0;
            inner.last_change = Some(now);
            Decision::TripBreaker { reason }
        } else if breaker.is_tripped() && breaker.reset_window_elapsed() {
            breaker.clear();
            let target = (cfg.min_concurrency as f64 * 1.5).floor() as usize;
            let span = target.saturating_sub(cfg.min_concurrency);
            let step_size = (span / cfg.max_recovery_steps as usize).max(1);
            inner.concurrency = cfg.min_concurrency;
            inner.recovery = Some(Recovery { target, step_size, steps_done: 0 });
            inner.stability_counter = 0;
            inner.last_change = Some(now);
            Decision::ExitBreakerToRecovery
        } else if let Some(mut recovery) = inner.recovery.take() {
            recovery.steps_done += 1;
            let reached_target = inner.concurrency + recovery.step_size >= recovery.target
                || recovery.steps_done >= cfg.max_recovery_steps;
            inner.concurrency = if reached_target {
                recovery.target
            } else {
                inner.concurrency + recovery.step_size
            };
            if !reached_target {
                inner.recovery = Some(recovery);
            } else {
                inner.stability_counter = 0;
            }
            inner.last_change = Some(now);
            Decision::RecoveryStep { new_limit: inner.concurrency }
        } else if system_health > 0.3
            && avg_cpu < 1.5
            && avg_mem > 0.4
            && avg_backlog > 5.0
            && avg_error < 0.07
        {
            inner.consecutive_decrease_triggers = 0;
            let mut step = 1usize;
            if inner.stability_counter > cfg.concurrency_stability_threshold && avg_backlog > 20.0 {
                step = cfg.concurrency_increase_rate.min((avg_backlog / 10.0).floor() as usize);
                step = step.max(1);
            }
            if inner.predictive_delta > 0 && inner.predictive_delta as usize > step {
                step = inner.predictive_delta as usize;
            }
            inner.stability_counter += 1;
            inner.concurrency = (inner.concurrency + step).min(cfg.max_concurrency);
            inner.last_change = Some(now);
            Decision::Increase { by: step, new_limit: inner.concurrency }
        } else if system_health < -0.3
            || avg_cpu > 2.0
            || avg_mem < 0.2
            || avg_error > 0.1
            || avg_response_time > last_avg_response_time * 1.5
        {
            inner.stability_counter = 0;
            inner.consecutive_decrease_triggers += 1;
            let severity = if avg_error > 0.2 {
                3
            } else if system_health < -0.6 {
                2
            } else {
                1
            };
            let step = inner
                .consecutive_decrease_triggers
                .min(cfg.max_decrease_step as u32) as usize
                * severity;
            inner.concurrency = inner.concurrency.saturating_sub(step).max(cfg.min_concurrency);
            inner.last_change = Some(now);
            Decision::Decrease { by: step, new_limit: inner.concurrency }
        } else {
            inner.stability_counter += 1;
            inner.consecutive_decrease_triggers = 0;
            let mut applied = 0i64;
            let cooldown_elapsed = inner
                .last_change
                .is_none_or(|t| now.duration_since(t) > cfg.cooldown * 2);
            if inner.predictive_delta.unsigned_abs() >= 2 && cooldown_elapsed {
                applied = inner.predictive_delta;
                let adjusted = inner.concurrency as i64 + applied;
                inner.concurrency = adjusted.clamp(
                    cfg.min_concurrency as i64,
                    cfg.max_concurrency as i64,
                ) as usize;
                inner.last_change = Some(now);
            }
            Decision::Stable { predictive_adjustment: applied, new_limit: inner.concurrency }
        };

        decision
    }

    pub fn config(&self) -> ControllerConfig {
        self.inner.lock().unwrap().config
    }

    /// Current rolling-average signals and concurrency limit, for the batch
    /// worker's periodic `WorkerMetrics` snapshot.
    pub fn status(&self) -> ControllerStatus {
        let inner = self.inner.lock().unwrap();
        ControllerStatus {
            limit: inner.concurrency,
            avg_cpu: mean(&inner.cpu_history),
            avg_mem: mean(&inner.mem_history),
            avg_error: mean(&inner.error_history),
        }
    }
}

/// Point-in-time read of the controller's rolling averages, independent of
/// the `Decision` returned by the tick that produced them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerStatus {
    pub limit: usize,
    pub avg_cpu: f64,
    pub avg_mem: f64,
    pub avg_error: f64,
}

impl ConcurrencyAlgorithm for AdaptiveController {
    fn limit(&self) -> usize {
        self.inner.lock().unwrap().concurrency
    }

    fn min_limit(&self) -> usize {
        self.inner.lock().unwrap().config.min_concurrency
    }

    fn max_limit(&self) -> usize {
        self.inner.lock().unwrap().config.max_concurrency
    }
}
