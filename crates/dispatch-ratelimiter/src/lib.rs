//! Global token-bucket rate limiter shared by every outbound HTTP call on a
//! host, plus the in-flight cap and auto-tune knobs the adaptive controller
//! drives.
//!
//! Grounded on the teacher's `tower-resilience-ratelimiter` (fixed-window
//! reservoir shape, FIFO blocked-acquire idiom) generalized from a
//! per-request-count window into the spec's combined token-bucket +
//! concurrency-cap contract: `schedule(fn)` runs `fn` once both an in-flight
//! slot and a token are available, blocking FIFO up to `high_water` pending
//! callers.

pub mod error;
mod reservoir;

pub use error::RateLimiterError;

use reservoir::Reservoir;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Tunable knobs for the limiter; the fields the adaptive controller mutates
/// live inside `State`, this is a point-in-time snapshot for publishing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterSettings {
    pub max_concurrent: usize,
    pub min_time: Duration,
    pub high_water: usize,
}

impl Default for RateLimiterSettings {
    /// `maxConcurrent=5`, `minTime=100ms`, reservoir of 100 tokens / 60s, and
    /// a FIFO wait queue capped at 100 pending callers.
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            min_time: Duration::from_millis(100),
            high_water: 100,
        }
    }
}

struct State {
    reservoir: Reservoir,
    in_flight: usize,
    max_concurrent: usize,
    min_time: Duration,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    high_water: usize,
    waiters: AtomicUsize,
    notify: Notify,
}

/// Global rate limiter. Cheaply cloneable; every clone shares the same state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

/// Held while an acquired call runs; releases its in-flight slot on drop.
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

impl RateLimiter {
    pub fn new(settings: RateLimiterSettings) -> Self {
        Self::with_name(settings, "<unnamed>")
    }

    pub fn with_name(settings: RateLimiterSettings, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    reservoir: Reservoir::new(100, Duration::from_secs(60)),
                    in_flight: 0,
                    max_concurrent: settings.max_concurrent,
                    min_time: settings.min_time,
                }),
                high_water: settings.high_water,
                waiters: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Runs `f` once a slot and a token are both available, awaiting it and
    /// returning its output. Rejects immediately if the FIFO wait queue is
    /// already at `high_water` depth.
    pub async fn schedule<F, Fut, T>(&self, f: F) -> Result<T, RateLimiterError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(f().await)
    }

    async fn acquire(&self) -> Result<Permit, RateLimiterError> {
        let waiters = self.inner.waiters.fetch_add(1, Ordering::AcqRel) + 1;
        if waiters > self.inner.high_water {
            self.inner.waiters.fetch_sub(1, Ordering::AcqRel);
            #[cfg(feature = "tracing")]
            tracing::debug!(limiter = %self.inner.name, high_water = self.inner.high_water, "rate limiter queue full");
            return Err(RateLimiterError::QueueFull {
                high_water: self.inner.high_water,
            });
        }

        loop {
            let (granted, min_time) = {
                let mut state = self.inner.state.lock().unwrap();
                if state.in_flight < state.max_concurrent && state.reservoir.try_take() {
                    state.in_flight += 1;
                    (true, state.min_time)
                } else {
                    (false, state.min_time)
                }
            };

            if granted {
                self.inner.waiters.fetch_sub(1, Ordering::AcqRel);
                return Ok(Permit {
                    inner: Arc::clone(&self.inner),
                });
            }

            // Wake on release, or re-poll at the throttle interval, whichever first.
            let _ = tokio::time::timeout(min_time, self.inner.notify.notified()).await;
        }
    }

    /// True once the FIFO wait queue depth exceeds 80% of `high_water`.
    pub fn is_limited(&self) -> bool {
        let waiters = self.inner.waiters.load(Ordering::Relaxed) as f64;
        waiters > 0.8 * self.inner.high_water as f64
    }

    /// Point-in-time snapshot of the tunable settings, for publishing to the
    /// context store.
    pub fn settings_snapshot(&self) -> RateLimiterSettings {
        let state = self.inner.state.lock().unwrap();
        RateLimiterSettings {
            max_concurrent: state.max_concurrent,
            min_time: state.min_time,
            high_water: self.inner.high_water,
        }
    }

    /// Driven by the adaptive controller roughly every 60s with the moving
    /// error rate and average response time observed by the metrics
    /// aggregator.
    ///
    /// - error rate > 10% → `max_concurrent *= 0.8` (floor 1), `min_time *= 1.2` (cap 500ms).
    /// - error rate < 1% and avg response time < 200ms → `max_concurrent *= 1.1` (cap 20), `min_time *= 0.9` (floor 50ms).
    /// - otherwise, no change.
    pub fn auto_tune(&self, moving_error_rate: f64, avg_response_time: Duration) {
        let mut state = self.inner.state.lock().unwrap();
        if moving_error_rate > 0.10 {
            state.max_concurrent = ((state.max_concurrent as f64 * 0.8) as usize).max(1);
            state.min_time = state
                .min_time
                .mul_f64(1.2)
                .min(Duration::from_millis(500));
        } else if moving_error_rate < 0.01 && avg_response_time < Duration::from_millis(200) {
            state.max_concurrent = ((state.max_concurrent as f64 * 1.1).ceil() as usize).min(20);
            state.min_time = state
                .min_time
                .mul_f64(0.9)
                .max(Duration::from_millis(50));
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn schedule_runs_immediately_with_capacity() {
        let limiter = RateLimiter::new(RateLimiterSettings::default());
        let result = limiter.schedule(|| async { 42 }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn schedule_serializes_beyond_max_concurrent() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 1,
            min_time: Duration::from_millis(5),
            high_water: 10,
        });

        let started = Instant::now();
        let l2 = limiter.clone();
        let first = tokio::spawn(async move {
            l2.schedule(|| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = limiter.schedule(|| async { started.elapsed() }).await.unwrap();

        first.await.unwrap().unwrap();
        assert!(second >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn rejects_beyond_high_water() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 1,
            min_time: Duration::from_millis(50),
            high_water: 1,
        });

        let l2 = limiter.clone();
        let hold = tokio::spawn(async move {
            l2.schedule(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let l3 = limiter.clone();
        let blocked = tokio::spawn(async move { l3.schedule(|| async {}).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rejected = limiter.schedule(|| async {}).await;
        assert!(matches!(rejected, Err(RateLimiterError::QueueFull { .. })));

        hold.await.unwrap().unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[test]
    fn auto_tune_throttles_on_high_error_rate() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 10,
            min_time: Duration::from_millis(100),
            high_water: 100,
        });
        limiter.auto_tune(0.20, Duration::from_millis(300));
        let settings = limiter.settings_snapshot();
        assert_eq!(settings.max_concurrent, 8);
        assert_eq!(settings.min_time, Duration::from_millis(120));
    }

    #[test]
    fn auto_tune_floors_max_concurrent_at_one() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 1,
            min_time: Duration::from_millis(100),
            high_water: 100,
        });
        limiter.auto_tune(0.50, Duration::from_millis(300));
        assert_eq!(limiter.settings_snapshot().max_concurrent, 1);
    }

    #[test]
    fn auto_tune_relaxes_on_healthy_signals() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 10,
            min_time: Duration::from_millis(100),
            high_water: 100,
        });
        limiter.auto_tune(0.005, Duration::from_millis(50));
        let settings = limiter.settings_snapshot();
        assert_eq!(settings.max_concurrent, 11);
        assert_eq!(settings.min_time, Duration::from_millis(90));
    }

    #[test]
    fn auto_tune_caps_max_concurrent_at_twenty() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 20,
            min_time: Duration::from_millis(50),
            high_water: 100,
        });
        limiter.auto_tune(0.0, Duration::from_millis(10));
        assert_eq!(limiter.settings_snapshot().max_concurrent, 20);
    }

    #[test]
    fn auto_tune_leaves_settings_unchanged_in_the_middle_band() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 10,
            min_time: Duration::from_millis(100),
            high_water: 100,
        });
        limiter.auto_tune(0.05, Duration::from_millis(300));
        let settings = limiter.settings_snapshot();
        assert_eq!(settings.max_concurrent, 10);
        assert_eq!(settings.min_time, Duration::from_millis(100));
    }

    #[test]
    fn is_limited_crosses_eighty_percent_threshold() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            max_concurrent: 1,
            min_time: Duration::from_millis(10),
            high_water: 10,
        });
        assert!(!limiter.is_limited());
        limiter.inner.waiters.store(9, Ordering::SeqCst);
        assert!(limiter.is_limited());
    }
}
