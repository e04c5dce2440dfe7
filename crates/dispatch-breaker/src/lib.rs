//! Process-wide circuit breaker gate.
//!
//! Unlike the teacher's `tower_resilience_circuitbreaker` (a per-service
//! `Tower` layer with count/time sliding windows and half-open probing), the
//! breaker here is a single shared gate the adaptive controller (C7) trips
//! and clears based on its own health score, and the record pipeline (C5)
//! only reads. There is no half-open probing state: a trip is a flat
//! `resetTimeout` window, and recovery afterward is the controller's
//! concurrency ramp, not this crate's concern. The trip/gate/snapshot shape
//! is lifted from the teacher's `Circuit` state machine
//! (`tower-resilience-circuitbreaker/src/circuit.rs`), narrowed to the one
//! transition this system needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The message the gate reports in a rejection, matching the contract's
/// literal text so callers can pattern-match on it if needed.
pub const TRIP_MESSAGE: &str = "Circuit breaker active";

/// A point-in-time view of the breaker, suitable for persisting to the
/// durable store (`metrics:circuitBreaker`).
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub tripped: bool,
    pub last_tripped: Option<Instant>,
    pub reason: Option<String>,
    pub reset_timeout: Duration,
}

struct Inner {
    last_tripped: Mutex<Option<Instant>>,
    reason: Mutex<Option<String>>,
    reset_timeout: Duration,
}

/// Shared circuit breaker gate. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    tripped: std::sync::Arc<AtomicBool>,
    inner: std::sync::Arc<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl CircuitBreaker {
    pub fn new(reset_timeout: Duration) -> Self {
        Self {
            tripped: std::sync::Arc::new(AtomicBool::new(false)),
            inner: std::sync::Arc::new(Inner {
                last_tripped: Mutex::new(None),
                reason: Mutex::new(None),
                reset_timeout,
            }),
        }
    }

    /// Consulted by the record pipeline before every submission. Returns
    /// `Err` with the trip reason while inside the reset window.
    pub fn gate(&self) -> Result<(), &'static str> {
        if !self.tripped.load(Ordering::Acquire) {
            return Ok(());
        }
        let last_tripped = *self.inner.last_tripped.lock().unwrap();
        match last_tripped {
            Some(when) if when.elapsed() < self.inner.reset_timeout => Err(TRIP_MESSAGE),
            _ => Ok(()),
        }
    }

    /// Trips the breaker. Called by the adaptive controller when
    /// `avgError > 0.30` or `systemHealth < -0.7`.
    pub fn trip(&self, reason: impl Into<String>) {
        self.tripped.store(true, Ordering::Release);
        *self.inner.last_tripped.lock().unwrap() = Some(Instant::now());
        *self.inner.reason.lock().unwrap() = Some(reason.into());
        #[cfg(feature = "tracing")]
        tracing::warn!("circuit breaker tripped");
    }

    /// Clears the breaker. Called by the controller on the first tick after
    /// `reset_timeout` has elapsed, immediately before it begins ramping
    /// concurrency back up in recovery mode.
    pub fn clear(&self) {
        self.tripped.store(false, Ordering::Release);
        #[cfg(feature = "tracing")]
        tracing::info!("circuit breaker cleared, entering recovery");
    }

    /// Whether the reset window has fully elapsed since the last trip, i.e.
    /// the controller should run its "exit breaker" decision this tick.
    pub fn reset_window_elapsed(&self) -> bool {
        if !self.tripped.load(Ordering::Acquire) {
            return false;
        }
        match *self.inner.last_tripped.lock().unwrap() {
            Some(when) => when.elapsed() >= self.inner.reset_timeout,
            None => false,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn reset_timeout(&self) -> Duration {
        self.inner.reset_timeout
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            tripped: self.tripped.load(Ordering::Acquire),
            last_tripped: *self.inner.last_tripped.lock().unwrap(),
            reason: self.inner.reason.lock().unwrap().clone(),
            reset_timeout: self.inner.reset_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_breaker_gates_ok() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        assert!(breaker.gate().is_ok());
    }

    #[test]
    fn tripped_breaker_rejects_with_the_contract_message() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        breaker.trip("avgError > 0.30");
        assert_eq!(breaker.gate(), Err(TRIP_MESSAGE));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn gate_reopens_once_reset_timeout_elapses() {
        let breaker = CircuitBreaker::new(Duration::from_millis(20));
        breaker.trip("systemHealth < -0.7");
        assert!(breaker.gate().is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.gate().is_ok());
        assert!(breaker.reset_window_elapsed());
    }

    #[test]
    fn clear_drops_tripped_state_immediately() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        breaker.trip("boom");
        breaker.clear();
        assert!(breaker.gate().is_ok());
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn snapshot_reflects_last_trip_reason() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        breaker.trip("avgError > 0.30");
        let snap = breaker.snapshot();
        assert!(snap.tripped);
        assert_eq!(snap.reason.as_deref(), Some("avgError > 0.30"));
        assert_eq!(snap.reset_timeout, Duration::from_secs(60));
    }

    #[test]
    fn clones_share_state() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        let clone = breaker.clone();
        clone.trip("shared");
        assert!(breaker.is_tripped());
    }
}
