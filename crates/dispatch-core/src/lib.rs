//! Shared infrastructure for the dispatch engine crates.
//!
//! This crate provides the pieces every other `dispatch-*` crate needs and
//! would otherwise duplicate:
//! - [`events`]: an observability event system (listeners, `tracing`/`metrics`
//!   hookups) shared by the rate limiter, pool, breaker and controller.
//! - [`error`]: [`DispatchError`], a unified error type so layers compose
//!   without per-pair `From` boilerplate.
//! - [`aimd`]: a generic additive-increase/multiplicative-decrease controller
//!   used by the rate limiter's auto-tune step.
//! - [`config`]: [`DispatchConfig`], the process-wide tunables loaded once at
//!   start-up.

pub mod aimd;
pub mod config;
pub mod error;
pub mod events;

pub use config::DispatchConfig;
pub use error::DispatchError;
pub use events::{EventListener, EventListeners, FnListener, ResilienceEvent};
