//! Process-wide configuration loaded once from the environment.
//!
//! Every default below matches the external interface table: these are the
//! knobs an operator tunes without a rebuild. `DispatchConfig::from_env`
//! never panics on a missing variable — it falls back to the documented
//! default and only fails to parse a variable that is present but invalid.

use std::env;
use std::time::Duration;

/// Tunables shared across the rate limiter, worker pool and adaptive controller.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub cooldown: Duration,
    pub cb_error_threshold: f64,
    pub cb_reset_timeout: Duration,
    pub history_length: usize,
    pub trend_history_length: usize,
    pub system_health_history: usize,
    pub prediction_update_interval: Duration,
    pub error_window: Duration,
    pub pool_task_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 20,
            max_concurrency: 50,
            cooldown: Duration::from_millis(30_000),
            cb_error_threshold: 0.30,
            cb_reset_timeout: Duration::from_millis(60_000),
            history_length: 5,
            trend_history_length: 3,
            system_health_history: 10,
            prediction_update_interval: Duration::from_millis(900_000),
            error_window: Duration::from_millis(300_000),
            pool_task_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Error parsing a single environment variable.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {name}: {value:?}")]
pub struct ConfigParseError {
    name: &'static str,
    value: String,
}

impl DispatchConfig {
    /// Loads configuration from the environment, falling back to defaults
    /// for any variable that is unset.
    pub fn from_env() -> Result<Self, ConfigParseError> {
        let defaults = Self::default();
        Ok(Self {
            min_concurrency: env_usize("MIN_CONCURRENCY", defaults.min_concurrency)?,
            max_concurrency: env_usize("MAX_CONCURRENCY", defaults.max_concurrency)?,
            cooldown: env_millis("COOLDOWN_MS", defaults.cooldown)?,
            cb_error_threshold: env_f64("CB_ERROR_THRESHOLD", defaults.cb_error_threshold)?,
            cb_reset_timeout: env_millis("CB_RESET_TIMEOUT", defaults.cb_reset_timeout)?,
            history_length: env_usize("HISTORY_LENGTH", defaults.history_length)?,
            trend_history_length: env_usize(
                "TREND_HISTORY_LENGTH",
                defaults.trend_history_length,
            )?,
            system_health_history: env_usize(
                "SYSTEM_HEALTH_HISTORY",
                defaults.system_health_history,
            )?,
            prediction_update_interval: env_millis(
                "PREDICTION_UPDATE_INTERVAL",
                defaults.prediction_update_interval,
            )?,
            error_window: env_millis("ERROR_WINDOW_MS", defaults.error_window)?,
            pool_task_timeout: env_millis("POOL_TASK_TIMEOUT", defaults.pool_task_timeout)?,
        })
    }
}

fn env_usize(name: &'static str, default: usize) -> Result<usize, ConfigParseError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigParseError { name, value }),
    }
}

fn env_f64(name: &'static str, default: f64) -> Result<f64, ConfigParseError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigParseError { name, value }),
    }
}

fn env_millis(name: &'static str, default: Duration) -> Result<Duration, ConfigParseError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigParseError { name, value }),
    }
}
