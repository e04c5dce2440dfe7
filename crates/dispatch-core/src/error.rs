//! A common error type that wraps every layer of the dispatch stack.
//!
//! Composing a rate limiter, a worker pool, a circuit breaker and a retry
//! loop around a single HTTP call normally means writing a `From` impl per
//! layer. [`DispatchError`] avoids that: each layer's own error type only
//! needs a single `From<LayerError> for DispatchError<E>` (provided by the
//! layer's crate), and the record pipeline deals in one error type
//! throughout.
//!
//! ```
//! use dispatch_core::DispatchError;
//!
//! #[derive(Debug)]
//! struct RecordError(String);
//!
//! impl std::fmt::Display for RecordError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{}", self.0)
//!     }
//! }
//! impl std::error::Error for RecordError {}
//!
//! let err: DispatchError<RecordError> = DispatchError::CircuitOpen;
//! assert!(err.is_circuit_open());
//! ```

use std::fmt;
use std::time::Duration;

/// Unified error type for the dispatch engine's concurrency-control stack.
#[derive(Debug, Clone)]
pub enum DispatchError<E> {
    /// The per-attempt HTTP timeout elapsed.
    Timeout {
        /// Which layer observed the timeout (e.g. `"http_executor"`, `"pool_task"`).
        layer: &'static str,
    },
    /// The circuit breaker is open; the call was rejected before submission.
    CircuitOpen,
    /// The worker pool could not accept or complete the task.
    PoolUnavailable {
        /// Human-readable detail, e.g. "worker crashed mid-task".
        reason: String,
    },
    /// The rate limiter's blocked-enqueue wait exceeded the pool task timeout.
    RateLimited {
        /// Wait hint, if the limiter could compute one.
        retry_after: Option<Duration>,
    },
    /// The pool (or process) is shutting down; pending work was cancelled.
    ShuttingDown,
    /// The underlying application-level error (a classified `ApiError`, typically).
    Application(E),
}

impl<E: fmt::Display> fmt::Display for DispatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Timeout { layer } => write!(f, "timeout in {layer}"),
            DispatchError::CircuitOpen => write!(f, "circuit breaker active"),
            DispatchError::PoolUnavailable { reason } => write!(f, "pool unavailable: {reason}"),
            DispatchError::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(f, "rate limited, retry after {d:?}"),
                None => write!(f, "rate limited"),
            },
            DispatchError::ShuttingDown => write!(f, "shutting down"),
            DispatchError::Application(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for DispatchError<E> {}

impl<E> DispatchError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, DispatchError::CircuitOpen)
    }

    pub fn is_pool_unavailable(&self) -> bool {
        matches!(self, DispatchError::PoolUnavailable { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DispatchError::RateLimited { .. })
    }

    pub fn is_application(&self) -> bool {
        matches!(self, DispatchError::Application(_))
    }

    pub fn application_error(self) -> Option<E> {
        match self {
            DispatchError::Application(e) => Some(e),
            _ => None,
        }
    }

    pub fn map_application<F, T>(self, f: F) -> DispatchError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            DispatchError::Timeout { layer } => DispatchError::Timeout { layer },
            DispatchError::CircuitOpen => DispatchError::CircuitOpen,
            DispatchError::PoolUnavailable { reason } => DispatchError::PoolUnavailable { reason },
            DispatchError::RateLimited { retry_after } => {
                DispatchError::RateLimited { retry_after }
            }
            DispatchError::ShuttingDown => DispatchError::ShuttingDown,
            DispatchError::Application(e) => DispatchError::Application(f(e)),
        }
    }
}
