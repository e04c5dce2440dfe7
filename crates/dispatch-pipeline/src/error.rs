//! Error type for the record pipeline.

use crate::PipelineTaskError;
use dispatch_pool::PoolError;
use dispatch_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The circuit breaker gate rejected this submission.
    #[error("circuit breaker open: {0}")]
    CircuitOpen(&'static str),
    /// The worker pool could not run this record (timeout, crash, shutdown).
    #[error("worker pool: {0}")]
    Pool(String),
    /// Persisting the trace or session stats to the durable store failed.
    #[error("durable store: {0}")]
    Store(#[from] StoreError),
}

impl From<PoolError<PipelineTaskError>> for PipelineError {
    fn from(err: PoolError<PipelineTaskError>) -> Self {
        match err {
            PoolError::Application(never) => match never {},
            other => PipelineError::Pool(other.to_string()),
        }
    }
}
