use crate::validate::ValidationError;
use dispatch_queue::QueueError;
use dispatch_store::StoreError;

/// A job-level failure. The string form is what's handed to the queue's
/// `fail`, so variants read the way an operator inspecting the job's error
/// field would expect.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("No config found")]
    SessionNotFound,
    #[error("session payload malformed: {0}")]
    SessionMalformed(String),
    #[error("durable store: {0}")]
    Store(#[from] StoreError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
}
