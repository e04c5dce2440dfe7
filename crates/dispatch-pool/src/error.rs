//! Error types for the worker pool.

/// Errors a submitted task can resolve with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError<E> {
    /// The hard per-task timeout (30s) elapsed.
    #[error("pool task timed out")]
    Timeout,
    /// The worker executing this task crashed mid-task.
    #[error("worker crashed while processing this task")]
    WorkerCrashed,
    /// The task could not be delivered to a worker and the single requeue
    /// attempt also failed.
    #[error("task could not be delivered to any worker")]
    DeliveryFailed,
    /// The pool is shutting down; the task was rejected or cancelled.
    #[error("worker pool is shutting down")]
    ShuttingDown,
    /// The handler itself produced an application-level error.
    #[error(transparent)]
    Application(#[from] E),
}
