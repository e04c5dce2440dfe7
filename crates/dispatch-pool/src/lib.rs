//! A bounded pool of long-lived worker tasks that accepts typed work,
//! returns typed results, isolates per-worker faults, and replaces crashed
//! workers.
//!
//! Generalizes the teacher's `tower_resilience_bulkhead` (a semaphore that
//! gates concurrent calls into one shared inner service) into an owned pool
//! of dedicated workers pulling from a shared queue — closer to the
//! retrieval pack's `CortexLM-dataforge` worker pool (broadcast shutdown
//! channel, per-worker `JoinHandle`, crash detection via the handle
//! resolving unexpectedly) than to a plain concurrency limiter, because the
//! contract here requires worker identity (a crash must be detected and
//! the worker replaced, not just a permit reclaimed).

pub mod error;
pub use error::PoolError;

use futures::future::{select_all, BoxFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `clamp(CPU_COUNT - 1, 2, 4)`, the pool's default worker count.
pub fn default_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.saturating_sub(1).clamp(2, 4)
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub size: usize,
    pub task_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            task_timeout: Duration::from_secs(30),
        }
    }
}

/// A handler the pool calls for every submitted payload.
pub type Handler<T, R, E> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

struct Task<T, R, E> {
    payload: T,
    respond_to: oneshot::Sender<Result<R, PoolError<E>>>,
}

type Receiver<T, R, E> = Arc<AsyncMutex<mpsc::UnboundedReceiver<Task<T, R, E>>>>;

/// Bounded worker pool. Submissions past capacity queue in an unbounded
/// FIFO; backpressure is the caller's concern (C5/C8 apply it).
pub struct WorkerPool<T, R, E> {
    sender: mpsc::UnboundedSender<Task<T, R, E>>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    live_workers: Arc<AtomicUsize>,
    size: usize,
}

impl<T, R, E> WorkerPool<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    pub fn new(config: WorkerPoolConfig, handler: Handler<T, R, E>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: Receiver<T, R, E> = Arc::new(AsyncMutex::new(receiver));
        let shutdown = CancellationToken::new();
        let live_workers = Arc::new(AtomicUsize::new(0));

        let supervisor = spawn_supervisor(
            config.size,
            Arc::clone(&receiver),
            handler,
            shutdown.clone(),
            config.task_timeout,
            Arc::clone(&live_workers),
        );

        Self {
            sender,
            cancel: shutdown,
            supervisor: Some(supervisor),
            live_workers,
            size: config.size,
        }
    }

    /// Submits one payload and awaits its result. A worker crash mid-task
    /// surfaces as [`PoolError::WorkerCrashed`] rather than a hang.
    pub async fn submit(&self, payload: T) -> Result<R, PoolError<E>> {
        let (respond_to, rx) = oneshot::channel();
        if self.sender.send(Task { payload, respond_to }).is_err() {
            return Err(PoolError::ShuttingDown);
        }
        rx.await.unwrap_or(Err(PoolError::WorkerCrashed))
    }

    /// Submits every payload, awaits all settled, and returns results in
    /// input order — `batchProcess`'s submit-all/await-all-settled contract.
    pub async fn batch_process(&self, payloads: Vec<T>) -> Vec<Result<R, PoolError<E>>> {
        let futures = payloads.into_iter().map(|p| self.submit(p));
        futures::future::join_all(futures).await
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Cancels all pending tasks (each resolves with
    /// [`PoolError::ShuttingDown`]) and terminates the workers.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

fn spawn_supervisor<T, R, E>(
    size: usize,
    receiver: Receiver<T, R, E>,
    handler: Handler<T, R, E>,
    cancel: CancellationToken,
    task_timeout: Duration,
    live_workers: Arc<AtomicUsize>,
) -> JoinHandle<()>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    tokio::spawn(async move {
        let mut handles: Vec<JoinHandle<()>> = (0..size)
            .map(|id| {
                spawn_worker(
                    id,
                    Arc::clone(&receiver),
                    Arc::clone(&handler),
                    cancel.clone(),
                    task_timeout,
                    Arc::clone(&live_workers),
                )
            })
            .collect();

        while !handles.is_empty() {
            let (result, index, remaining) = select_all(handles).await;
            handles = remaining;

            if cancel.is_cancelled() {
                continue;
            }

            match result {
                Ok(()) => {
                    // Worker observed shutdown between the check above and
                    // its own loop — don't respawn.
                }
                Err(_join_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(worker = index, "pool worker crashed, respawning");
                    #[cfg(not(feature = "tracing"))]
                    let _ = index;

                    handles.push(spawn_worker(
                        index,
                        Arc::clone(&receiver),
                        Arc::clone(&handler),
                        cancel.clone(),
                        task_timeout,
                        Arc::clone(&live_workers),
                    ));
                }
            }
        }
    })
}

fn spawn_worker<T, R, E>(
    _id: usize,
    receiver: Receiver<T, R, E>,
    handler: Handler<T, R, E>,
    cancel: CancellationToken,
    task_timeout: Duration,
    live_workers: Arc<AtomicUsize>,
) -> JoinHandle<()>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    live_workers.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        loop {
            let task = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        while let Ok(task) = rx.try_recv() {
                            let _ = task.respond_to.send(Err(PoolError::ShuttingDown));
                        }
                        None
                    }
                    maybe = rx.recv() => maybe,
                }
            };

            let Some(Task { payload, respond_to }) = task else {
                break;
            };

            let outcome = tokio::time::timeout(task_timeout, (handler)(payload)).await;
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(PoolError::Application(e)),
                Err(_) => Err(PoolError::Timeout),
            };
            let _ = respond_to.send(result);
        }
        live_workers.fetch_sub(1, Ordering::SeqCst);
    })
}
