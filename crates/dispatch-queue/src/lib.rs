//! Work-queue contract (C8's upstream): `add`/`getJob`/
//! `getJobCountByTypes`/`getJobs`/`updateProgress`/`moveToDelayed`/
//! `promote`/`remove`/`pause`/`resume`, with an in-memory reference
//! implementation for tests and single-process deployments.
//!
//! Grounded on PostHog's `hook-common::pgqueue::PgQueue` (the
//! `Job`/`NewJob`/`RetryableJob`/`CompletedJob`/`FailedJob` lifecycle and
//! its `RetryPolicy` exponential-backoff calculation), generalized from a
//! Postgres-table-backed queue into a trait boundary so the reference
//! implementation here can stay in-memory while a production deployment
//! swaps in a durable backend without touching `dispatch-worker`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} has reached its maximum attempts and cannot be retried further")]
    MaxAttemptsReached(JobId),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Mirrors BullMQ-style default job options: 3 attempts, exponential
/// backoff off a 5s base, and retention windows for completed/failed jobs.
#[derive(Debug, Clone)]
pub struct JobQueueOptions {
    pub attempts: u32,
    pub backoff_base: Duration,
    pub retain_completed_for: Duration,
    pub retain_completed_count: usize,
    pub retain_failed_for: Duration,
    pub delay: Option<Duration>,
}

impl Default for JobQueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            retain_completed_for: Duration::from_secs(24 * 60 * 60),
            retain_completed_count: 1000,
            retain_failed_for: Duration::from_secs(7 * 24 * 60 * 60),
            delay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub data: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: Value,
    pub error: Option<String>,
    pub created_at: Instant,
    pub scheduled_at: Instant,
    pub finished_at: Option<Instant>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn add(&self, name: &str, data: Value, opts: JobQueueOptions) -> Result<JobId, QueueError>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;
    async fn get_job_count_by_types(&self, states: &[JobStatus]) -> Result<u64, QueueError>;
    async fn get_jobs(
        &self,
        states: &[JobStatus],
        from: usize,
        to: usize,
    ) -> Result<Vec<Job>, QueueError>;
    async fn update_progress(&self, id: JobId, progress: Value) -> Result<(), QueueError>;
    async fn move_to_delayed(&self, id: JobId, until: Duration) -> Result<(), QueueError>;
    async fn promote(&self, id: JobId) -> Result<(), QueueError>;
    async fn remove(&self, id: JobId) -> Result<(), QueueError>;
    async fn pause(&self) -> Result<(), QueueError>;
    async fn resume(&self) -> Result<(), QueueError>;

    /// Reserves the next eligible job for a worker (earliest-created,
    /// `Waiting` or due `Delayed`), marking it `Active`. Not part of the
    /// Node-style contract's named surface but required for a worker to
    /// actually consume the queue.
    async fn reserve_next(&self) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, id: JobId) -> Result<(), QueueError>;

    /// Fails a job. If attempts remain, reschedules it with exponential
    /// backoff off `backoff_base`; otherwise marks it permanently `Failed`.
    async fn fail(&self, id: JobId, error: &str) -> Result<(), QueueError>;
}

struct Record {
    job: Job,
    opts: JobQueueOptions,
}

struct State {
    jobs: HashMap<JobId, Record>,
    next_id: JobId,
    paused: bool,
}

/// In-memory reference [`JobQueue`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    state: std::sync::Arc<std::sync::Mutex<State>>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: std::sync::Arc::new(std::sync::Mutex::new(State {
                jobs: HashMap::new(),
                next_id: 1,
                paused: false,
            })),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn add(&self, name: &str, data: Value, opts: JobQueueOptions) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let now = Instant::now();
        let (status, scheduled_at) = match opts.delay {
            Some(delay) => (JobStatus::Delayed, now + delay),
            None => (JobStatus::Waiting, now),
        };
        let job = Job {
            id,
            name: name.to_string(),
            data,
            status,
            attempts: 0,
            max_attempts: opts.attempts,
            progress: Value::Null,
            error: None,
            created_at: now,
            scheduled_at,
            finished_at: None,
        };
        state.jobs.insert(id, Record { job, opts });
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.state.lock().unwrap().jobs.get(&id).map(|r| r.job.clone()))
    }

    async fn get_job_count_by_types(&self, states: &[JobStatus]) -> Result<u64, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .values()
            .filter(|r| states.contains(&r.job.status))
            .count() as u64)
    }

    async fn get_jobs(
        &self,
        states: &[JobStatus],
        from: usize,
        to: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().unwrap();
        let mut matching: Vec<&Record> = state
            .jobs
            .values()
            .filter(|r| states.contains(&r.job.status))
            .collect();
        matching.sort_by_key(|r| r.job.id);
        Ok(matching
            .into_iter()
            .skip(from)
            .take(to.saturating_sub(from))
            .map(|r| r.job.clone())
            .collect())
    }

    async fn update_progress(&self, id: JobId, progress: Value) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let record = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        record.job.progress = progress;
        Ok(())
    }

    async fn move_to_delayed(&self, id: JobId, until: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let record = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        record.job.status = JobStatus::Delayed;
        record.job.scheduled_at = Instant::now() + until;
        Ok(())
    }

    async fn promote(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let record = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if record.job.status == JobStatus::Delayed {
            record.job.status = JobStatus::Waiting;
            record.job.scheduled_at = Instant::now();
        }
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.jobs.remove(&id).ok_or(QueueError::NotFound(id))?;
        Ok(())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.state.lock().unwrap().paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.state.lock().unwrap().paused = false;
        Ok(())
    }

    async fn reserve_next(&self) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.paused {
            return Ok(None);
        }
        let now = Instant::now();
        let mut candidates: Vec<JobId> = state
            .jobs
            .values()
            .filter(|r| {
                matches!(r.job.status, JobStatus::Waiting)
                    || (r.job.status == JobStatus::Delayed && r.job.scheduled_at <= now)
            })
            .map(|r| r.job.id)
            .collect();
        candidates.sort_unstable();
        let Some(id) = candidates.into_iter().next() else {
            return Ok(None);
        };
        let record = state.jobs.get_mut(&id).unwrap();
        record.job.status = JobStatus::Active;
        record.job.attempts += 1;
        Ok(Some(record.job.clone()))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let record = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        record.job.status = JobStatus::Completed;
        record.job.finished_at = Some(Instant::now());
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let record = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        record.job.error = Some(error.to_string());
        if record.job.attempts >= record.job.max_attempts {
            record.job.status = JobStatus::Failed;
            record.job.finished_at = Some(Instant::now());
            return Err(QueueError::MaxAttemptsReached(id));
        }
        let backoff = record.opts.backoff_base * 2u32.pow(record.job.attempts.saturating_sub(1));
        record.job.status = JobStatus::Delayed;
        record.job.scheduled_at = Instant::now() + backoff;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_reserve_marks_job_active_and_bumps_attempts() {
        let queue = InMemoryJobQueue::new();
        let id = queue
            .add("batch", serde_json::json!({"sessionId": "s1"}), JobQueueOptions::default())
            .await
            .unwrap();
        let job = queue.reserve_next().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts, 1);
        assert!(queue.reserve_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_is_fifo_by_creation_order() {
        let queue = InMemoryJobQueue::new();
        let first = queue.add("a", Value::Null, JobQueueOptions::default()).await.unwrap();
        let _second = queue.add("b", Value::Null, JobQueueOptions::default()).await.unwrap();
        let job = queue.reserve_next().await.unwrap().unwrap();
        assert_eq!(job.id, first);
    }

    #[tokio::test]
    async fn pause_prevents_reservation_until_resumed() {
        let queue = InMemoryJobQueue::new();
        queue.add("a", Value::Null, JobQueueOptions::default()).await.unwrap();
        queue.pause().await.unwrap();
        assert!(queue.reserve_next().await.unwrap().is_none());
        queue.resume().await.unwrap();
        assert!(queue.reserve_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fail_with_remaining_attempts_reschedules_as_delayed() {
        let queue = InMemoryJobQueue::new();
        let id = queue
            .add("a", Value::Null, JobQueueOptions { attempts: 3, ..Default::default() })
            .await
            .unwrap();
        queue.reserve_next().await.unwrap();
        queue.fail(id, "transient").await.unwrap();
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.error.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn fail_without_remaining_attempts_marks_permanently_failed() {
        let queue = InMemoryJobQueue::new();
        let id = queue
            .add("a", Value::Null, JobQueueOptions { attempts: 1, ..Default::default() })
            .await
            .unwrap();
        queue.reserve_next().await.unwrap();
        let err = queue.fail(id, "fatal").await.unwrap_err();
        assert!(matches!(err, QueueError::MaxAttemptsReached(_)));
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn promote_moves_a_delayed_job_back_to_waiting() {
        let queue = InMemoryJobQueue::new();
        let id = queue
            .add(
                "a",
                Value::Null,
                JobQueueOptions { delay: Some(Duration::from_secs(3600)), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(queue.reserve_next().await.unwrap().is_none());
        queue.promote(id).await.unwrap();
        assert!(queue.reserve_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn get_job_count_by_types_and_get_jobs_paginate() {
        let queue = InMemoryJobQueue::new();
        for i in 0..5 {
            queue.add(&format!("job{i}"), Value::Null, JobQueueOptions::default()).await.unwrap();
        }
        let count = queue.get_job_count_by_types(&[JobStatus::Waiting]).await.unwrap();
        assert_eq!(count, 5);
        let page = queue.get_jobs(&[JobStatus::Waiting], 0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
    }
}
