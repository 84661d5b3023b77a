//! In-memory `JobQueue` with the same contract as `PgQueue`: delayed
//! execution, idempotency-key coalescing (live rows and a recent-success
//! window), exponential backoff, dead-letter.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esn_queue::{
    idempotency_window, retry_delay, EnqueueResult, FailureOutcome, Job, JobQueue, JobStatus,
    QueueError,
};
use esn_schemas::{JobPayload, QueueName};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct JobRecord {
    job: Job,
    finished_at: Option<DateTime<Utc>>,
    /// Insertion order breaks run_at ties deterministically.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    jobs: Vec<JobRecord>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs ever enqueued (tests assert on history).
    pub fn all_jobs(&self) -> Vec<Job> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .map(|r| r.job.clone())
            .collect()
    }

    pub fn jobs_in(&self, queue: QueueName) -> Vec<Job> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|r| r.job.queue == queue)
            .map(|r| r.job.clone())
            .collect()
    }

    pub fn dead_lettered(&self) -> Vec<Job> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|r| r.job.status == JobStatus::DeadLettered)
            .map(|r| r.job.clone())
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue_keyed(
        &self,
        payload: JobPayload,
        idempotency_key: Option<String>,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueResult, QueueError> {
        let queue = payload.queue();
        let mut inner = self.inner.lock().unwrap();

        if let Some(key) = &idempotency_key {
            // One live job per key.
            if let Some(live) = inner.jobs.iter().find(|r| {
                r.job.idempotency_key.as_deref() == Some(key)
                    && matches!(r.job.status, JobStatus::Pending | JobStatus::Running)
            }) {
                return Ok(EnqueueResult::Coalesced(live.job.id));
            }
            // A run completed inside the window also swallows the enqueue.
            if let Some(recent) = inner.jobs.iter().find(|r| {
                r.job.idempotency_key.as_deref() == Some(key)
                    && r.job.status == JobStatus::Succeeded
                    && r.finished_at
                        .map(|t| t > now - idempotency_window())
                        .unwrap_or(false)
            }) {
                return Ok(EnqueueResult::Coalesced(recent.job.id));
            }
        }

        let job = Job {
            id: Uuid::new_v4(),
            queue,
            payload,
            status: JobStatus::Pending,
            run_at,
            attempts: 0,
            max_attempts: queue.default_max_attempts(),
            idempotency_key,
            last_error: None,
        };
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.push(JobRecord {
            job,
            finished_at: None,
            seq,
        });
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        let _ = worker_id;
        let mut inner = self.inner.lock().unwrap();

        let mut due: Vec<usize> = inner
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.job.queue == queue && r.job.status == JobStatus::Pending && r.job.run_at <= now
            })
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| (inner.jobs[i].job.run_at, inner.jobs[i].seq));
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for i in due {
            let rec = &mut inner.jobs[i];
            rec.job.status = JobStatus::Running;
            rec.job.attempts += 1;
            claimed.push(rec.job.clone());
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .jobs
            .iter_mut()
            .find(|r| r.job.id == job_id && r.job.status == JobStatus::Running)
            .ok_or(QueueError::NotFound)?;
        rec.job.status = JobStatus::Succeeded;
        rec.finished_at = Some(now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .jobs
            .iter_mut()
            .find(|r| r.job.id == job_id)
            .ok_or(QueueError::NotFound)?;

        rec.job.last_error = Some(error.to_string());
        if rec.job.attempts >= rec.job.max_attempts {
            rec.job.status = JobStatus::DeadLettered;
            rec.finished_at = Some(now);
            return Ok(FailureOutcome::DeadLettered);
        }

        let next_run_at = now + retry_delay(rec.job.queue, rec.job.attempts);
        rec.job.status = JobStatus::Pending;
        rec.job.run_at = next_run_at;
        Ok(FailureOutcome::Retrying { next_run_at })
    }

    async fn dead_letter(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .jobs
            .iter_mut()
            .find(|r| r.job.id == job_id)
            .ok_or(QueueError::NotFound)?;
        rec.job.status = JobStatus::DeadLettered;
        rec.job.last_error = Some(error.to_string());
        rec.finished_at = Some(now);
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<i64, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .filter(|r| {
                r.job.queue == queue
                    && matches!(r.job.status, JobStatus::Pending | JobStatus::Running)
            })
            .count() as i64)
    }

    async fn dead_letter_count(&self) -> Result<i64, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .filter(|r| r.job.status == JobStatus::DeadLettered)
            .count() as i64)
    }
}
