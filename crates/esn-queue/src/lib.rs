//! esn-queue
//!
//! Durable delayed job queue over Postgres with at-least-once delivery,
//! idempotency-key coalescing, exponential backoff, and a dead-letter
//! terminal state. Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent
//! dispatchers never hand the same job to two workers.
//!
//! Workers must be idempotent: a crash between execution and
//! `mark_succeeded` redelivers the job.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use esn_schemas::{JobPayload, QueueName};
use uuid::Uuid;

mod pg;

pub use pg::PgQueue;

/// Sliding window in which a completed idempotency key still coalesces a
/// re-enqueue. Sized well above the 30 s job wall-clock budget.
pub fn idempotency_window() -> Duration {
    Duration::minutes(10)
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::DeadLettered => "DEAD_LETTERED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "DEAD_LETTERED" => Ok(JobStatus::DeadLettered),
            other => Err(QueueError::Corrupt(format!("invalid job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    /// Incremented when claimed; the first execution runs at attempts = 1.
    pub attempts: i32,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
}

/// Result of an enqueue that may coalesce onto a live or recently completed
/// job with the same idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(Uuid),
    Coalesced(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Coalesced(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What `mark_failed` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_run_at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job not found")]
    NotFound,
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => QueueError::NotFound,
            other => QueueError::Unavailable(other.to_string()),
        }
    }
}

/// Delay before retry `attempts` (1-based) re-runs: base · 2^(attempts-1),
/// where base is 30 s for notification queues and 60 s for state queues.
pub fn retry_delay(queue: QueueName, attempts: i32) -> Duration {
    let base = queue.backoff_base_secs();
    let exp = (attempts - 1).clamp(0, 10) as u32;
    Duration::seconds(base.saturating_mul(1i64 << exp))
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue with an explicit idempotency key (None = no coalescing).
    async fn enqueue_keyed(
        &self,
        payload: JobPayload,
        idempotency_key: Option<String>,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueResult, QueueError>;

    /// Enqueue using the payload's own idempotency key.
    async fn enqueue(
        &self,
        payload: JobPayload,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueResult, QueueError> {
        let key = payload.idempotency_key();
        self.enqueue_keyed(payload, key, run_at, now).await
    }

    /// Claim up to `limit` due jobs from one queue for exclusive execution.
    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError>;

    async fn mark_succeeded(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Schedule a retry with backoff, or dead-letter after max attempts.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError>;

    /// Dead-letter immediately, bypassing remaining attempts. Used for
    /// invariant violations where a retry cannot succeed.
    async fn dead_letter(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// PENDING + RUNNING rows in one queue.
    async fn depth(&self, queue: QueueName) -> Result<i64, QueueError>;

    async fn dead_letter_count(&self) -> Result<i64, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        assert_eq!(retry_delay(QueueName::Email, 1), Duration::seconds(30));
        assert_eq!(retry_delay(QueueName::Email, 2), Duration::seconds(60));
        assert_eq!(retry_delay(QueueName::Email, 3), Duration::seconds(120));

        assert_eq!(retry_delay(QueueName::Release, 1), Duration::seconds(60));
        assert_eq!(retry_delay(QueueName::Release, 2), Duration::seconds(120));
        assert_eq!(retry_delay(QueueName::Escalation, 3), Duration::seconds(240));
    }

    #[test]
    fn retry_delay_is_clamped_against_overflow() {
        let d = retry_delay(QueueName::Email, 40);
        assert_eq!(d, Duration::seconds(30 * 1024));
    }
}
