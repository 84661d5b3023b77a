//! Postgres-backed `JobQueue`.
//!
//! The schema lives in `esn-db`'s migrations (`jobs` table). A partial
//! unique index admits one PENDING/RUNNING row per idempotency key;
//! completed keys coalesce at the application layer within
//! [`idempotency_window`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esn_schemas::{JobPayload, QueueName};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    idempotency_window, retry_delay, EnqueueResult, FailureOutcome, Job, JobQueue, JobStatus,
    QueueError,
};

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, QueueError> {
    let queue: String = row.try_get("queue")?;
    let status: String = row.try_get("status")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    Ok(Job {
        id: row.try_get("job_id")?,
        queue: QueueName::parse(&queue).map_err(|e| QueueError::Corrupt(e.to_string()))?,
        payload: serde_json::from_value(payload)
            .map_err(|e| QueueError::Corrupt(format!("payload: {e}")))?,
        status: JobStatus::parse(&status)?,
        run_at: row.try_get("run_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        idempotency_key: row.try_get("idempotency_key")?,
        last_error: row.try_get("last_error")?,
    })
}

const JOB_COLUMNS: &str =
    "job_id, queue, payload, status, run_at, attempts, max_attempts, idempotency_key, last_error";

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue_keyed(
        &self,
        payload: JobPayload,
        idempotency_key: Option<String>,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueResult, QueueError> {
        let queue = payload.queue();
        let payload_json = serde_json::to_value(&payload)
            .map_err(|e| QueueError::Corrupt(format!("payload: {e}")))?;

        if let Some(key) = &idempotency_key {
            // A run that completed within the window still swallows the
            // re-enqueue (covers double sweeps around a just-finished job).
            let recent: Option<(Uuid,)> = sqlx::query_as(
                r#"
                select job_id from jobs
                 where idempotency_key = $1
                   and status = 'SUCCEEDED'
                   and finished_at > $2
                 order by finished_at desc
                 limit 1
                "#,
            )
            .bind(key)
            .bind(now - idempotency_window())
            .fetch_optional(&self.pool)
            .await?;
            if let Some((id,)) = recent {
                return Ok(EnqueueResult::Coalesced(id));
            }
        }

        // The partial unique index collapses races between concurrent
        // enqueuers: exactly one live row per key survives.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            insert into jobs (job_id, queue, payload, status, run_at, attempts, max_attempts,
                              idempotency_key, created_at, updated_at)
            values ($1, $2, $3, 'PENDING', $4, 0, $5, $6, $7, $7)
            on conflict (idempotency_key) where status in ('PENDING','RUNNING') do nothing
            returning job_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue.as_str())
        .bind(&payload_json)
        .bind(run_at)
        .bind(queue.default_max_attempts())
        .bind(&idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(EnqueueResult::Created(id));
        }

        // Lost the conflict: surface the live holder of the key. A keyless
        // insert cannot conflict, so reaching here without one is a queue
        // backend fault.
        let Some(key) = idempotency_key else {
            return Err(QueueError::Unavailable(
                "keyless insert reported an idempotency conflict".to_string(),
            ));
        };
        let live: Option<(Uuid,)> = sqlx::query_as(
            r#"
            select job_id from jobs
             where idempotency_key = $1 and status in ('PENDING','RUNNING')
             limit 1
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        match live {
            Some((id,)) => Ok(EnqueueResult::Coalesced(id)),
            // The holder finished between our insert and this read; treat
            // as coalesced onto that just-finished run.
            None => {
                let finished: Option<(Uuid,)> = sqlx::query_as(
                    "select job_id from jobs where idempotency_key = $1 \
                     order by finished_at desc nulls last limit 1",
                )
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;
                finished
                    .map(|(id,)| EnqueueResult::Coalesced(id))
                    .ok_or_else(|| {
                        QueueError::Unavailable("idempotency conflict with no holder".to_string())
                    })
            }
        }
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            with to_claim as (
                select job_id
                  from jobs
                 where queue = $1 and status = 'PENDING' and run_at <= $2
                 order by run_at asc
                 limit $3
                 for update skip locked
            )
            update jobs
               set status     = 'RUNNING',
                   attempts   = attempts + 1,
                   claimed_by = $4,
                   updated_at = $2
             where job_id in (select job_id from to_claim)
            returning {JOB_COLUMNS}
            "#
        ))
        .bind(queue.as_str())
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn mark_succeeded(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let done = sqlx::query(
            r#"
            update jobs
               set status = 'SUCCEEDED', finished_at = $2, updated_at = $2
             where job_id = $1 and status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError> {
        let row = sqlx::query("select queue, attempts, max_attempts from jobs where job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::NotFound)?;

        let queue: String = row.try_get("queue")?;
        let queue = QueueName::parse(&queue).map_err(|e| QueueError::Corrupt(e.to_string()))?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;

        if attempts >= max_attempts {
            sqlx::query(
                r#"
                update jobs
                   set status = 'DEAD_LETTERED', last_error = $2, finished_at = $3, updated_at = $3
                 where job_id = $1 and status = 'RUNNING'
                "#,
            )
            .bind(job_id)
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .await?;
            return Ok(FailureOutcome::DeadLettered);
        }

        let next_run_at = now + retry_delay(queue, attempts);
        sqlx::query(
            r#"
            update jobs
               set status = 'PENDING', run_at = $2, last_error = $3,
                   claimed_by = null, updated_at = $4
             where job_id = $1 and status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(next_run_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(FailureOutcome::Retrying { next_run_at })
    }

    async fn dead_letter(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            update jobs
               set status = 'DEAD_LETTERED', last_error = $2, finished_at = $3, updated_at = $3
             where job_id = $1 and status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<i64, QueueError> {
        let (n,): (i64,) = sqlx::query_as(
            "select count(*)::bigint from jobs \
             where queue = $1 and status in ('PENDING','RUNNING')",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    async fn dead_letter_count(&self) -> Result<i64, QueueError> {
        let (n,): (i64,) = sqlx::query_as(
            "select count(*)::bigint from jobs where status = 'DEAD_LETTERED'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}
