//! Queue-driven worker pool.
//!
//! Each queue gets exactly `concurrency_cap` single-job loops; the release
//! queue gets one, so every release on the deployment is serialized. A job
//! gets a wall-clock budget; exceeding it aborts the attempt and the queue
//! retries. Graceful shutdown stops claiming and lets in-flight jobs
//! finish.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use esn_queue::FailureOutcome;
use esn_schemas::jobs::ALL_QUEUES;
use esn_schemas::QueueName;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::handlers::{execute, job_user_id, WorkerContext, WorkerError};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap for every queue except `release` (which is pinned to 1).
    pub default_concurrency: usize,
    /// Per-job wall-clock budget.
    pub job_budget: StdDuration,
    /// Sleep between claim probes on an empty queue.
    pub idle_poll: StdDuration,
    /// Claimer identity recorded on jobs.
    pub worker_id: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            job_budget: StdDuration::from_secs(30),
            idle_poll: StdDuration::from_secs(1),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    cfg: PoolConfig,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, cfg: PoolConfig) -> Self {
        Self { ctx, cfg }
    }

    /// Run all queue loops until shutdown, then drain in-flight jobs.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut loops = JoinSet::new();

        for queue in ALL_QUEUES {
            let cap = queue.concurrency_cap(self.cfg.default_concurrency);
            for slot in 0..cap {
                let ctx = Arc::clone(&self.ctx);
                let cfg = self.cfg.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("{}/{}#{slot}", cfg.worker_id, queue.as_str());
                loops.spawn(async move {
                    queue_loop(ctx, queue, worker_id, cfg, shutdown).await;
                });
            }
        }

        info!(concurrency = self.cfg.default_concurrency, "worker pool running");
        while loops.join_next().await.is_some() {}
        info!("worker pool stopped");
        Ok(())
    }
}

/// One claim-execute loop; a single job in flight at a time.
async fn queue_loop(
    ctx: Arc<WorkerContext>,
    queue: QueueName,
    worker_id: String,
    cfg: PoolConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = ctx.clock.now();
        let claimed = match ctx.queue.claim(queue, &worker_id, 1, now).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(queue = queue.as_str(), error = %e, "claim failed");
                Vec::new()
            }
        };

        match claimed.into_iter().next() {
            Some(job) => process_one(&ctx, &job, cfg.job_budget).await,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(cfg.idle_poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Execute one job within budget and settle its queue state.
pub async fn process_one(ctx: &WorkerContext, job: &esn_queue::Job, budget: StdDuration) {
    let result = tokio::time::timeout(budget, execute(ctx, job)).await;
    let now = ctx.clock.now();

    let failure: String = match result {
        Ok(Ok(())) => {
            if let Err(e) = ctx.queue.mark_succeeded(job.id, now).await {
                warn!(job_id = %job.id, error = %e, "mark_succeeded failed");
            }
            return;
        }
        Ok(Err(WorkerError::Fatal(msg))) => {
            warn!(job_id = %job.id, queue = job.queue.as_str(), error = %msg, "fatal job failure");
            if let Err(e) = ctx.queue.dead_letter(job.id, &msg, now).await {
                warn!(job_id = %job.id, error = %e, "dead_letter failed");
            }
            record_dead_letter(ctx, job, &msg).await;
            return;
        }
        Ok(Err(WorkerError::Retriable(msg))) => msg,
        Err(_) => "job wall-clock budget exceeded".to_string(),
    };

    match ctx.queue.mark_failed(job.id, &failure, now).await {
        Ok(FailureOutcome::Retrying { next_run_at }) => {
            warn!(job_id = %job.id, queue = job.queue.as_str(), error = %failure,
                  retry_at = %next_run_at, "job failed; retrying");
        }
        Ok(FailureOutcome::DeadLettered) => {
            warn!(job_id = %job.id, queue = job.queue.as_str(), error = %failure,
                  "job dead-lettered after max attempts");
            record_dead_letter(ctx, job, &failure).await;
        }
        Err(e) => warn!(job_id = %job.id, error = %e, "mark_failed failed"),
    }
}

async fn record_dead_letter(ctx: &WorkerContext, job: &esn_queue::Job, error: &str) {
    let now = ctx.clock.now();
    if let Err(e) = ctx
        .store
        .append_job_failure(job_user_id(job), job.queue.as_str(), job.id, error, now)
        .await
    {
        warn!(job_id = %job.id, error = %e, "JOB_FAILED audit append failed");
    }
}
