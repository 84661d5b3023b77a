//! esn-scheduler
//!
//! The single-instance periodic sweep. One pass runs four bounded subscans:
//!
//! 1. issue check-ins that have come due,
//! 2. freeze expired check-ins and enqueue their escalations,
//! 3. enqueue release for configs whose final grace window has elapsed,
//! 4. re-enqueue trustee notifications lost to a crash mid-release.
//!
//! The sweep is restartable and idempotent: per-row conditions are
//! re-verified under the row lock inside the store ops, and queue
//! idempotency keys collapse duplicate enqueues from overlapping passes.
//! Singleton-ness is enforced with an expiring lease row; a second instance
//! observing a live foreign lease skips its pass.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use esn_db::StateStore;
use esn_queue::JobQueue;
use esn_schemas::{jobs, Clock, JobPayload, ReleaseCause, TokenGenerator, CHECK_IN_TOKEN_BYTES};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sweep period.
    pub poll_interval: StdDuration,
    /// Rows per subscan pass.
    pub batch_size: i64,
    /// Lease holder identity (host + pid works well).
    pub holder: String,
    /// Public origin for links in notifications.
    pub base_url: String,
}

impl SchedulerConfig {
    /// Lease TTL: three missed sweeps and a crashed holder's lease lapses.
    pub fn lease_ttl(&self) -> Duration {
        Duration::milliseconds(self.poll_interval.as_millis() as i64 * 3)
    }
}

/// What one sweep did, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub check_ins_issued: usize,
    pub check_ins_expired: usize,
    pub escalations_enqueued: usize,
    pub releases_enqueued: usize,
    pub notifications_reenqueued: usize,
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenGenerator>,
    cfg: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenGenerator>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            tokens,
            cfg,
        }
    }

    /// One full pass over all four subscans. Row-level failures are logged
    /// and skipped; the next pass retries them.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let batch = self.cfg.batch_size;

        // --- 1. due check-ins ------------------------------------------------
        let now = self.clock.now();
        for cfg in self.store.due_polling_configs(now, batch).await? {
            let token = self.tokens.mint(CHECK_IN_TOKEN_BYTES);
            match self.store.issue_due_check_in(cfg.user_id, now, token).await {
                Ok(Some(ci)) => {
                    self.queue
                        .enqueue(JobPayload::CheckIn { check_in_id: ci.id }, now, now)
                        .await?;
                    report.check_ins_issued += 1;
                }
                Ok(None) => {} // another pass got there first
                Err(e) => warn!(user_id = %cfg.user_id, error = %e, "issue_due_check_in failed"),
            }
        }

        // --- 2. expired check-ins -------------------------------------------
        let now = self.clock.now();
        for ci in self.store.expired_check_ins(now, batch).await? {
            let expired = match self.store.expire_check_in(ci.id, now).await {
                Ok(Some(e)) => e,
                Ok(None) => continue,
                Err(e) => {
                    warn!(check_in_id = %ci.id, error = %e, "expire_check_in failed");
                    continue;
                }
            };
            report.check_ins_expired += 1;

            // Paused and triggered users never escalate from the sweep.
            let cfg = &expired.config;
            let Some(level) = cfg.status.next_escalation_level() else {
                debug!(user_id = %cfg.user_id, status = cfg.status.as_str(),
                       "missed check-in without escalation");
                continue;
            };
            self.queue
                .enqueue(
                    JobPayload::Escalation {
                        user_id: cfg.user_id,
                        level,
                        expected_missed_count: cfg.current_missed_check_ins,
                    },
                    now,
                    now,
                )
                .await?;
            report.escalations_enqueued += 1;
        }

        // --- 3. terminal grace timeout --------------------------------------
        let now = self.clock.now();
        for cfg in self.store.grace3_timeouts(now, batch).await? {
            self.queue
                .enqueue(
                    JobPayload::Release {
                        user_id: cfg.user_id,
                        cause: ReleaseCause::GraceTimeout,
                    },
                    now,
                    now,
                )
                .await?;
            report.releases_enqueued += 1;
        }

        // --- 4. post-release notification recovery ---------------------------
        let now = self.clock.now();
        for (trustee, user) in self.store.unnotified_released_trustees(batch).await? {
            let (email, key) = jobs::trustee_access_email(&user.display_name, &trustee, &self.cfg.base_url);
            self.queue.enqueue_keyed(email, Some(key), now, now).await?;
            if let Some((sms, key)) = jobs::trustee_access_sms(&trustee, &self.cfg.base_url) {
                self.queue.enqueue_keyed(sms, Some(key), now, now).await?;
            }
            if let Err(e) = self.store.mark_trustee_notified(trustee.id, now).await {
                warn!(trustee_id = %trustee.id, error = %e, "mark_trustee_notified failed");
            }
            report.notifications_reenqueued += 1;
        }

        if report != SweepReport::default() {
            info!(
                issued = report.check_ins_issued,
                expired = report.check_ins_expired,
                escalations = report.escalations_enqueued,
                releases = report.releases_enqueued,
                reenqueued = report.notifications_reenqueued,
                "sweep complete"
            );
        }
        Ok(report)
    }

    /// Lease-gated periodic loop. Completes the in-flight sweep on shutdown,
    /// then releases the lease.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(holder = %self.cfg.holder, period_ms = self.cfg.poll_interval.as_millis() as u64,
              "scheduler starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            match self
                .store
                .try_acquire_scheduler_lease(&self.cfg.holder, now, self.cfg.lease_ttl())
                .await
            {
                Ok(true) => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "sweep failed; retrying next period");
                    }
                }
                Ok(false) => debug!("scheduler lease held elsewhere; skipping sweep"),
                Err(e) => warn!(error = %e, "lease probe failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.store
            .release_scheduler_lease(&self.cfg.holder)
            .await
            .ok();
        info!("scheduler stopped");
        Ok(())
    }
}
