//! Job handlers for the five queues.
//!
//! Every handler is idempotent and re-entrant: the compound store ops
//! short-circuit on already-resolved state, so a redelivered job converges
//! to the same outcome. Handlers never swallow errors: a failure aborts
//! the job and the queue retries or dead-letters it.

use std::sync::Arc;

use esn_db::{EscalationOutcome, ReleaseOutcome, StateStore, StoreError};
use esn_queue::{Job, JobQueue};
use esn_schemas::{
    jobs, CheckInStatus, Clock, JobPayload, PollingStatus, ReleaseCause, TokenGenerator,
    CHECK_IN_TOKEN_BYTES,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::transports::{EmailMessage, EmailTransport, SmsMessage, SmsTransport, TransportError};

/// Everything a handler needs, shared across the pool.
pub struct WorkerContext {
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn JobQueue>,
    pub clock: Arc<dyn Clock>,
    pub tokens: Arc<dyn TokenGenerator>,
    pub email: Arc<dyn EmailTransport>,
    pub sms: Arc<dyn SmsTransport>,
    pub base_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Transient failure; the queue retries with backoff.
    #[error("{0}")]
    Retriable(String),
    /// Invariant violation; the job dead-letters immediately.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<StoreError> for WorkerError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::Invariant(_) => WorkerError::Fatal(e.to_string()),
            _ if e.retriable() => WorkerError::Retriable(e.to_string()),
            // Semantic errors (NotFound etc.) on a worker path mean the
            // underlying rows moved; retrying cannot help.
            _ => WorkerError::Fatal(e.to_string()),
        }
    }
}

impl From<esn_queue::QueueError> for WorkerError {
    fn from(e: esn_queue::QueueError) -> Self {
        WorkerError::Retriable(e.to_string())
    }
}

impl From<TransportError> for WorkerError {
    fn from(e: TransportError) -> Self {
        // Unresolvable recipients stay retriable: the user may add a phone
        // number before attempts run out, and the channel drops after.
        WorkerError::Retriable(e.to_string())
    }
}

/// Execute one claimed job to completion.
pub async fn execute(ctx: &WorkerContext, job: &Job) -> Result<(), WorkerError> {
    match &job.payload {
        JobPayload::CheckIn { check_in_id } => run_check_in(ctx, *check_in_id).await,
        JobPayload::Escalation {
            user_id,
            level,
            expected_missed_count,
        } => run_escalation(ctx, *user_id, *level, *expected_missed_count).await,
        JobPayload::Release { user_id, cause } => run_release(ctx, *user_id, *cause).await,
        JobPayload::Email {
            to,
            subject,
            html,
            text,
        } => {
            let msg = EmailMessage {
                to: to.clone(),
                subject: subject.clone(),
                html: html.clone(),
                text: text.clone(),
            };
            ctx.email.send_email(&msg).await?;
            Ok(())
        }
        JobPayload::Sms { to, message } => {
            let msg = SmsMessage {
                to: to.clone(),
                message: message.clone(),
            };
            ctx.sms.send_sms(&msg).await?;
            Ok(())
        }
    }
}

/// The user id a job is about, for dead-letter audit attribution.
pub fn job_user_id(job: &Job) -> Option<Uuid> {
    match &job.payload {
        JobPayload::Escalation { user_id, .. } | JobPayload::Release { user_id, .. } => {
            Some(*user_id)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// checkin: materialize notifications for a pending check-in
// ---------------------------------------------------------------------------

async fn run_check_in(ctx: &WorkerContext, check_in_id: Uuid) -> Result<(), WorkerError> {
    let now = ctx.clock.now();

    let ci = match ctx.store.get_check_in(check_in_id).await {
        Ok(ci) => ci,
        // Cascade-deleted user; nothing to notify.
        Err(StoreError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if ci.status != CheckInStatus::Pending {
        debug!(check_in_id = %ci.id, status = ci.status.as_str(), "check-in already resolved");
        return Ok(());
    }

    let cfg = ctx.store.get_polling_config(ci.user_id).await?;
    if matches!(cfg.status, PollingStatus::Paused | PollingStatus::Triggered) {
        return Ok(());
    }
    let user = ctx.store.get_user(ci.user_id).await?;

    // Hand off per channel; delivery is the transport queues' problem.
    if cfg.email_enabled {
        let payload = jobs::check_in_email(&user.display_name, &user.email, cfg.status, &ctx.base_url, &ci);
        ctx.queue
            .enqueue_keyed(payload, Some(format!("notify-checkin-email:{}", ci.id)), now, now)
            .await?;
    }
    if cfg.sms_enabled {
        // May enqueue with no phone on file; the transport then fails
        // retriably until the channel drops out (sent_via records attempts).
        let phone = cfg.phone.as_deref().unwrap_or_default();
        let payload = jobs::check_in_sms(phone, &ctx.base_url, &ci);
        ctx.queue
            .enqueue_keyed(payload, Some(format!("notify-checkin-sms:{}", ci.id)), now, now)
            .await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// escalation: apply a Miss transition
// ---------------------------------------------------------------------------

async fn run_escalation(
    ctx: &WorkerContext,
    user_id: Uuid,
    level: u8,
    expected_missed_count: i32,
) -> Result<(), WorkerError> {
    let now = ctx.clock.now();
    let token = ctx.tokens.mint(CHECK_IN_TOKEN_BYTES);

    match ctx
        .store
        .apply_miss_escalation(user_id, expected_missed_count, now, token)
        .await?
    {
        EscalationOutcome::Applied {
            config,
            check_in,
            release_after,
        } => {
            info!(user_id = %user_id, level, status = config.status.as_str(), "escalated");

            // The grace check-in's notification doubles as the warning.
            ctx.queue
                .enqueue(JobPayload::CheckIn { check_in_id: check_in.id }, now, now)
                .await?;

            // Entering the final grace window arms the release; the
            // idempotency key guarantees a single execution even though the
            // timeout sweep is also watching.
            if let Some(after) = release_after {
                ctx.queue
                    .enqueue(
                        JobPayload::Release {
                            user_id,
                            cause: ReleaseCause::GraceTimeout,
                        },
                        now + after,
                        now,
                    )
                    .await?;
            }
            Ok(())
        }
        EscalationOutcome::Stale => {
            debug!(user_id = %user_id, level, expected_missed_count, "stale escalation skipped");
            Ok(())
        }
        EscalationOutcome::Skipped { status } => {
            debug!(user_id = %user_id, status = status.as_str(), "escalation not applicable");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// release: the death protocol
// ---------------------------------------------------------------------------

async fn run_release(
    ctx: &WorkerContext,
    user_id: Uuid,
    cause: ReleaseCause,
) -> Result<(), WorkerError> {
    let now = ctx.clock.now();

    let (trustees, letters) = match ctx
        .store
        .execute_release(user_id, cause, now, ctx.tokens.as_ref())
        .await?
    {
        ReleaseOutcome::Released {
            trustees, letters, ..
        } => (trustees, letters),
        ReleaseOutcome::AlreadyTriggered => {
            debug!(user_id = %user_id, "release re-entry; already triggered");
            return Ok(());
        }
        ReleaseOutcome::NotEligible { status } => {
            info!(user_id = %user_id, status = status.as_str(), "release aborted; user is alive");
            return Ok(());
        }
    };

    info!(
        user_id = %user_id,
        trustees = trustees.len(),
        letters = letters.len(),
        "death protocol committed"
    );

    // Post-commit fan-out. A crash in this loop is recovered by the
    // scheduler's notification scan; tokens are never re-minted.
    let user = ctx.store.get_user(user_id).await?;
    let now = ctx.clock.now();

    for trustee in &trustees {
        let (email, key) = jobs::trustee_access_email(&user.display_name, trustee, &ctx.base_url);
        ctx.queue.enqueue_keyed(email, Some(key), now, now).await?;
        if let Some((sms, key)) = jobs::trustee_access_sms(trustee, &ctx.base_url) {
            ctx.queue.enqueue_keyed(sms, Some(key), now, now).await?;
        }
        ctx.store.mark_trustee_notified(trustee.id, now).await?;
    }

    for letter in &letters {
        let (email, key) = jobs::final_letter_email(&user.display_name, letter);
        ctx.queue.enqueue_keyed(email, Some(key), now, now).await?;
        // Follow-up transaction keyed by letter id; repeat calls no-op.
        ctx.store.mark_letter_delivered(letter.id, now).await?;
    }

    Ok(())
}
