//! The `StateStore` seam.
//!
//! Every compound operation here is atomic: it locks the owning user's
//! polling config row, invokes the pure state machine where a transition is
//! involved, applies the writes, and appends the audit entries, all in one
//! transaction. The scheduler, workers, and HTTP surface speak only this
//! trait, so tests can substitute the in-memory implementation from
//! `esn-testkit`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use esn_audit::AuditEvent;
use esn_schemas::{
    CheckIn, CheckInStatus, FinalLetter, Observer, PollInterval, PollingConfig, PollingStatus,
    ReleaseCause, TokenGenerator, Trustee, User, Vault, VaultSnapshot,
};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct NewTrustee {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub relationship: String,
}

#[derive(Debug, Clone)]
pub struct NewFinalLetter {
    pub user_id: Uuid,
    pub recipient_name: String,
    pub recipient_email: String,
    pub subject: String,
    pub encrypted_body: String,
    pub nonce: String,
    /// READY letters are deliverable at release; drafts stay behind.
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct NewVaultItem {
    pub item_type: String,
    pub name: String,
    pub encrypted_data: String,
    pub nonce: String,
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a successful confirmation (token or session path).
#[derive(Debug, Clone)]
pub struct CheckInConfirmation {
    pub user_id: Uuid,
    pub check_in_id: Uuid,
    pub next_check_in_due: DateTime<Utc>,
}

/// Public, unauthenticated view of a check-in token.
#[derive(Debug, Clone)]
pub struct CheckInStatusView {
    pub status: CheckInStatus,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
    pub user_name: String,
}

/// A PENDING check-in the expiry scan just froze as MISSED, with the owning
/// config so the caller can decide whether an escalation follows.
#[derive(Debug, Clone)]
pub struct ExpiredCheckIn {
    pub check_in: CheckIn,
    pub config: PollingConfig,
}

/// Result of applying a `Miss` event under the row lock.
#[derive(Debug, Clone)]
pub enum EscalationOutcome {
    /// The transition happened; a grace-period check-in was created. When
    /// the config just entered the final grace state, `release_after`
    /// carries the delay for arming the release job.
    Applied {
        config: PollingConfig,
        check_in: CheckIn,
        release_after: Option<Duration>,
    },
    /// The counter moved since enqueue (confirmation or admin reset); an
    /// `ESCALATION_SKIPPED_STALE` audit entry was appended, nothing else.
    Stale,
    /// The config is paused or terminal; nothing to do.
    Skipped { status: PollingStatus },
}

/// Result of the release procedure.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    /// Terminal transition committed; trustees carry fresh access tokens,
    /// letters are the READY set to deliver.
    Released {
        config: PollingConfig,
        trustees: Vec<Trustee>,
        letters: Vec<FinalLetter>,
    },
    /// A previous run already committed; re-entry is a no-op.
    AlreadyTriggered,
    /// The config left the release-eligible state before the job ran (the
    /// user confirmed during the final grace window).
    NotEligible { status: PollingStatus },
}

/// Deployment-level counters for the status endpoint.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StatusCounts {
    pub active: i64,
    pub paused: i64,
    pub grace_1: i64,
    pub grace_2: i64,
    pub grace_3: i64,
    pub triggered: i64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateStore: Send + Sync {
    // --- users & setup -----------------------------------------------------

    /// Create a user with its polling config (`ACTIVE`, first check-in one
    /// full period out).
    async fn create_user(
        &self,
        new: NewUser,
        interval: PollInterval,
        now: DateTime<Utc>,
    ) -> Result<User, StoreError>;

    async fn get_user(&self, user_id: Uuid) -> Result<User, StoreError>;

    async fn get_polling_config(&self, user_id: Uuid) -> Result<PollingConfig, StoreError>;

    async fn set_channels(
        &self,
        user_id: Uuid,
        email_enabled: bool,
        sms_enabled: bool,
        phone: Option<String>,
    ) -> Result<(), StoreError>;

    // --- check-ins ---------------------------------------------------------

    async fn get_check_in(&self, check_in_id: Uuid) -> Result<CheckIn, StoreError>;

    async fn check_in_status(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckInStatusView, StoreError>;

    /// Token-path confirmation. Errors: `NotFound`, `AlreadyResolved`,
    /// `Expired` (which freezes the row as MISSED as a side effect).
    async fn confirm_check_in(
        &self,
        token: &str,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<CheckInConfirmation, StoreError>;

    /// Authenticated manual confirmation: confirms the user's newest
    /// PENDING check-in (cancelling older PENDING rows) and resets the
    /// config identically to the token path.
    async fn confirm_latest_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<CheckInConfirmation, StoreError>;

    // --- scheduler scans ---------------------------------------------------

    /// ACTIVE configs whose next check-in is due.
    async fn due_polling_configs(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<PollingConfig>, StoreError>;

    /// Issue the due check-in for one user. Returns None if the due
    /// condition no longer holds (another sweep got there first).
    async fn issue_due_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        token: String,
    ) -> Result<Option<CheckIn>, StoreError>;

    /// PENDING check-ins whose response window has closed.
    async fn expired_check_ins(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<CheckIn>, StoreError>;

    /// Freeze one expired check-in as MISSED. Returns None when already
    /// resolved (repeat sweeps are no-ops).
    async fn expire_check_in(
        &self,
        check_in_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredCheckIn>, StoreError>;

    /// GRACE_3 configs whose final grace window has fully elapsed.
    async fn grace3_timeouts(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<PollingConfig>, StoreError>;

    /// Released trustees (access token set) missing their TRUSTEE_NOTIFIED
    /// audit entry (the post-release crash-recovery scan).
    async fn unnotified_released_trustees(
        &self,
        batch: i64,
    ) -> Result<Vec<(Trustee, User)>, StoreError>;

    // --- escalation & release ----------------------------------------------

    async fn apply_miss_escalation(
        &self,
        user_id: Uuid,
        expected_missed_count: i32,
        now: DateTime<Utc>,
        token: String,
    ) -> Result<EscalationOutcome, StoreError>;

    /// The death protocol's single transaction: lock, short-circuit on
    /// TRIGGERED, grant eligible trustees, flip the terminal state, audit.
    /// Token minting is injected so tests stay deterministic.
    async fn execute_release(
        &self,
        user_id: Uuid,
        cause: ReleaseCause,
        now: DateTime<Utc>,
        tokens: &dyn TokenGenerator,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Follow-up transaction keyed by letter id; idempotent.
    async fn mark_letter_delivered(
        &self,
        letter_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append the TRUSTEE_NOTIFIED marker once per trustee; idempotent.
    async fn mark_trustee_notified(
        &self,
        trustee_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- administrative ----------------------------------------------------

    async fn pause_polling(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError>;

    async fn resume_polling(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError>;

    async fn admin_force_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError>;

    /// Audit the override; the caller enqueues the release job.
    async fn record_admin_trigger(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<(), StoreError>;

    // --- trustees, letters, vault -------------------------------------------

    async fn create_trustee(
        &self,
        new: NewTrustee,
        verification_token: String,
        now: DateTime<Utc>,
    ) -> Result<Trustee, StoreError>;

    /// Single-use: matches only PENDING rows, clears the token.
    async fn verify_trustee(&self, token: &str, now: DateTime<Utc>)
        -> Result<Trustee, StoreError>;

    async fn trustees_for_user(&self, user_id: Uuid) -> Result<Vec<Trustee>, StoreError>;

    async fn trustee_by_access_token(
        &self,
        access_token: &str,
    ) -> Result<(Trustee, User), StoreError>;

    async fn create_final_letter(
        &self,
        new: NewFinalLetter,
        now: DateTime<Utc>,
    ) -> Result<FinalLetter, StoreError>;

    async fn letters_for_user(&self, user_id: Uuid) -> Result<Vec<FinalLetter>, StoreError>;

    async fn put_vault(
        &self,
        vault: Vault,
        items: Vec<NewVaultItem>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn vault_for_user(&self, user_id: Uuid) -> Result<VaultSnapshot, StoreError>;

    // --- audit & operations -------------------------------------------------

    /// A user's audit chain, oldest first.
    async fn audit_events_for_user(&self, user_id: Uuid) -> Result<Vec<AuditEvent>, StoreError>;

    /// Dead-letter marker appended by the worker pool after max attempts.
    async fn append_job_failure(
        &self,
        user_id: Option<Uuid>,
        queue: &str,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;

    /// Singleton sweep gate. True when this holder owns the lease (fresh or
    /// renewed); false while a foreign live lease exists.
    async fn try_acquire_scheduler_lease(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn release_scheduler_lease(&self, holder: &str) -> Result<(), StoreError>;
}
