//! esn-schemas
//!
//! Shared domain types for the liveness-and-release core: entity rows,
//! status enums (string-typed in Postgres), job payloads, and the small
//! injected seams (`Clock`, `TokenGenerator`) that keep the scheduler and
//! workers deterministic under test.
//!
//! No business logic lives here; transitions belong to `esn-escalation`,
//! persistence to `esn-db`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod clock;
pub mod jobs;
pub mod tokens;

pub use clock::{Clock, SystemClock};
pub use jobs::{JobPayload, QueueName, ReleaseCause};
pub use tokens::{SecureTokens, TokenGenerator, ACCESS_TOKEN_BYTES, CHECK_IN_TOKEN_BYTES};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Polling interval
// ---------------------------------------------------------------------------

/// Check-in cadence. The response window is how long a check-in stays
/// answerable before it counts as missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollInterval {
    Weekly,
    Biweekly,
    Monthly,
}

impl PollInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollInterval::Weekly => "WEEKLY",
            PollInterval::Biweekly => "BIWEEKLY",
            PollInterval::Monthly => "MONTHLY",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "WEEKLY" => Ok(PollInterval::Weekly),
            "BIWEEKLY" => Ok(PollInterval::Biweekly),
            "MONTHLY" => Ok(PollInterval::Monthly),
            other => Err(anyhow!("invalid poll interval: {}", other)),
        }
    }

    /// Time between check-ins.
    pub fn period(&self) -> Duration {
        match self {
            PollInterval::Weekly => Duration::days(7),
            PollInterval::Biweekly => Duration::days(14),
            PollInterval::Monthly => Duration::days(30),
        }
    }

    /// How long a freshly issued check-in remains answerable.
    pub fn response_window(&self) -> Duration {
        match self {
            PollInterval::Weekly => Duration::days(3),
            PollInterval::Biweekly => Duration::days(5),
            PollInterval::Monthly => Duration::days(7),
        }
    }
}

// ---------------------------------------------------------------------------
// Polling status
// ---------------------------------------------------------------------------

/// Per-user escalation state. TRIGGERED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollingStatus {
    Active,
    Paused,
    Grace1,
    Grace2,
    Grace3,
    Triggered,
}

impl PollingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollingStatus::Active => "ACTIVE",
            PollingStatus::Paused => "PAUSED",
            PollingStatus::Grace1 => "GRACE_1",
            PollingStatus::Grace2 => "GRACE_2",
            PollingStatus::Grace3 => "GRACE_3",
            PollingStatus::Triggered => "TRIGGERED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(PollingStatus::Active),
            "PAUSED" => Ok(PollingStatus::Paused),
            "GRACE_1" => Ok(PollingStatus::Grace1),
            "GRACE_2" => Ok(PollingStatus::Grace2),
            "GRACE_3" => Ok(PollingStatus::Grace3),
            "TRIGGERED" => Ok(PollingStatus::Triggered),
            other => Err(anyhow!("invalid polling status: {}", other)),
        }
    }

    /// Grace depth (1–3) when in a grace state.
    pub fn grace_level(&self) -> Option<u8> {
        match self {
            PollingStatus::Grace1 => Some(1),
            PollingStatus::Grace2 => Some(2),
            PollingStatus::Grace3 => Some(3),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PollingStatus::Triggered)
    }

    /// Escalation level a fresh miss in this state moves into: 1 from
    /// ACTIVE, 2 from GRACE_1, 3 from GRACE_2/GRACE_3. None when paused or
    /// terminal (the expiry scan skips those).
    pub fn next_escalation_level(&self) -> Option<u8> {
        match self {
            PollingStatus::Active => Some(1),
            PollingStatus::Grace1 => Some(2),
            PollingStatus::Grace2 | PollingStatus::Grace3 => Some(3),
            PollingStatus::Paused | PollingStatus::Triggered => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PollingConfig
// ---------------------------------------------------------------------------

/// One per user. Owned by the escalation state machine: every mutation goes
/// through `esn_escalation::step` under the user's row lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub user_id: Uuid,
    pub interval: PollInterval,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    /// Destination for check-in SMS. May be absent even with SMS enabled;
    /// the transport then fails retriably and the channel drops out after
    /// max attempts.
    pub phone: Option<String>,
    /// Grace window lengths in days, each 1–30.
    pub grace_period_1_days: i64,
    pub grace_period_2_days: i64,
    pub grace_period_3_days: i64,
    /// Reset to 0 on every confirmation; nondecreasing between confirmations.
    pub current_missed_check_ins: i32,
    pub last_check_in_at: Option<DateTime<Utc>>,
    pub next_check_in_due: DateTime<Utc>,
    pub status: PollingStatus,
    pub triggered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PollingConfig {
    /// Fresh config with the default 7/14/7 grace ladder.
    pub fn new(user_id: Uuid, interval: PollInterval, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            interval,
            email_enabled: true,
            sms_enabled: false,
            phone: None,
            grace_period_1_days: 7,
            grace_period_2_days: 14,
            grace_period_3_days: 7,
            current_missed_check_ins: 0,
            last_check_in_at: None,
            next_check_in_due: now + interval.period(),
            status: PollingStatus::Active,
            triggered_at: None,
            updated_at: now,
        }
    }

    /// Duration of the given grace window (level 1–3).
    pub fn grace_period(&self, level: u8) -> Duration {
        let days = match level {
            1 => self.grace_period_1_days,
            2 => self.grace_period_2_days,
            _ => self.grace_period_3_days,
        };
        Duration::days(days)
    }

    pub fn enabled_channels(&self) -> Vec<Channel> {
        let mut out = Vec::new();
        if self.email_enabled {
            out.push(Channel::Email);
        }
        if self.sms_enabled {
            out.push(Channel::Sms);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// CheckIn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckInStatus {
    Pending,
    Confirmed,
    Missed,
    Cancelled,
}

impl CheckInStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInStatus::Pending => "PENDING",
            CheckInStatus::Confirmed => "CONFIRMED",
            CheckInStatus::Missed => "MISSED",
            CheckInStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(CheckInStatus::Pending),
            "CONFIRMED" => Ok(CheckInStatus::Confirmed),
            "MISSED" => Ok(CheckInStatus::Missed),
            "CANCELLED" => Ok(CheckInStatus::Cancelled),
            other => Err(anyhow!("invalid check-in status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            other => Err(anyhow!("invalid channel: {}", other)),
        }
    }
}

/// A time-bounded liveness prompt. PENDING rows are mutated exactly once
/// (confirm, expiry sweep, or cancellation), then frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Single-use, URL-safe, unique across all check-ins.
    pub token: String,
    pub status: CheckInStatus,
    /// Channels that were attempted (not necessarily delivered).
    pub sent_via: Vec<Channel>,
    pub sent_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trustee
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrusteeStatus {
    Pending,
    Verified,
    Active,
    Revoked,
}

impl TrusteeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrusteeStatus::Pending => "PENDING",
            TrusteeStatus::Verified => "VERIFIED",
            TrusteeStatus::Active => "ACTIVE",
            TrusteeStatus::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TrusteeStatus::Pending),
            "VERIFIED" => Ok(TrusteeStatus::Verified),
            "ACTIVE" => Ok(TrusteeStatus::Active),
            "REVOKED" => Ok(TrusteeStatus::Revoked),
            other => Err(anyhow!("invalid trustee status: {}", other)),
        }
    }

    /// Only VERIFIED and ACTIVE trustees receive access at release time.
    pub fn eligible_for_release(&self) -> bool {
        matches!(self, TrusteeStatus::Verified | TrusteeStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trustee {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub relationship: String,
    pub status: TrusteeStatus,
    /// Single-use; NULLed on verification and never reissued to the same row.
    pub verification_token: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Set only by release. access_token != None implies status = ACTIVE.
    pub access_token: Option<String>,
    pub access_granted_at: Option<DateTime<Utc>>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FinalLetter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LetterStatus {
    Draft,
    Ready,
    Delivered,
}

impl LetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LetterStatus::Draft => "DRAFT",
            LetterStatus::Ready => "READY",
            LetterStatus::Delivered => "DELIVERED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "DRAFT" => Ok(LetterStatus::Draft),
            "READY" => Ok(LetterStatus::Ready),
            "DELIVERED" => Ok(LetterStatus::Delivered),
            other => Err(anyhow!("invalid letter status: {}", other)),
        }
    }
}

/// Pre-composed farewell message. Body is ciphertext; the core never holds
/// the plaintext or the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalLetter {
    pub id: Uuid,
    pub user_id: Uuid,
    pub recipient_name: String,
    pub recipient_email: String,
    pub subject: String,
    pub encrypted_body: String,
    pub nonce: String,
    pub status: LetterStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Vault (opaque read model)
// ---------------------------------------------------------------------------

/// Client-side-encrypted vault envelope. All fields are opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub user_id: Uuid,
    pub encrypted_master_key: String,
    pub master_key_salt: String,
    pub master_key_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_type: String,
    pub name: String,
    pub encrypted_data: String,
    pub nonce: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// The payload handed to a trustee with a live access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub encrypted_master_key: String,
    pub master_key_salt: String,
    pub master_key_nonce: String,
    pub items: Vec<VaultItem>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Append-only event vocabulary. Every state transition, administrative
/// override, escalation, release, and access grant lands here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    CheckInIssued,
    CheckInConfirmed,
    CheckInMissed,
    CheckInCancelled,
    EscalationLevel1,
    EscalationLevel2,
    EscalationLevel3,
    EscalationSkippedStale,
    PollingPaused,
    PollingResumed,
    AdminForceCheckIn,
    AdminTrigger,
    DeathProtocolTriggered,
    AccessGranted,
    TrusteeVerified,
    TrusteeNotified,
    LetterDelivered,
    JobFailed,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::CheckInIssued => "CHECK_IN_ISSUED",
            AuditKind::CheckInConfirmed => "CHECK_IN_CONFIRMED",
            AuditKind::CheckInMissed => "CHECK_IN_MISSED",
            AuditKind::CheckInCancelled => "CHECK_IN_CANCELLED",
            AuditKind::EscalationLevel1 => "ESCALATION_LEVEL_1",
            AuditKind::EscalationLevel2 => "ESCALATION_LEVEL_2",
            AuditKind::EscalationLevel3 => "ESCALATION_LEVEL_3",
            AuditKind::EscalationSkippedStale => "ESCALATION_SKIPPED_STALE",
            AuditKind::PollingPaused => "POLLING_PAUSED",
            AuditKind::PollingResumed => "POLLING_RESUMED",
            AuditKind::AdminForceCheckIn => "ADMIN_FORCE_CHECK_IN",
            AuditKind::AdminTrigger => "ADMIN_TRIGGER",
            AuditKind::DeathProtocolTriggered => "DEATH_PROTOCOL_TRIGGERED",
            AuditKind::AccessGranted => "ACCESS_GRANTED",
            AuditKind::TrusteeVerified => "TRUSTEE_VERIFIED",
            AuditKind::TrusteeNotified => "TRUSTEE_NOTIFIED",
            AuditKind::LetterDelivered => "LETTER_DELIVERED",
            AuditKind::JobFailed => "JOB_FAILED",
        }
    }

    pub fn escalation_level(level: u8) -> Self {
        match level {
            1 => AuditKind::EscalationLevel1,
            2 => AuditKind::EscalationLevel2,
            _ => AuditKind::EscalationLevel3,
        }
    }
}

/// Request context carried into audit entries on externally-driven paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observer {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Observer {
    pub fn system() -> Self {
        Self::default()
    }
}
