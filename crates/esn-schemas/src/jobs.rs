//! Job queue vocabulary: queue names, typed payloads, idempotency keys,
//! and the notification payload builders shared by the release worker and
//! the scheduler's post-release reconciliation scan.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CheckIn, FinalLetter, PollingStatus, Trustee};

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// The five logical queues. `Release` is globally serialized (cap 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    CheckIn,
    Escalation,
    Release,
    Email,
    Sms,
}

pub const ALL_QUEUES: [QueueName; 5] = [
    QueueName::CheckIn,
    QueueName::Escalation,
    QueueName::Release,
    QueueName::Email,
    QueueName::Sms,
];

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::CheckIn => "checkin",
            QueueName::Escalation => "escalation",
            QueueName::Release => "release",
            QueueName::Email => "email",
            QueueName::Sms => "sms",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "checkin" => Ok(QueueName::CheckIn),
            "escalation" => Ok(QueueName::Escalation),
            "release" => Ok(QueueName::Release),
            "email" => Ok(QueueName::Email),
            "sms" => Ok(QueueName::Sms),
            other => Err(anyhow!("invalid queue name: {}", other)),
        }
    }

    /// Exponential backoff base: 30 s for notification queues, 60 s for
    /// state-transition queues.
    pub fn backoff_base_secs(&self) -> i64 {
        match self {
            QueueName::CheckIn | QueueName::Email | QueueName::Sms => 30,
            QueueName::Escalation | QueueName::Release => 60,
        }
    }

    pub fn default_max_attempts(&self) -> i32 {
        match self {
            QueueName::Release => 5,
            _ => 3,
        }
    }

    /// Per-queue worker concurrency. All releases are serialized for safety.
    pub fn concurrency_cap(&self, default_cap: usize) -> usize {
        match self {
            QueueName::Release => 1,
            _ => default_cap.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Why a release job was enqueued; decides which state-machine event the
/// release worker applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCause {
    GraceTimeout,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    CheckIn {
        check_in_id: Uuid,
    },
    Escalation {
        user_id: Uuid,
        level: u8,
        /// `current_missed_check_ins` observed at enqueue time; the stale
        /// guard compares it against the live counter at apply time.
        expected_missed_count: i32,
    },
    Release {
        user_id: Uuid,
        cause: ReleaseCause,
    },
    Email {
        to: String,
        subject: String,
        html: String,
        text: String,
    },
    Sms {
        to: String,
        message: String,
    },
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::CheckIn { .. } => QueueName::CheckIn,
            JobPayload::Escalation { .. } => QueueName::Escalation,
            JobPayload::Release { .. } => QueueName::Release,
            JobPayload::Email { .. } => QueueName::Email,
            JobPayload::Sms { .. } => QueueName::Sms,
        }
    }

    /// Queue-level dedup identity. Notification payloads have none by
    /// default; release-path notifications get keys from the builders below.
    pub fn idempotency_key(&self) -> Option<String> {
        match self {
            JobPayload::CheckIn { check_in_id } => Some(format!("checkin:{check_in_id}")),
            JobPayload::Escalation {
                user_id,
                level,
                expected_missed_count,
            } => Some(format!("escalation:{user_id}:{level}:{expected_missed_count}")),
            JobPayload::Release { user_id, .. } => Some(format!("release:{user_id}")),
            JobPayload::Email { .. } | JobPayload::Sms { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification builders
// ---------------------------------------------------------------------------

/// Check-in link for a token.
pub fn check_in_url(base_url: &str, token: &str) -> String {
    format!("{}/checkin?token={}", base_url.trim_end_matches('/'), token)
}

/// Trustee vault-access link for an access token.
pub fn trustee_access_url(base_url: &str, access_token: &str) -> String {
    format!(
        "{}/trustee/access?token={}",
        base_url.trim_end_matches('/'),
        access_token
    )
}

/// Subject + copy vary with escalation depth; the link is the same.
pub fn check_in_email(
    user_name: &str,
    email: &str,
    status: PollingStatus,
    base_url: &str,
    check_in: &CheckIn,
) -> JobPayload {
    let url = check_in_url(base_url, &check_in.token);
    let (subject, lead) = match status.grace_level() {
        None => (
            "Your scheduled check-in".to_string(),
            "It's time for your scheduled check-in.".to_string(),
        ),
        Some(level) => (
            format!("Action required: missed check-in (warning {level} of 3)"),
            format!(
                "You missed a scheduled check-in. This is warning {level} of 3 before your \
                 emergency contacts are notified."
            ),
        ),
    };
    let expires = check_in.expires_at.to_rfc3339();
    JobPayload::Email {
        to: email.to_string(),
        subject,
        html: format!(
            "<p>Hi {user_name},</p><p>{lead}</p>\
             <p><a href=\"{url}\">Confirm you're OK</a></p>\
             <p>This link expires at {expires}.</p>"
        ),
        text: format!("Hi {user_name}, {lead} Confirm here: {url} (expires {expires})"),
    }
}

pub fn check_in_sms(phone: &str, base_url: &str, check_in: &CheckIn) -> JobPayload {
    let url = check_in_url(base_url, &check_in.token);
    JobPayload::Sms {
        to: phone.to_string(),
        message: format!("Eternal Sentinel check-in: confirm you're OK at {url}"),
    }
}

/// Access-grant email for a released trustee. Keyed per trustee so the
/// reconciliation scan can re-enqueue without duplicating sends.
pub fn trustee_access_email(user_name: &str, trustee: &Trustee, base_url: &str) -> (JobPayload, String) {
    let token = trustee.access_token.as_deref().unwrap_or_default();
    let url = trustee_access_url(base_url, token);
    let expires = trustee
        .access_expires_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    let payload = JobPayload::Email {
        to: trustee.email.clone(),
        subject: format!("{user_name} has entrusted you with their digital vault"),
        html: format!(
            "<p>Dear {},</p>\
             <p>{user_name} designated you as a trustee. Their vault is now available to you.</p>\
             <p><a href=\"{url}\">Open the vault</a></p>\
             <p>Access expires at {expires}.</p>",
            trustee.name
        ),
        text: format!(
            "Dear {}, {user_name} designated you as a trustee. Open the vault: {url} \
             (access expires {expires})",
            trustee.name
        ),
    };
    (payload, format!("trustee-notify:{}", trustee.id))
}

pub fn trustee_access_sms(trustee: &Trustee, base_url: &str) -> Option<(JobPayload, String)> {
    let phone = trustee.phone.as_deref()?;
    let token = trustee.access_token.as_deref().unwrap_or_default();
    let url = trustee_access_url(base_url, token);
    Some((
        JobPayload::Sms {
            to: phone.to_string(),
            message: format!("You have been granted vault access by a trustee designation: {url}"),
        },
        format!("trustee-notify-sms:{}", trustee.id),
    ))
}

/// Delivery email for a READY final letter. The body stays encrypted; the
/// mail carries a reference the recipient unlocks out of band.
pub fn final_letter_email(user_name: &str, letter: &FinalLetter) -> (JobPayload, String) {
    let payload = JobPayload::Email {
        to: letter.recipient_email.clone(),
        subject: letter.subject.clone(),
        html: format!(
            "<p>Dear {},</p>\
             <p>{user_name} left you a message. It is encrypted; use the key you were given \
             to read it.</p><pre>{}</pre>",
            letter.recipient_name, letter.encrypted_body
        ),
        text: format!(
            "Dear {}, {user_name} left you an encrypted message: {}",
            letter.recipient_name, letter.encrypted_body
        ),
    };
    (payload, format!("letter:{}", letter.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_routes_to_its_queue() {
        let p = JobPayload::Release {
            user_id: Uuid::new_v4(),
            cause: ReleaseCause::GraceTimeout,
        };
        assert_eq!(p.queue(), QueueName::Release);
        assert_eq!(QueueName::Release.default_max_attempts(), 5);
        assert_eq!(QueueName::Release.concurrency_cap(5), 1);
        assert_eq!(QueueName::Email.concurrency_cap(5), 5);
    }

    #[test]
    fn idempotency_keys_encode_identity() {
        let user = Uuid::new_v4();
        let p = JobPayload::Escalation {
            user_id: user,
            level: 2,
            expected_missed_count: 1,
        };
        assert_eq!(p.idempotency_key().unwrap(), format!("escalation:{user}:2:1"));

        let r = JobPayload::Release {
            user_id: user,
            cause: ReleaseCause::Admin,
        };
        assert_eq!(r.idempotency_key().unwrap(), format!("release:{user}"));
    }

    #[test]
    fn payload_json_round_trips_through_tag() {
        let p = JobPayload::CheckIn {
            check_in_id: Uuid::new_v4(),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "check_in");
        let back: JobPayload = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}
