//! Request and response types for all esn-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use chrono::{DateTime, Utc};
use esn_db::StatusCounts;
use esn_schemas::VaultSnapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health  /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queue: String,
    pub depth: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub configs: StatusCounts,
    pub queues: Vec<QueueDepth>,
    pub dead_lettered: i64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Machine-readable error body; `expired` is set only on expired-artifact
/// rejections so clients can branch without string matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<bool>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: None,
            expired: None,
        }
    }

    pub fn with_reason(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: Some(reason.into()),
            expired: None,
        }
    }

    pub fn expired() -> Self {
        Self {
            error: "expired".to_string(),
            reason: None,
            expired: Some(true),
        }
    }
}

// ---------------------------------------------------------------------------
// /checkin/*
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInStatusResponse {
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_check_in_due: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// /admin/*
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUserRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminActionResponse {
    pub user_id: Uuid,
    pub status: String,
}

// ---------------------------------------------------------------------------
// /trustee/access
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrusteeAccessRequest {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrusteeAccessInfoResponse {
    pub trustee_name: String,
    pub user_name: String,
    pub access_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrusteeVaultResponse {
    pub vault: VaultSnapshot,
    pub access_expires_at: DateTime<Utc>,
}
