//! Append-only audit events with an optional per-user SHA-256 hash chain.
//!
//! Events are canonicalized (recursively sorted keys, compact JSON) before
//! hashing so the chain is stable across serializer versions. `hash_self`
//! covers the event with its own `hash_self` nulled; `hash_prev` points at
//! the previous event of the same user. One event == one JSON line in
//! exports.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use esn_schemas::AuditKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    /// None for system-stream events (e.g. dead-lettered jobs with no
    /// resolvable owner). Each user, and the system stream, chains
    /// independently.
    pub user_id: Option<Uuid>,
    pub ts_utc: DateTime<Utc>,
    /// `AuditKind::as_str` value; stored as text so the log outlives enum
    /// reshuffles.
    pub kind: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

impl AuditEvent {
    /// Build a chained event: `hash_prev` is the previous event's
    /// `hash_self`, `hash_self` is computed over this event.
    pub fn chained(
        event_id: Uuid,
        user_id: Option<Uuid>,
        ts_utc: DateTime<Utc>,
        kind: AuditKind,
        payload: Value,
        hash_prev: Option<String>,
    ) -> Result<Self> {
        let mut ev = Self {
            event_id,
            user_id,
            ts_utc,
            kind: kind.as_str().to_string(),
            payload,
            hash_prev,
            hash_self: None,
        };
        let h = compute_event_hash(&ev)?;
        ev.hash_self = Some(h);
        Ok(ev)
    }
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
pub fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash over canonical JSON of the event WITHOUT hash_self (no
/// self-reference).
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Result of hash chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

/// Verify a single user's exported chain (JSONL, oldest first).
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let ev: AuditEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit event at line {}", i + 1))?;

        line_count += 1;

        if ev.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, ev.hash_prev
                ),
            });
        }

        if let Some(ref claimed) = ev.hash_self {
            let recomputed = compute_event_hash(&ev)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {}, recomputed {}", claimed, recomputed),
                });
            }
        }

        prev_hash = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

/// Export a slice of events (one user, oldest first) as JSONL.
pub fn export_jsonl(events: &[AuditEvent]) -> Result<String> {
    let mut out = String::new();
    for ev in events {
        out.push_str(&canonical_json_line(ev)?);
        out.push('\n');
    }
    Ok(out)
}
