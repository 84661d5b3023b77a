//! `PgStore`, the production `StateStore`.
//!
//! Locking protocol: every read-modify-write involving a user's polling
//! config or check-ins takes `SELECT … FOR UPDATE` on the
//! `polling_configs` row FIRST, then touches dependent rows. Audit entries
//! are appended inside the same transaction so a commit is always
//! state + audit together.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use esn_audit::AuditEvent;
use esn_escalation::{step, Effect, Event};
use esn_schemas::{
    AuditKind, Channel, CheckIn, CheckInStatus, FinalLetter, LetterStatus, Observer, PollInterval,
    PollingConfig, PollingStatus, ReleaseCause, TokenGenerator, Trustee, TrusteeStatus, User,
    Vault, VaultItem, VaultSnapshot, ACCESS_TOKEN_BYTES,
};
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{
    CheckInConfirmation, CheckInStatusView, EscalationOutcome, ExpiredCheckIn, NewFinalLetter,
    NewTrustee, NewUser, NewVaultItem, ReleaseOutcome, StateStore, StatusCounts,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

type Tx<'a> = Transaction<'a, Postgres>;

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn config_from_row(row: &PgRow) -> Result<PollingConfig, StoreError> {
    let interval: String = row.try_get("poll_interval")?;
    let status: String = row.try_get("status")?;
    Ok(PollingConfig {
        user_id: row.try_get("user_id")?,
        interval: PollInterval::parse(&interval)
            .map_err(|e| StoreError::Invariant(e.to_string()))?,
        email_enabled: row.try_get("email_enabled")?,
        sms_enabled: row.try_get("sms_enabled")?,
        phone: row.try_get("phone")?,
        grace_period_1_days: row.try_get("grace_period_1_days")?,
        grace_period_2_days: row.try_get("grace_period_2_days")?,
        grace_period_3_days: row.try_get("grace_period_3_days")?,
        current_missed_check_ins: row.try_get("current_missed_check_ins")?,
        last_check_in_at: row.try_get("last_check_in_at")?,
        next_check_in_due: row.try_get("next_check_in_due")?,
        status: PollingStatus::parse(&status).map_err(|e| StoreError::Invariant(e.to_string()))?,
        triggered_at: row.try_get("triggered_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn check_in_from_row(row: &PgRow) -> Result<CheckIn, StoreError> {
    let status: String = row.try_get("status")?;
    let sent_via: Vec<String> = row.try_get("sent_via")?;
    let mut channels = Vec::with_capacity(sent_via.len());
    for s in &sent_via {
        channels.push(Channel::parse(s).map_err(|e| StoreError::Invariant(e.to_string()))?);
    }
    Ok(CheckIn {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        status: CheckInStatus::parse(&status).map_err(|e| StoreError::Invariant(e.to_string()))?,
        sent_via: channels,
        sent_at: row.try_get("sent_at")?,
        responded_at: row.try_get("responded_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn trustee_from_row(row: &PgRow) -> Result<Trustee, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Trustee {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        relationship: row.try_get("relationship")?,
        status: TrusteeStatus::parse(&status)
            .map_err(|e| StoreError::Invariant(e.to_string()))?,
        verification_token: row.try_get("verification_token")?,
        verified_at: row.try_get("verified_at")?,
        access_token: row.try_get("access_token")?,
        access_granted_at: row.try_get("access_granted_at")?,
        access_expires_at: row.try_get("access_expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn letter_from_row(row: &PgRow) -> Result<FinalLetter, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(FinalLetter {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        recipient_name: row.try_get("recipient_name")?,
        recipient_email: row.try_get("recipient_email")?,
        subject: row.try_get("subject")?,
        encrypted_body: row.try_get("encrypted_body")?,
        nonce: row.try_get("nonce")?,
        status: LetterStatus::parse(&status).map_err(|e| StoreError::Invariant(e.to_string()))?,
        delivered_at: row.try_get("delivered_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEvent, StoreError> {
    Ok(AuditEvent {
        event_id: row.try_get("event_id")?,
        user_id: row.try_get("user_id")?,
        ts_utc: row.try_get("ts_utc")?,
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
        hash_prev: row.try_get("hash_prev")?,
        hash_self: row.try_get("hash_self")?,
    })
}

const CONFIG_COLUMNS: &str = "user_id, poll_interval, email_enabled, sms_enabled, phone, \
     grace_period_1_days, grace_period_2_days, grace_period_3_days, \
     current_missed_check_ins, last_check_in_at, \
     next_check_in_due, status, triggered_at, updated_at";

const CHECK_IN_COLUMNS: &str =
    "id, user_id, token, status, sent_via, sent_at, responded_at, expires_at";

const TRUSTEE_COLUMNS: &str = "id, user_id, name, email, phone, relationship, status, \
     verification_token, verified_at, access_token, access_granted_at, access_expires_at, \
     created_at";

const LETTER_COLUMNS: &str = "id, user_id, recipient_name, recipient_email, subject, \
     encrypted_body, nonce, status, delivered_at, created_at";

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

/// Lock the user's config row; this is the per-user serialization point.
async fn lock_config(tx: &mut Tx<'_>, user_id: Uuid) -> Result<PollingConfig, StoreError> {
    let row = sqlx::query(&format!(
        "select {CONFIG_COLUMNS} from polling_configs where user_id = $1 for update"
    ))
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::NotFound("polling config"))?;

    config_from_row(&row)
}

/// Write back every mutable config field.
async fn persist_config(tx: &mut Tx<'_>, cfg: &PollingConfig) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        update polling_configs
           set status                   = $2,
               current_missed_check_ins = $3,
               last_check_in_at         = $4,
               next_check_in_due        = $5,
               triggered_at             = $6,
               updated_at               = $7
         where user_id = $1
        "#,
    )
    .bind(cfg.user_id)
    .bind(cfg.status.as_str())
    .bind(cfg.current_missed_check_ins)
    .bind(cfg.last_check_in_at)
    .bind(cfg.next_check_in_due)
    .bind(cfg.triggered_at)
    .bind(cfg.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_check_in_tx(tx: &mut Tx<'_>, ci: &CheckIn) -> Result<(), StoreError> {
    let sent_via: Vec<String> = ci.sent_via.iter().map(|c| c.as_str().to_string()).collect();
    sqlx::query(
        r#"
        insert into check_ins (id, user_id, token, status, sent_via, sent_at, responded_at, expires_at)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(ci.id)
    .bind(ci.user_id)
    .bind(&ci.token)
    .bind(ci.status.as_str())
    .bind(&sent_via)
    .bind(ci.sent_at)
    .bind(ci.responded_at)
    .bind(ci.expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Append one audit event, chained to the stream's last hash.
async fn append_audit_tx(
    tx: &mut Tx<'_>,
    user_id: Option<Uuid>,
    kind: AuditKind,
    payload: Value,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let prev: Option<(Option<String>,)> = sqlx::query_as(
        r#"
        select hash_self
          from audit_events
         where user_id is not distinct from $1
         order by seq desc
         limit 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;
    let hash_prev = prev.and_then(|(h,)| h);

    let ev = AuditEvent::chained(Uuid::new_v4(), user_id, now, kind, payload, hash_prev)
        .map_err(|e| StoreError::Invariant(e.to_string()))?;

    sqlx::query(
        r#"
        insert into audit_events (event_id, user_id, ts_utc, kind, payload, hash_prev, hash_self)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(ev.event_id)
    .bind(ev.user_id)
    .bind(ev.ts_utc)
    .bind(&ev.kind)
    .bind(&ev.payload)
    .bind(&ev.hash_prev)
    .bind(&ev.hash_self)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn new_pending_check_in(
    cfg: &PollingConfig,
    token: String,
    now: DateTime<Utc>,
    window: Duration,
) -> CheckIn {
    CheckIn {
        id: Uuid::new_v4(),
        user_id: cfg.user_id,
        token,
        status: CheckInStatus::Pending,
        sent_via: cfg.enabled_channels(),
        sent_at: now,
        responded_at: None,
        expires_at: now + window,
    }
}

fn observer_payload(observer: &Observer) -> Value {
    json!({ "ip": observer.ip, "user_agent": observer.user_agent })
}

/// Shared core of the token and session confirmation paths. Caller holds
/// the config lock and has verified the check-in is PENDING and unexpired.
async fn confirm_pending_tx(
    tx: &mut Tx<'_>,
    cfg: &PollingConfig,
    ci: &CheckIn,
    now: DateTime<Utc>,
    observer: &Observer,
) -> Result<CheckInConfirmation, StoreError> {
    sqlx::query(
        "update check_ins set status = 'CONFIRMED', responded_at = $2 where id = $1",
    )
    .bind(ci.id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    // Any other PENDING rows are now moot; cancel them so they cannot
    // expire into a spurious escalation after the user proved liveness.
    let cancelled: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        update check_ins
           set status = 'CANCELLED', responded_at = $3
         where user_id = $1 and id <> $2 and status = 'PENDING'
        returning id
        "#,
    )
    .bind(cfg.user_id)
    .bind(ci.id)
    .bind(now)
    .fetch_all(&mut **tx)
    .await?;

    let out = step(cfg, &Event::Confirm, now);
    persist_config(tx, &out.config).await?;

    for effect in &out.effects {
        if let Effect::Audit { kind } = effect {
            let mut payload = observer_payload(observer);
            payload["check_in_id"] = json!(ci.id);
            append_audit_tx(tx, Some(cfg.user_id), *kind, payload, now).await?;
        }
    }
    if !cancelled.is_empty() {
        let ids: Vec<Uuid> = cancelled.into_iter().map(|(id,)| id).collect();
        append_audit_tx(
            tx,
            Some(cfg.user_id),
            AuditKind::CheckInCancelled,
            json!({ "check_in_ids": ids }),
            now,
        )
        .await?;
    }

    Ok(CheckInConfirmation {
        user_id: cfg.user_id,
        check_in_id: ci.id,
        next_check_in_due: out.config.next_check_in_due,
    })
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[async_trait]
impl StateStore for PgStore {
    // --- users & setup -----------------------------------------------------

    async fn create_user(
        &self,
        new: NewUser,
        interval: PollInterval,
        now: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let mut tx = self.pool.begin().await?;

        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            display_name: new.display_name,
            created_at: now,
        };
        sqlx::query(
            "insert into users (id, email, display_name, created_at) values ($1, $2, $3, $4)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;

        let cfg = PollingConfig::new(user.id, interval, now);
        sqlx::query(
            r#"
            insert into polling_configs (
                user_id, poll_interval, email_enabled, sms_enabled, phone,
                grace_period_1_days, grace_period_2_days, grace_period_3_days,
                current_missed_check_ins,
                last_check_in_at, next_check_in_due, status, triggered_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(cfg.user_id)
        .bind(cfg.interval.as_str())
        .bind(cfg.email_enabled)
        .bind(cfg.sms_enabled)
        .bind(&cfg.phone)
        .bind(cfg.grace_period_1_days)
        .bind(cfg.grace_period_2_days)
        .bind(cfg.grace_period_3_days)
        .bind(cfg.current_missed_check_ins)
        .bind(cfg.last_check_in_at)
        .bind(cfg.next_check_in_due)
        .bind(cfg.status.as_str())
        .bind(cfg.triggered_at)
        .bind(cfg.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<User, StoreError> {
        let row = sqlx::query("select id, email, display_name, created_at from users where id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("user"))?;
        user_from_row(&row)
    }

    async fn get_polling_config(&self, user_id: Uuid) -> Result<PollingConfig, StoreError> {
        let row = sqlx::query(&format!(
            "select {CONFIG_COLUMNS} from polling_configs where user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("polling config"))?;
        config_from_row(&row)
    }

    async fn set_channels(
        &self,
        user_id: Uuid,
        email_enabled: bool,
        sms_enabled: bool,
        phone: Option<String>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            update polling_configs
               set email_enabled = $2, sms_enabled = $3, phone = $4
             where user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(email_enabled)
        .bind(sms_enabled)
        .bind(&phone)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("polling config"));
        }
        Ok(())
    }

    // --- check-ins ---------------------------------------------------------

    async fn get_check_in(&self, check_in_id: Uuid) -> Result<CheckIn, StoreError> {
        let row = sqlx::query(&format!(
            "select {CHECK_IN_COLUMNS} from check_ins where id = $1"
        ))
        .bind(check_in_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("check-in"))?;
        check_in_from_row(&row)
    }

    async fn check_in_status(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckInStatusView, StoreError> {
        let row = sqlx::query(
            r#"
            select c.status, c.expires_at, u.display_name
              from check_ins c
              join users u on u.id = c.user_id
             where c.token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("check-in"))?;

        let status: String = row.try_get("status")?;
        let status =
            CheckInStatus::parse(&status).map_err(|e| StoreError::Invariant(e.to_string()))?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        Ok(CheckInStatusView {
            status,
            expires_at,
            is_expired: status == CheckInStatus::Pending && expires_at <= now,
            user_name: row.try_get("display_name")?,
        })
    }

    async fn confirm_check_in(
        &self,
        token: &str,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<CheckInConfirmation, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Locate without a lock, then serialize on the owner's config row
        // and re-read. All check-in writers hold that lock, so the re-read
        // is stable.
        let row = sqlx::query("select user_id from check_ins where token = $1")
            .bind(token)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("check-in"))?;
        let user_id: Uuid = row.try_get("user_id")?;

        let cfg = lock_config(&mut tx, user_id).await?;

        let row = sqlx::query(&format!(
            "select {CHECK_IN_COLUMNS} from check_ins where token = $1"
        ))
        .bind(token)
        .fetch_one(&mut *tx)
        .await?;
        let ci = check_in_from_row(&row)?;

        if ci.status != CheckInStatus::Pending {
            return Err(StoreError::AlreadyResolved { status: ci.status });
        }
        if ci.expires_at <= now {
            // Freeze the row as MISSED as a side effect of the late attempt;
            // the expiry sweep would do the same on its next pass.
            sqlx::query("update check_ins set status = 'MISSED' where id = $1")
                .bind(ci.id)
                .execute(&mut *tx)
                .await?;
            append_audit_tx(
                &mut tx,
                Some(user_id),
                AuditKind::CheckInMissed,
                json!({ "check_in_id": ci.id, "late_confirmation_attempt": true }),
                now,
            )
            .await?;
            tx.commit().await?;
            return Err(StoreError::Expired);
        }

        let confirmation = confirm_pending_tx(&mut tx, &cfg, &ci, now, observer).await?;
        tx.commit().await?;
        Ok(confirmation)
    }

    async fn confirm_latest_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<CheckInConfirmation, StoreError> {
        let mut tx = self.pool.begin().await?;
        let cfg = lock_config(&mut tx, user_id).await?;

        let row = sqlx::query(&format!(
            "select {CHECK_IN_COLUMNS} from check_ins \
             where user_id = $1 and status = 'PENDING' \
             order by sent_at desc limit 1"
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("pending check-in"))?;
        let ci = check_in_from_row(&row)?;

        if ci.expires_at <= now {
            sqlx::query("update check_ins set status = 'MISSED' where id = $1")
                .bind(ci.id)
                .execute(&mut *tx)
                .await?;
            append_audit_tx(
                &mut tx,
                Some(user_id),
                AuditKind::CheckInMissed,
                json!({ "check_in_id": ci.id, "late_confirmation_attempt": true }),
                now,
            )
            .await?;
            tx.commit().await?;
            return Err(StoreError::Expired);
        }

        let confirmation = confirm_pending_tx(&mut tx, &cfg, &ci, now, observer).await?;
        tx.commit().await?;
        Ok(confirmation)
    }

    // --- scheduler scans ---------------------------------------------------

    async fn due_polling_configs(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<PollingConfig>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {CONFIG_COLUMNS} from polling_configs \
             where status = 'ACTIVE' and next_check_in_due <= $1 \
             order by next_check_in_due asc limit $2"
        ))
        .bind(now)
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(config_from_row).collect()
    }

    async fn issue_due_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        token: String,
    ) -> Result<Option<CheckIn>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let cfg = lock_config(&mut tx, user_id).await?;

        // Re-verify under the lock; an overlapping sweep or a confirmation
        // may have moved the due date.
        if cfg.status != PollingStatus::Active || cfg.next_check_in_due > now {
            return Ok(None);
        }

        let ci = new_pending_check_in(&cfg, token, now, cfg.interval.response_window());
        insert_check_in_tx(&mut tx, &ci).await?;

        let mut next = cfg.clone();
        next.next_check_in_due = now + cfg.interval.period();
        next.updated_at = now;
        persist_config(&mut tx, &next).await?;

        append_audit_tx(
            &mut tx,
            Some(user_id),
            AuditKind::CheckInIssued,
            json!({ "check_in_id": ci.id, "expires_at": ci.expires_at }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(Some(ci))
    }

    async fn expired_check_ins(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<CheckIn>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {CHECK_IN_COLUMNS} from check_ins \
             where status = 'PENDING' and expires_at <= $1 \
             order by expires_at asc limit $2"
        ))
        .bind(now)
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(check_in_from_row).collect()
    }

    async fn expire_check_in(
        &self,
        check_in_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredCheckIn>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("select user_id from check_ins where id = $1")
            .bind(check_in_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("check-in"))?;
        let user_id: Uuid = row.try_get("user_id")?;

        let cfg = lock_config(&mut tx, user_id).await?;

        let row = sqlx::query(&format!(
            "select {CHECK_IN_COLUMNS} from check_ins where id = $1"
        ))
        .bind(check_in_id)
        .fetch_one(&mut *tx)
        .await?;
        let ci = check_in_from_row(&row)?;

        if ci.status != CheckInStatus::Pending || ci.expires_at > now {
            return Ok(None);
        }

        sqlx::query("update check_ins set status = 'MISSED' where id = $1")
            .bind(ci.id)
            .execute(&mut *tx)
            .await?;
        append_audit_tx(
            &mut tx,
            Some(user_id),
            AuditKind::CheckInMissed,
            json!({ "check_in_id": ci.id }),
            now,
        )
        .await?;

        tx.commit().await?;

        let mut missed = ci;
        missed.status = CheckInStatus::Missed;
        Ok(Some(ExpiredCheckIn {
            check_in: missed,
            config: cfg,
        }))
    }

    async fn grace3_timeouts(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<PollingConfig>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {CONFIG_COLUMNS} from polling_configs \
             where status = 'GRACE_3' \
               and updated_at + make_interval(days => grace_period_3_days::int) <= $1 \
             order by updated_at asc limit $2"
        ))
        .bind(now)
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(config_from_row).collect()
    }

    async fn unnotified_released_trustees(
        &self,
        batch: i64,
    ) -> Result<Vec<(Trustee, User)>, StoreError> {
        let rows = sqlx::query(
            r#"
            select t.id, t.user_id, t.name, t.email, t.phone, t.relationship, t.status,
                   t.verification_token, t.verified_at, t.access_token, t.access_granted_at,
                   t.access_expires_at, t.created_at,
                   u.id as u_id, u.email as u_email, u.display_name, u.created_at as u_created_at
              from trustees t
              join users u on u.id = t.user_id
             where t.access_token is not null
               and not exists (
                   select 1 from audit_events a
                    where a.kind = 'TRUSTEE_NOTIFIED'
                      and a.payload->>'trustee_id' = t.id::text
               )
             order by t.access_granted_at asc
             limit $1
            "#,
        )
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let trustee = trustee_from_row(row)?;
            let user = User {
                id: row.try_get("u_id")?,
                email: row.try_get("u_email")?,
                display_name: row.try_get("display_name")?,
                created_at: row.try_get("u_created_at")?,
            };
            out.push((trustee, user));
        }
        Ok(out)
    }

    // --- escalation & release ----------------------------------------------

    async fn apply_miss_escalation(
        &self,
        user_id: Uuid,
        expected_missed_count: i32,
        now: DateTime<Utc>,
        token: String,
    ) -> Result<EscalationOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let cfg = lock_config(&mut tx, user_id).await?;

        if matches!(cfg.status, PollingStatus::Paused | PollingStatus::Triggered) {
            return Ok(EscalationOutcome::Skipped { status: cfg.status });
        }

        let out = step(&cfg, &Event::Miss { expected_missed_count }, now);

        if !out.is_transition(&cfg) {
            // Stale: the counter moved since enqueue. Record and leave.
            append_audit_tx(
                &mut tx,
                Some(user_id),
                AuditKind::EscalationSkippedStale,
                json!({
                    "expected_missed_count": expected_missed_count,
                    "current_missed_check_ins": cfg.current_missed_check_ins,
                }),
                now,
            )
            .await?;
            tx.commit().await?;
            return Ok(EscalationOutcome::Stale);
        }

        persist_config(&mut tx, &out.config).await?;

        let mut created: Option<CheckIn> = None;
        let mut release_after: Option<Duration> = None;
        for effect in &out.effects {
            match effect {
                Effect::CreateGracePeriodCheckIn { level } => {
                    let ci = new_pending_check_in(
                        &out.config,
                        token.clone(),
                        now,
                        out.config.grace_period(*level),
                    );
                    insert_check_in_tx(&mut tx, &ci).await?;
                    created = Some(ci);
                }
                Effect::EnqueueRelease { after } => release_after = Some(*after),
                Effect::Audit { kind } => {
                    append_audit_tx(
                        &mut tx,
                        Some(user_id),
                        *kind,
                        json!({
                            "level": out.config.status.grace_level(),
                            "missed_check_ins": out.config.current_missed_check_ins,
                        }),
                        now,
                    )
                    .await?;
                }
                Effect::ScheduleNextCheckIn => {}
            }
        }

        let check_in = created.ok_or_else(|| {
            StoreError::Invariant("miss transition produced no grace check-in".to_string())
        })?;

        tx.commit().await?;
        Ok(EscalationOutcome::Applied {
            config: out.config,
            check_in,
            release_after,
        })
    }

    async fn execute_release(
        &self,
        user_id: Uuid,
        cause: ReleaseCause,
        now: DateTime<Utc>,
        tokens: &dyn TokenGenerator,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let cfg = lock_config(&mut tx, user_id).await?;

        // Idempotent re-entry: a previous run already committed.
        if cfg.status == PollingStatus::Triggered {
            return Ok(ReleaseOutcome::AlreadyTriggered);
        }

        let event = match cause {
            ReleaseCause::GraceTimeout => Event::GraceTimeout,
            ReleaseCause::Admin => Event::AdminTrigger,
        };
        let out = step(&cfg, &event, now);
        if out.config.status != PollingStatus::Triggered {
            // The user proved liveness (or paused) before the job ran.
            return Ok(ReleaseOutcome::NotEligible { status: cfg.status });
        }

        // Provision every eligible trustee with a fresh access token.
        let rows = sqlx::query(&format!(
            "select {TRUSTEE_COLUMNS} from trustees \
             where user_id = $1 and status in ('VERIFIED','ACTIVE') \
             order by created_at asc"
        ))
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut trustees = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut trustee = trustee_from_row(row)?;
            let access_token = tokens.mint(ACCESS_TOKEN_BYTES);
            let granted_at = now;
            let expires_at = now + Duration::days(30);

            sqlx::query(
                r#"
                update trustees
                   set status = 'ACTIVE',
                       access_token = $2,
                       access_granted_at = $3,
                       access_expires_at = $4
                 where id = $1
                "#,
            )
            .bind(trustee.id)
            .bind(&access_token)
            .bind(granted_at)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

            append_audit_tx(
                &mut tx,
                Some(user_id),
                AuditKind::AccessGranted,
                json!({ "trustee_id": trustee.id, "access_expires_at": expires_at }),
                now,
            )
            .await?;

            trustee.status = TrusteeStatus::Active;
            trustee.access_token = Some(access_token);
            trustee.access_granted_at = Some(granted_at);
            trustee.access_expires_at = Some(expires_at);
            trustees.push(trustee);
        }

        let rows = sqlx::query(&format!(
            "select {LETTER_COLUMNS} from final_letters \
             where user_id = $1 and status = 'READY' \
             order by created_at asc"
        ))
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        let letters: Vec<FinalLetter> = rows
            .iter()
            .map(letter_from_row)
            .collect::<Result<_, _>>()?;

        persist_config(&mut tx, &out.config).await?;

        append_audit_tx(
            &mut tx,
            Some(user_id),
            AuditKind::DeathProtocolTriggered,
            json!({
                "cause": match cause {
                    ReleaseCause::GraceTimeout => "grace_timeout",
                    ReleaseCause::Admin => "admin",
                },
                "trustees_notified": trustees.len(),
                "letters_queued": letters.len(),
            }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(ReleaseOutcome::Released {
            config: out.config,
            trustees,
            letters,
        })
    }

    async fn mark_letter_delivered(
        &self,
        letter_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update final_letters
               set status = 'DELIVERED', delivered_at = $2
             where id = $1 and status = 'READY'
            returning user_id
            "#,
        )
        .bind(letter_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        // Already delivered (or never READY): idempotent no-op.
        if let Some((user_id,)) = row {
            append_audit_tx(
                &mut tx,
                Some(user_id),
                AuditKind::LetterDelivered,
                json!({ "letter_id": letter_id }),
                now,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_trustee_notified(
        &self,
        trustee_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("select user_id from trustees where id = $1")
            .bind(trustee_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("trustee"))?;
        let user_id: Uuid = row.try_get("user_id")?;

        let exists: Option<(i64,)> = sqlx::query_as(
            r#"
            select 1::bigint from audit_events
             where kind = 'TRUSTEE_NOTIFIED' and payload->>'trustee_id' = $1
             limit 1
            "#,
        )
        .bind(trustee_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if exists.is_none() {
            append_audit_tx(
                &mut tx,
                Some(user_id),
                AuditKind::TrusteeNotified,
                json!({ "trustee_id": trustee_id }),
                now,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // --- administrative ----------------------------------------------------

    async fn pause_polling(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        self.apply_admin_event(user_id, Event::Pause, now, observer)
            .await
    }

    async fn resume_polling(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        self.apply_admin_event(user_id, Event::Resume, now, observer)
            .await
    }

    async fn admin_force_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        self.apply_admin_event(user_id, Event::AdminForceCheckIn, now, observer)
            .await
    }

    async fn record_admin_trigger(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        // Confirm the user exists before auditing the override.
        let _ = lock_config(&mut tx, user_id).await?;
        append_audit_tx(
            &mut tx,
            Some(user_id),
            AuditKind::AdminTrigger,
            observer_payload(observer),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- trustees, letters, vault -------------------------------------------

    async fn create_trustee(
        &self,
        new: NewTrustee,
        verification_token: String,
        now: DateTime<Utc>,
    ) -> Result<Trustee, StoreError> {
        let trustee = Trustee {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            name: new.name,
            email: new.email,
            phone: new.phone,
            relationship: new.relationship,
            status: TrusteeStatus::Pending,
            verification_token: Some(verification_token),
            verified_at: None,
            access_token: None,
            access_granted_at: None,
            access_expires_at: None,
            created_at: now,
        };

        sqlx::query(
            r#"
            insert into trustees (
                id, user_id, name, email, phone, relationship, status,
                verification_token, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(trustee.id)
        .bind(trustee.user_id)
        .bind(&trustee.name)
        .bind(&trustee.email)
        .bind(&trustee.phone)
        .bind(&trustee.relationship)
        .bind(trustee.status.as_str())
        .bind(&trustee.verification_token)
        .bind(trustee.created_at)
        .execute(&self.pool)
        .await?;

        Ok(trustee)
    }

    async fn verify_trustee(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Trustee, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Single-use: only a PENDING row still holding the token matches;
        // the token column is cleared on success and never reissued.
        let row = sqlx::query(&format!(
            "update trustees \
                set status = 'VERIFIED', verified_at = $2, verification_token = null \
              where verification_token = $1 and status = 'PENDING' \
             returning {TRUSTEE_COLUMNS}"
        ))
        .bind(token)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("verification token"))?;
        let trustee = trustee_from_row(&row)?;

        append_audit_tx(
            &mut tx,
            Some(trustee.user_id),
            AuditKind::TrusteeVerified,
            json!({ "trustee_id": trustee.id }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(trustee)
    }

    async fn trustees_for_user(&self, user_id: Uuid) -> Result<Vec<Trustee>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {TRUSTEE_COLUMNS} from trustees where user_id = $1 order by created_at asc"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trustee_from_row).collect()
    }

    async fn trustee_by_access_token(
        &self,
        access_token: &str,
    ) -> Result<(Trustee, User), StoreError> {
        let row = sqlx::query(&format!(
            "select {TRUSTEE_COLUMNS} from trustees where access_token = $1"
        ))
        .bind(access_token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("access token"))?;
        let trustee = trustee_from_row(&row)?;
        let user = self.get_user(trustee.user_id).await?;
        Ok((trustee, user))
    }

    async fn create_final_letter(
        &self,
        new: NewFinalLetter,
        now: DateTime<Utc>,
    ) -> Result<FinalLetter, StoreError> {
        let letter = FinalLetter {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            recipient_name: new.recipient_name,
            recipient_email: new.recipient_email,
            subject: new.subject,
            encrypted_body: new.encrypted_body,
            nonce: new.nonce,
            status: if new.ready {
                LetterStatus::Ready
            } else {
                LetterStatus::Draft
            },
            delivered_at: None,
            created_at: now,
        };

        sqlx::query(
            r#"
            insert into final_letters (
                id, user_id, recipient_name, recipient_email, subject,
                encrypted_body, nonce, status, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(letter.id)
        .bind(letter.user_id)
        .bind(&letter.recipient_name)
        .bind(&letter.recipient_email)
        .bind(&letter.subject)
        .bind(&letter.encrypted_body)
        .bind(&letter.nonce)
        .bind(letter.status.as_str())
        .bind(letter.created_at)
        .execute(&self.pool)
        .await?;

        Ok(letter)
    }

    async fn letters_for_user(&self, user_id: Uuid) -> Result<Vec<FinalLetter>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {LETTER_COLUMNS} from final_letters where user_id = $1 order by created_at asc"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(letter_from_row).collect()
    }

    async fn put_vault(
        &self,
        vault: Vault,
        items: Vec<NewVaultItem>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            insert into vaults (user_id, encrypted_master_key, master_key_salt, master_key_nonce)
            values ($1, $2, $3, $4)
            on conflict (user_id) do update
                set encrypted_master_key = excluded.encrypted_master_key,
                    master_key_salt      = excluded.master_key_salt,
                    master_key_nonce     = excluded.master_key_nonce
            "#,
        )
        .bind(vault.user_id)
        .bind(&vault.encrypted_master_key)
        .bind(&vault.master_key_salt)
        .bind(&vault.master_key_nonce)
        .execute(&mut *tx)
        .await?;

        sqlx::query("delete from vault_items where user_id = $1")
            .bind(vault.user_id)
            .execute(&mut *tx)
            .await?;

        for item in items {
            sqlx::query(
                r#"
                insert into vault_items (id, user_id, item_type, name, encrypted_data, nonce, metadata, created_at)
                values ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(vault.user_id)
            .bind(&item.item_type)
            .bind(&item.name)
            .bind(&item.encrypted_data)
            .bind(&item.nonce)
            .bind(&item.metadata)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn vault_for_user(&self, user_id: Uuid) -> Result<VaultSnapshot, StoreError> {
        let row = sqlx::query(
            "select encrypted_master_key, master_key_salt, master_key_nonce \
             from vaults where user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("vault"))?;

        let rows = sqlx::query(
            "select id, user_id, item_type, name, encrypted_data, nonce, metadata, created_at \
             from vault_items where user_id = $1 order by created_at asc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for r in &rows {
            items.push(VaultItem {
                id: r.try_get("id")?,
                user_id: r.try_get("user_id")?,
                item_type: r.try_get("item_type")?,
                name: r.try_get("name")?,
                encrypted_data: r.try_get("encrypted_data")?,
                nonce: r.try_get("nonce")?,
                metadata: r.try_get("metadata")?,
                created_at: r.try_get("created_at")?,
            });
        }

        Ok(VaultSnapshot {
            encrypted_master_key: row.try_get("encrypted_master_key")?,
            master_key_salt: row.try_get("master_key_salt")?,
            master_key_nonce: row.try_get("master_key_nonce")?,
            items,
        })
    }

    // --- audit & operations -------------------------------------------------

    async fn audit_events_for_user(&self, user_id: Uuid) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query(
            "select event_id, user_id, ts_utc, kind, payload, hash_prev, hash_self \
             from audit_events where user_id = $1 order by seq asc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn append_job_failure(
        &self,
        user_id: Option<Uuid>,
        queue: &str,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        append_audit_tx(
            &mut tx,
            user_id,
            AuditKind::JobFailed,
            json!({ "queue": queue, "job_id": job_id, "error": error }),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "select status, count(*)::bigint from polling_configs group by status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "ACTIVE" => counts.active = n,
                "PAUSED" => counts.paused = n,
                "GRACE_1" => counts.grace_1 = n,
                "GRACE_2" => counts.grace_2 = n,
                "GRACE_3" => counts.grace_3 = n,
                "TRIGGERED" => counts.triggered = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn try_acquire_scheduler_lease(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            insert into sys_scheduler_lease (singleton_id, holder, expires_at)
            values (1, $1, $2)
            on conflict (singleton_id) do update
                set holder = excluded.holder, expires_at = excluded.expires_at
              where sys_scheduler_lease.holder = excluded.holder
                 or sys_scheduler_lease.expires_at <= $3
            returning holder
            "#,
        )
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn release_scheduler_lease(&self, holder: &str) -> Result<(), StoreError> {
        sqlx::query("delete from sys_scheduler_lease where holder = $1")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl PgStore {
    /// Shared body for pause / resume / force-check-in: lock, step, persist
    /// when the event applies, audit from the effect list.
    async fn apply_admin_event(
        &self,
        user_id: Uuid,
        event: Event,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        let mut tx = self.pool.begin().await?;
        let cfg = lock_config(&mut tx, user_id).await?;

        let out = step(&cfg, &event, now);
        if !out.is_transition(&cfg) {
            // Unspecified cell (e.g. pause while paused): leave untouched.
            return Ok(cfg);
        }

        persist_config(&mut tx, &out.config).await?;
        for effect in &out.effects {
            if let Effect::Audit { kind } = effect {
                append_audit_tx(&mut tx, Some(user_id), *kind, observer_payload(observer), now)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(out.config)
    }
}
