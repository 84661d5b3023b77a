//! In-memory `StateStore` with the same semantics as `PgStore`.
//!
//! One mutex over the whole world makes every compound op trivially
//! serialized, which is exactly the per-user ordering guarantee the
//! Postgres implementation gets from its row locks.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use esn_audit::AuditEvent;
use esn_db::{
    CheckInConfirmation, CheckInStatusView, EscalationOutcome, ExpiredCheckIn, NewFinalLetter,
    NewTrustee, NewUser, NewVaultItem, ReleaseOutcome, StateStore, StatusCounts, StoreError,
};
use esn_escalation::{step, Effect, Event};
use esn_schemas::{
    AuditKind, CheckIn, CheckInStatus, FinalLetter, LetterStatus, Observer, PollInterval,
    PollingConfig, PollingStatus, ReleaseCause, TokenGenerator, Trustee, TrusteeStatus, User,
    Vault, VaultItem, VaultSnapshot, ACCESS_TOKEN_BYTES,
};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    configs: HashMap<Uuid, PollingConfig>,
    check_ins: HashMap<Uuid, CheckIn>,
    trustees: HashMap<Uuid, Trustee>,
    letters: HashMap<Uuid, FinalLetter>,
    vaults: HashMap<Uuid, Vault>,
    vault_items: HashMap<Uuid, Vec<VaultItem>>,
    audit: Vec<AuditEvent>,
    lease: Option<(String, DateTime<Utc>)>,
}

impl Inner {
    fn append_audit(
        &mut self,
        user_id: Option<Uuid>,
        kind: AuditKind,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let hash_prev = self
            .audit
            .iter()
            .rev()
            .find(|e| e.user_id == user_id)
            .and_then(|e| e.hash_self.clone());
        let ev = AuditEvent::chained(Uuid::new_v4(), user_id, now, kind, payload, hash_prev)
            .map_err(|e| StoreError::Invariant(e.to_string()))?;
        self.audit.push(ev);
        Ok(())
    }

    fn config_mut(&mut self, user_id: Uuid) -> Result<&mut PollingConfig, StoreError> {
        self.configs
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound("polling config"))
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

    /// Confirm a PENDING, unexpired check-in and reset the config. Mirrors
    /// `PgStore::confirm_pending_tx`.
    fn confirm_pending(
        &mut self,
        check_in_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<CheckInConfirmation, StoreError> {
        let (user_id, _) = {
            let ci = self
                .check_ins
                .get_mut(&check_in_id)
                .ok_or(StoreError::NotFound("check-in"))?;
            ci.status = CheckInStatus::Confirmed;
            ci.responded_at = Some(now);
            (ci.user_id, ci.id)
        };

        let cancelled: Vec<Uuid> = self
            .check_ins
            .values_mut()
            .filter(|c| {
                c.user_id == user_id && c.id != check_in_id && c.status == CheckInStatus::Pending
            })
            .map(|c| {
                c.status = CheckInStatus::Cancelled;
                c.responded_at = Some(now);
                c.id
            })
            .collect();

        let cfg = self.config_mut(user_id)?.clone();
        let out = step(&cfg, &Event::Confirm, now);
        *self.config_mut(user_id)? = out.config.clone();

        for effect in &out.effects {
            if let Effect::Audit { kind } = effect {
                self.append_audit(
                    Some(user_id),
                    *kind,
                    json!({
                        "check_in_id": check_in_id,
                        "ip": observer.ip,
                        "user_agent": observer.user_agent,
                    }),
                    now,
                )?;
            }
        }
        if !cancelled.is_empty() {
            self.append_audit(
                Some(user_id),
                AuditKind::CheckInCancelled,
                json!({ "check_in_ids": cancelled }),
                now,
            )?;
        }

        Ok(CheckInConfirmation {
            user_id,
            check_in_id,
            next_check_in_due: out.config.next_check_in_due,
        })
    }

    /// Late confirmation attempt: freeze as MISSED, audit, report Expired.
    fn expire_on_touch(
        &mut self,
        check_in_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(ci) = self.check_ins.get_mut(&check_in_id) {
            ci.status = CheckInStatus::Missed;
            let user_id = ci.user_id;
            self.append_audit(
                Some(user_id),
                AuditKind::CheckInMissed,
                json!({ "check_in_id": check_in_id, "late_confirmation_attempt": true }),
                now,
            )?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every audit event (tests assert on kinds and order).
    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.inner.lock().unwrap().audit.clone()
    }

    pub fn audit_kinds_for(&self, user_id: Uuid) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .audit
            .iter()
            .filter(|e| e.user_id == Some(user_id))
            .map(|e| e.kind.clone())
            .collect()
    }

    /// Test hook: force a trustee status (e.g. an ACTIVE trustee carried
    /// over from an earlier grant, or a REVOKED one).
    pub fn set_trustee_status(&self, trustee_id: Uuid, status: TrusteeStatus) {
        if let Some(t) = self.inner.lock().unwrap().trustees.get_mut(&trustee_id) {
            t.status = status;
        }
    }

    pub fn check_ins_for(&self, user_id: Uuid) -> Vec<CheckIn> {
        let mut out: Vec<CheckIn> = self
            .inner
            .lock()
            .unwrap()
            .check_ins
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.sent_at);
        out
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    // --- users & setup -----------------------------------------------------

    async fn create_user(
        &self,
        new: NewUser,
        interval: PollInterval,
        now: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.values().any(|u| u.email == new.email) {
            return Err(StoreError::Conflict("unique constraint users_email".into()));
        }
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            display_name: new.display_name,
            created_at: now,
        };
        inner.users.insert(user.id, user.clone());
        inner
            .configs
            .insert(user.id, PollingConfig::new(user.id, interval, now));
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<User, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound("user"))
    }

    async fn get_polling_config(&self, user_id: Uuid) -> Result<PollingConfig, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .configs
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound("polling config"))
    }

    async fn set_channels(
        &self,
        user_id: Uuid,
        email_enabled: bool,
        sms_enabled: bool,
        phone: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let cfg = inner.config_mut(user_id)?;
        cfg.email_enabled = email_enabled;
        cfg.sms_enabled = sms_enabled;
        cfg.phone = phone;
        Ok(())
    }

    // --- check-ins ---------------------------------------------------------

    async fn get_check_in(&self, check_in_id: Uuid) -> Result<CheckIn, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .check_ins
            .get(&check_in_id)
            .cloned()
            .ok_or(StoreError::NotFound("check-in"))
    }

    async fn check_in_status(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckInStatusView, StoreError> {
        let inner = self.inner.lock().unwrap();
        let ci = inner
            .check_ins
            .values()
            .find(|c| c.token == token)
            .ok_or(StoreError::NotFound("check-in"))?;
        let user = inner
            .users
            .get(&ci.user_id)
            .ok_or(StoreError::NotFound("user"))?;
        Ok(CheckInStatusView {
            status: ci.status,
            expires_at: ci.expires_at,
            is_expired: ci.status == CheckInStatus::Pending && ci.expires_at <= now,
            user_name: user.display_name.clone(),
        })
    }

    async fn confirm_check_in(
        &self,
        token: &str,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<CheckInConfirmation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let ci = inner
            .check_ins
            .values()
            .find(|c| c.token == token)
            .cloned()
            .ok_or(StoreError::NotFound("check-in"))?;

        if ci.status != CheckInStatus::Pending {
            return Err(StoreError::AlreadyResolved { status: ci.status });
        }
        if ci.expires_at <= now {
            inner.expire_on_touch(ci.id, now)?;
            return Err(StoreError::Expired);
        }

        inner.confirm_pending(ci.id, now, observer)
    }

    async fn confirm_latest_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<CheckInConfirmation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let latest = inner
            .check_ins
            .values()
            .filter(|c| c.user_id == user_id && c.status == CheckInStatus::Pending)
            .max_by_key(|c| c.sent_at)
            .cloned()
            .ok_or(StoreError::NotFound("pending check-in"))?;

        if latest.expires_at <= now {
            inner.expire_on_touch(latest.id, now)?;
            return Err(StoreError::Expired);
        }

        inner.confirm_pending(latest.id, now, observer)
    }

    // --- scheduler scans ---------------------------------------------------

    async fn due_polling_configs(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<PollingConfig>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<PollingConfig> = inner
            .configs
            .values()
            .filter(|c| c.status == PollingStatus::Active && c.next_check_in_due <= now)
            .cloned()
            .collect();
        due.sort_by_key(|c| c.next_check_in_due);
        due.truncate(batch.max(0) as usize);
        Ok(due)
    }

    async fn issue_due_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        token: String,
    ) -> Result<Option<CheckIn>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let cfg = inner.config_mut(user_id)?.clone();
        if cfg.status != PollingStatus::Active || cfg.next_check_in_due > now {
            return Ok(None);
        }

        let ci = Inner::new_pending_check_in(&cfg, token, now, cfg.interval.response_window());
        inner.check_ins.insert(ci.id, ci.clone());

        let next = inner.config_mut(user_id)?;
        next.next_check_in_due = now + cfg.interval.period();
        next.updated_at = now;

        inner.append_audit(
            Some(user_id),
            AuditKind::CheckInIssued,
            json!({ "check_in_id": ci.id, "expires_at": ci.expires_at }),
            now,
        )?;
        Ok(Some(ci))
    }

    async fn expired_check_ins(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<CheckIn>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut expired: Vec<CheckIn> = inner
            .check_ins
            .values()
            .filter(|c| c.status == CheckInStatus::Pending && c.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|c| c.expires_at);
        expired.truncate(batch.max(0) as usize);
        Ok(expired)
    }

    async fn expire_check_in(
        &self,
        check_in_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredCheckIn>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let ci = inner
            .check_ins
            .get(&check_in_id)
            .cloned()
            .ok_or(StoreError::NotFound("check-in"))?;
        if ci.status != CheckInStatus::Pending || ci.expires_at > now {
            return Ok(None);
        }

        let user_id = ci.user_id;
        inner.check_ins.get_mut(&check_in_id).unwrap().status = CheckInStatus::Missed;
        inner.append_audit(
            Some(user_id),
            AuditKind::CheckInMissed,
            json!({ "check_in_id": check_in_id }),
            now,
        )?;

        let mut missed = ci;
        missed.status = CheckInStatus::Missed;
        let config = inner
            .configs
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound("polling config"))?;
        Ok(Some(ExpiredCheckIn {
            check_in: missed,
            config,
        }))
    }

    async fn grace3_timeouts(
        &self,
        now: DateTime<Utc>,
        batch: i64,
    ) -> Result<Vec<PollingConfig>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<PollingConfig> = inner
            .configs
            .values()
            .filter(|c| {
                c.status == PollingStatus::Grace3 && c.updated_at + c.grace_period(3) <= now
            })
            .cloned()
            .collect();
        out.sort_by_key(|c| c.updated_at);
        out.truncate(batch.max(0) as usize);
        Ok(out)
    }

    async fn unnotified_released_trustees(
        &self,
        batch: i64,
    ) -> Result<Vec<(Trustee, User)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for t in inner.trustees.values() {
            if t.access_token.is_none() {
                continue;
            }
            let notified = inner.audit.iter().any(|e| {
                e.kind == AuditKind::TrusteeNotified.as_str()
                    && e.payload.get("trustee_id").and_then(|v| v.as_str())
                        == Some(t.id.to_string().as_str())
            });
            if notified {
                continue;
            }
            let user = inner
                .users
                .get(&t.user_id)
                .ok_or(StoreError::NotFound("user"))?;
            out.push((t.clone(), user.clone()));
            if out.len() as i64 >= batch {
                break;
            }
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
        let mut inner = self.inner.lock().unwrap();
        let cfg = inner.config_mut(user_id)?.clone();

        if matches!(cfg.status, PollingStatus::Paused | PollingStatus::Triggered) {
            return Ok(EscalationOutcome::Skipped { status: cfg.status });
        }

        let out = step(&cfg, &Event::Miss { expected_missed_count }, now);
        if !out.is_transition(&cfg) {
            inner.append_audit(
                Some(user_id),
                AuditKind::EscalationSkippedStale,
                json!({
                    "expected_missed_count": expected_missed_count,
                    "current_missed_check_ins": cfg.current_missed_check_ins,
                }),
                now,
            )?;
            return Ok(EscalationOutcome::Stale);
        }

        *inner.config_mut(user_id)? = out.config.clone();

        let mut created: Option<CheckIn> = None;
        let mut release_after: Option<Duration> = None;
        for effect in &out.effects {
            match effect {
                Effect::CreateGracePeriodCheckIn { level } => {
                    let ci = Inner::new_pending_check_in(
                        &out.config,
                        token.clone(),
                        now,
                        out.config.grace_period(*level),
                    );
                    inner.check_ins.insert(ci.id, ci.clone());
                    created = Some(ci);
                }
                Effect::EnqueueRelease { after } => release_after = Some(*after),
                Effect::Audit { kind } => {
                    inner.append_audit(
                        Some(user_id),
                        *kind,
                        json!({
                            "level": out.config.status.grace_level(),
                            "missed_check_ins": out.config.current_missed_check_ins,
                        }),
                        now,
                    )?;
                }
                Effect::ScheduleNextCheckIn => {}
            }
        }

        let check_in = created.ok_or_else(|| {
            StoreError::Invariant("miss transition produced no grace check-in".to_string())
        })?;

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
        let mut inner = self.inner.lock().unwrap();
        let cfg = inner.config_mut(user_id)?.clone();

        if cfg.status == PollingStatus::Triggered {
            return Ok(ReleaseOutcome::AlreadyTriggered);
        }

        let event = match cause {
            ReleaseCause::GraceTimeout => Event::GraceTimeout,
            ReleaseCause::Admin => Event::AdminTrigger,
        };
        let out = step(&cfg, &event, now);
        if out.config.status != PollingStatus::Triggered {
            return Ok(ReleaseOutcome::NotEligible { status: cfg.status });
        }

        let mut eligible: Vec<Uuid> = inner
            .trustees
            .values()
            .filter(|t| t.user_id == user_id && t.status.eligible_for_release())
            .map(|t| t.id)
            .collect();
        eligible.sort_by_key(|id| inner.trustees[id].created_at);

        let mut trustees = Vec::with_capacity(eligible.len());
        for id in eligible {
            let access_token = tokens.mint(ACCESS_TOKEN_BYTES);
            let expires_at = now + Duration::days(30);
            {
                let t = inner.trustees.get_mut(&id).unwrap();
                t.status = TrusteeStatus::Active;
                t.access_token = Some(access_token);
                t.access_granted_at = Some(now);
                t.access_expires_at = Some(expires_at);
            }
            inner.append_audit(
                Some(user_id),
                AuditKind::AccessGranted,
                json!({ "trustee_id": id, "access_expires_at": expires_at }),
                now,
            )?;
            trustees.push(inner.trustees[&id].clone());
        }

        let mut letters: Vec<FinalLetter> = inner
            .letters
            .values()
            .filter(|l| l.user_id == user_id && l.status == LetterStatus::Ready)
            .cloned()
            .collect();
        letters.sort_by_key(|l| l.created_at);

        *inner.config_mut(user_id)? = out.config.clone();
        inner.append_audit(
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
        )?;

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
        let mut inner = self.inner.lock().unwrap();
        let Some(letter) = inner.letters.get_mut(&letter_id) else {
            return Ok(());
        };
        if letter.status != LetterStatus::Ready {
            return Ok(());
        }
        letter.status = LetterStatus::Delivered;
        letter.delivered_at = Some(now);
        let user_id = letter.user_id;
        inner.append_audit(
            Some(user_id),
            AuditKind::LetterDelivered,
            json!({ "letter_id": letter_id }),
            now,
        )?;
        Ok(())
    }

    async fn mark_trustee_notified(
        &self,
        trustee_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let user_id = inner
            .trustees
            .get(&trustee_id)
            .map(|t| t.user_id)
            .ok_or(StoreError::NotFound("trustee"))?;

        let already = inner.audit.iter().any(|e| {
            e.kind == AuditKind::TrusteeNotified.as_str()
                && e.payload.get("trustee_id").and_then(|v| v.as_str())
                    == Some(trustee_id.to_string().as_str())
        });
        if !already {
            inner.append_audit(
                Some(user_id),
                AuditKind::TrusteeNotified,
                json!({ "trustee_id": trustee_id }),
                now,
            )?;
        }
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
    }

    async fn resume_polling(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        self.apply_admin_event(user_id, Event::Resume, now, observer)
    }

    async fn admin_force_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        self.apply_admin_event(user_id, Event::AdminForceCheckIn, now, observer)
    }

    async fn record_admin_trigger(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.configs.contains_key(&user_id) {
            return Err(StoreError::NotFound("polling config"));
        }
        inner.append_audit(
            Some(user_id),
            AuditKind::AdminTrigger,
            json!({ "ip": observer.ip, "user_agent": observer.user_agent }),
            now,
        )
    }

    // --- trustees, letters, vault -------------------------------------------

    async fn create_trustee(
        &self,
        new: NewTrustee,
        verification_token: String,
        now: DateTime<Utc>,
    ) -> Result<Trustee, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .trustees
            .values()
            .any(|t| t.user_id == new.user_id && t.email == new.email)
        {
            return Err(StoreError::Conflict(
                "unique constraint trustees_user_id_email".into(),
            ));
        }
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
        inner.trustees.insert(trustee.id, trustee.clone());
        Ok(trustee)
    }

    async fn verify_trustee(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Trustee, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner
            .trustees
            .values()
            .find(|t| {
                t.status == TrusteeStatus::Pending
                    && t.verification_token.as_deref() == Some(token)
            })
            .map(|t| t.id)
            .ok_or(StoreError::NotFound("verification token"))?;

        let user_id = {
            let t = inner.trustees.get_mut(&id).unwrap();
            t.status = TrusteeStatus::Verified;
            t.verified_at = Some(now);
            t.verification_token = None;
            t.user_id
        };
        inner.append_audit(
            Some(user_id),
            AuditKind::TrusteeVerified,
            json!({ "trustee_id": id }),
            now,
        )?;
        Ok(inner.trustees[&id].clone())
    }

    async fn trustees_for_user(&self, user_id: Uuid) -> Result<Vec<Trustee>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Trustee> = inner
            .trustees
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    async fn trustee_by_access_token(
        &self,
        access_token: &str,
    ) -> Result<(Trustee, User), StoreError> {
        let inner = self.inner.lock().unwrap();
        let trustee = inner
            .trustees
            .values()
            .find(|t| t.access_token.as_deref() == Some(access_token))
            .cloned()
            .ok_or(StoreError::NotFound("access token"))?;
        let user = inner
            .users
            .get(&trustee.user_id)
            .cloned()
            .ok_or(StoreError::NotFound("user"))?;
        Ok((trustee, user))
    }

    async fn create_final_letter(
        &self,
        new: NewFinalLetter,
        now: DateTime<Utc>,
    ) -> Result<FinalLetter, StoreError> {
        let mut inner = self.inner.lock().unwrap();
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
        inner.letters.insert(letter.id, letter.clone());
        Ok(letter)
    }

    async fn letters_for_user(&self, user_id: Uuid) -> Result<Vec<FinalLetter>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<FinalLetter> = inner
            .letters
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.created_at);
        Ok(out)
    }

    async fn put_vault(
        &self,
        vault: Vault,
        items: Vec<NewVaultItem>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let user_id = vault.user_id;
        inner.vaults.insert(user_id, vault);
        let built: Vec<VaultItem> = items
            .into_iter()
            .map(|i| VaultItem {
                id: Uuid::new_v4(),
                user_id,
                item_type: i.item_type,
                name: i.name,
                encrypted_data: i.encrypted_data,
                nonce: i.nonce,
                metadata: i.metadata,
                created_at: now,
            })
            .collect();
        inner.vault_items.insert(user_id, built);
        Ok(())
    }

    async fn vault_for_user(&self, user_id: Uuid) -> Result<VaultSnapshot, StoreError> {
        let inner = self.inner.lock().unwrap();
        let vault = inner
            .vaults
            .get(&user_id)
            .ok_or(StoreError::NotFound("vault"))?;
        let items = inner.vault_items.get(&user_id).cloned().unwrap_or_default();
        Ok(VaultSnapshot {
            encrypted_master_key: vault.encrypted_master_key.clone(),
            master_key_salt: vault.master_key_salt.clone(),
            master_key_nonce: vault.master_key_nonce.clone(),
            items,
        })
    }

    // --- audit & operations -------------------------------------------------

    async fn audit_events_for_user(&self, user_id: Uuid) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .audit
            .iter()
            .filter(|e| e.user_id == Some(user_id))
            .cloned()
            .collect())
    }

    async fn append_job_failure(
        &self,
        user_id: Option<Uuid>,
        queue: &str,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.lock().unwrap().append_audit(
            user_id,
            AuditKind::JobFailed,
            json!({ "queue": queue, "job_id": job_id, "error": error }),
            now,
        )
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut counts = StatusCounts::default();
        for cfg in inner.configs.values() {
            match cfg.status {
                PollingStatus::Active => counts.active += 1,
                PollingStatus::Paused => counts.paused += 1,
                PollingStatus::Grace1 => counts.grace_1 += 1,
                PollingStatus::Grace2 => counts.grace_2 += 1,
                PollingStatus::Grace3 => counts.grace_3 += 1,
                PollingStatus::Triggered => counts.triggered += 1,
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
        let mut inner = self.inner.lock().unwrap();
        match &inner.lease {
            Some((owner, expires)) if owner != holder && *expires > now => Ok(false),
            _ => {
                inner.lease = Some((holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_scheduler_lease(&self, holder: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((owner, _)) = &inner.lease {
            if owner == holder {
                inner.lease = None;
            }
        }
        Ok(())
    }
}

impl MemoryStore {
    fn apply_admin_event(
        &self,
        user_id: Uuid,
        event: Event,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let cfg = inner.config_mut(user_id)?.clone();

        let out = step(&cfg, &event, now);
        if !out.is_transition(&cfg) {
            return Ok(cfg);
        }

        *inner.config_mut(user_id)? = out.config.clone();
        for effect in &out.effects {
            if let Effect::Audit { kind } = effect {
                inner.append_audit(
                    Some(user_id),
                    *kind,
                    json!({ "ip": observer.ip, "user_agent": observer.user_agent }),
                    now,
                )?;
            }
        }
        Ok(out.config)
    }
}
