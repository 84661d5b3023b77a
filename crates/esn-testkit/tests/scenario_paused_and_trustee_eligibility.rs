//! A paused user never escalates, resume restarts a clean cycle, and only
//! VERIFIED and ACTIVE trustees receive access at release.

use chrono::Duration;
use esn_db::{NewTrustee, StateStore};
use esn_queue::JobQueue;
use esn_schemas::{
    CheckInStatus, Clock, JobPayload, Observer, PollInterval, PollingStatus, QueueName, ReleaseCause,
    TrusteeStatus,
};
use esn_testkit::{t0, Harness};

#[tokio::test]
async fn scenario_paused_user_misses_without_escalating() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;

    // Walk into GRACE_1 with c2 pending (expires day 14).
    h.clock.set(t0());
    h.tick().await?;
    h.clock.set(t0() + Duration::days(7));
    h.tick().await?;
    assert_eq!(
        h.store.get_polling_config(user.id).await?.status,
        PollingStatus::Grace1
    );

    // Day 8: support pauses the account.
    h.clock.set(t0() + Duration::days(8));
    let cfg = h
        .store
        .pause_polling(user.id, h.clock.now(), &Observer::system())
        .await?;
    assert_eq!(cfg.status, PollingStatus::Paused);

    // Day 14: c2 expires. It is frozen as MISSED but nothing escalates.
    h.clock.set(t0() + Duration::days(14));
    let report = h.tick().await?;
    assert_eq!(report.check_ins_expired, 1);
    assert_eq!(report.escalations_enqueued, 0);

    let check_ins = h.store.check_ins_for(user.id);
    assert_eq!(check_ins[1].status, CheckInStatus::Missed);
    assert!(h.queue.jobs_in(QueueName::Escalation).len() == 1,
        "only the original day-7 escalation ever existed");

    // The config is untouched by the paused-state miss.
    let cfg = h.store.get_polling_config(user.id).await?;
    assert_eq!(cfg.status, PollingStatus::Paused);
    assert_eq!(cfg.current_missed_check_ins, 1);

    // Day 20: resume. Clean slate, next check-in a full period out.
    let resumed_at = t0() + Duration::days(20);
    h.clock.set(resumed_at);
    let cfg = h
        .store
        .resume_polling(user.id, resumed_at, &Observer::system())
        .await?;
    assert_eq!(cfg.status, PollingStatus::Active);
    assert_eq!(cfg.current_missed_check_ins, 0);
    assert_eq!(cfg.next_check_in_due, resumed_at + Duration::days(30));

    let kinds = h.store.audit_kinds_for(user.id);
    assert!(kinds.contains(&"POLLING_PAUSED".to_string()));
    assert!(kinds.contains(&"POLLING_RESUMED".to_string()));
    Ok(())
}

#[tokio::test]
async fn scenario_release_grants_only_eligible_trustees() -> anyhow::Result<()> {
    let h = Harness::at(t0());
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;

    // One of each status.
    let pending = h
        .store
        .create_trustee(
            NewTrustee {
                user_id: user.id,
                name: "Pat Pending".to_string(),
                email: "pending@trustees.example".to_string(),
                phone: None,
                relationship: "cousin".to_string(),
            },
            "verify-pending".to_string(),
            h.clock.now(),
        )
        .await?;
    let verified = h.verified_trustee(&user, "verified@trustees.example").await?;
    let active = h.verified_trustee(&user, "active@trustees.example").await?;
    h.store.set_trustee_status(active.id, TrusteeStatus::Active);
    let revoked = h.verified_trustee(&user, "revoked@trustees.example").await?;
    h.store.set_trustee_status(revoked.id, TrusteeStatus::Revoked);

    // Administrative trigger: audited, then released with zero delay.
    let now = h.clock.now();
    h.store
        .record_admin_trigger(user.id, now, &Observer::system())
        .await?;
    h.queue
        .enqueue(
            JobPayload::Release {
                user_id: user.id,
                cause: ReleaseCause::Admin,
            },
            now,
            now,
        )
        .await?;
    h.drain().await?;

    assert_eq!(
        h.store.get_polling_config(user.id).await?.status,
        PollingStatus::Triggered
    );

    let trustees = h.store.trustees_for_user(user.id).await?;
    for t in &trustees {
        let granted = t.access_token.is_some();
        let expected = t.id == verified.id || t.id == active.id;
        assert_eq!(
            granted, expected,
            "trustee {} grant mismatch (status at trigger decided eligibility)",
            t.email
        );
    }

    // PENDING and REVOKED rows are untouched.
    let still_pending = trustees.iter().find(|t| t.id == pending.id).unwrap();
    assert_eq!(still_pending.status, TrusteeStatus::Pending);
    let still_revoked = trustees.iter().find(|t| t.id == revoked.id).unwrap();
    assert_eq!(still_revoked.status, TrusteeStatus::Revoked);

    let kinds = h.store.audit_kinds_for(user.id);
    assert_eq!(kinds.iter().filter(|k| *k == "ACCESS_GRANTED").count(), 2);
    assert!(kinds.contains(&"ADMIN_TRIGGER".to_string()));
    Ok(())
}

#[tokio::test]
async fn scenario_verification_token_is_single_use() -> anyhow::Result<()> {
    let h = Harness::at(t0());
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    let trustee = h
        .store
        .create_trustee(
            NewTrustee {
                user_id: user.id,
                name: "Val Verify".to_string(),
                email: "val@trustees.example".to_string(),
                phone: None,
                relationship: "sibling".to_string(),
            },
            "verify-once".to_string(),
            h.clock.now(),
        )
        .await?;

    let verified = h.store.verify_trustee("verify-once", h.clock.now()).await?;
    assert_eq!(verified.id, trustee.id);
    assert_eq!(verified.status, TrusteeStatus::Verified);
    assert_eq!(verified.verification_token, None);

    // Replay: the token was cleared, so the same string resolves nothing.
    let err = h
        .store
        .verify_trustee("verify-once", h.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, esn_db::StoreError::NotFound(_)));
    Ok(())
}
