//! A single missed check-in escalates to GRACE_1, and a confirmation that
//! lands between an escalation's enqueue and its execution cancels it.

use chrono::Duration;
use esn_db::StateStore;
use esn_queue::JobQueue;
use esn_schemas::{CheckInStatus, Clock, JobPayload, Observer, PollInterval, PollingStatus};
use esn_testkit::{t0, Harness};

/// Build a harness sitting at GRACE_1 with the grace check-in pending.
async fn escalated_once() -> anyhow::Result<(Harness, esn_schemas::User)> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;

    h.clock.set(t0());
    h.tick().await?;

    h.clock.set(t0() + Duration::days(7) + Duration::seconds(1));
    h.tick().await?;
    Ok((h, user))
}

#[tokio::test]
async fn scenario_single_miss_escalates_to_grace_1() -> anyhow::Result<()> {
    let (h, user) = escalated_once().await?;
    let missed_at = t0() + Duration::days(7) + Duration::seconds(1);

    let cfg = h.store.get_polling_config(user.id).await?;
    assert_eq!(cfg.status, PollingStatus::Grace1);
    assert_eq!(cfg.current_missed_check_ins, 1);
    assert_eq!(cfg.updated_at, missed_at);

    let check_ins = h.store.check_ins_for(user.id);
    assert_eq!(check_ins.len(), 2);
    assert_eq!(check_ins[0].status, CheckInStatus::Missed);
    // c2 inherits the first grace window as its response window.
    assert_eq!(check_ins[1].status, CheckInStatus::Pending);
    assert_eq!(check_ins[1].expires_at, missed_at + Duration::days(7));

    let kinds = h.store.audit_kinds_for(user.id);
    assert!(kinds.contains(&"CHECK_IN_MISSED".to_string()));
    assert!(kinds.contains(&"ESCALATION_LEVEL_1".to_string()));

    // The warning email went out for c2.
    let emails = h.mailbox.emails_to("u1@example.com");
    assert_eq!(emails.len(), 2);
    assert!(emails[1].subject.contains("warning 1 of 3"));
    Ok(())
}

#[tokio::test]
async fn scenario_confirm_between_enqueue_and_execution_is_race_free() -> anyhow::Result<()> {
    let (h, user) = escalated_once().await?;

    // Day 8: the user confirms the grace check-in.
    h.clock.set(t0() + Duration::days(8));
    let c2 = h.store.check_ins_for(user.id)[1].clone();
    h.store
        .confirm_check_in(&c2.token, h.clock.now(), &Observer::system())
        .await?;

    let cfg = h.store.get_polling_config(user.id).await?;
    assert_eq!(cfg.status, PollingStatus::Active);
    assert_eq!(cfg.current_missed_check_ins, 0);

    // Day 10: a delayed escalation (enqueued before the confirmation,
    // carrying the then-current counter) finally fires.
    h.clock.set(t0() + Duration::days(10));
    let now = h.clock.now();
    h.queue
        .enqueue(
            JobPayload::Escalation {
                user_id: user.id,
                level: 2,
                expected_missed_count: 1,
            },
            now,
            now,
        )
        .await?;
    h.drain().await?;

    // No transition; the stale skip is audited.
    let cfg = h.store.get_polling_config(user.id).await?;
    assert_eq!(cfg.status, PollingStatus::Active);
    assert_eq!(cfg.current_missed_check_ins, 0);
    let kinds = h.store.audit_kinds_for(user.id);
    assert!(kinds.contains(&"ESCALATION_SKIPPED_STALE".to_string()));

    // And no new check-in was created by the stale job.
    assert_eq!(h.store.check_ins_for(user.id).len(), 2);
    Ok(())
}
