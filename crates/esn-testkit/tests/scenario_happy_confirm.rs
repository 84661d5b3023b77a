//! A user who confirms in time never escalates.

use chrono::Duration;
use esn_db::StateStore;
use esn_schemas::{CheckInStatus, Clock, Observer, PollInterval, PollingStatus};
use esn_testkit::{t0, Harness};

#[tokio::test]
async fn scenario_happy_confirm_resets_the_cycle() -> anyhow::Result<()> {
    // User created one period before t0 so the first check-in is due at t0.
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;

    h.clock.set(t0());
    let report = h.tick().await?;
    assert_eq!(report.check_ins_issued, 1);

    // The check-in exists, is PENDING, and carries the monthly 7-day window.
    let check_ins = h.store.check_ins_for(user.id);
    assert_eq!(check_ins.len(), 1);
    let c1 = &check_ins[0];
    assert_eq!(c1.status, CheckInStatus::Pending);
    assert_eq!(c1.expires_at, t0() + Duration::days(7));

    // The notification reached the user's email with the confirm link.
    let emails = h.mailbox.emails_to("u1@example.com");
    assert_eq!(emails.len(), 1);
    assert!(emails[0].text.contains(&c1.token));

    // One hour later the user clicks through.
    h.advance(Duration::hours(1));
    let confirmed_at = h.clock.now();
    let confirmation = h
        .store
        .confirm_check_in(&c1.token, confirmed_at, &Observer::system())
        .await?;
    assert_eq!(confirmation.next_check_in_due, confirmed_at + Duration::days(30));

    let cfg = h.store.get_polling_config(user.id).await?;
    assert_eq!(cfg.status, PollingStatus::Active);
    assert_eq!(cfg.current_missed_check_ins, 0);
    assert_eq!(cfg.last_check_in_at, Some(confirmed_at));

    let c1 = &h.store.check_ins_for(user.id)[0];
    assert_eq!(c1.status, CheckInStatus::Confirmed);
    assert_eq!(c1.responded_at, Some(confirmed_at));

    let kinds = h.store.audit_kinds_for(user.id);
    assert!(kinds.contains(&"CHECK_IN_ISSUED".to_string()));
    assert!(kinds.contains(&"CHECK_IN_CONFIRMED".to_string()));

    // Nothing queued against the user afterwards.
    let report = h.tick().await?;
    assert_eq!(report.check_ins_expired, 0);
    assert_eq!(report.escalations_enqueued, 0);
    Ok(())
}

#[tokio::test]
async fn scenario_repeat_confirmation_is_rejected_as_resolved() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    h.clock.set(t0());
    h.tick().await?;

    let token = h.store.check_ins_for(user.id)[0].token.clone();
    h.advance(Duration::hours(1));
    h.store
        .confirm_check_in(&token, h.clock.now(), &Observer::system())
        .await?;

    // The store reports the frozen status; the HTTP layer turns a repeat of
    // a CONFIRMED token into an idempotent 200.
    let err = h
        .store
        .confirm_check_in(&token, h.clock.now(), &Observer::system())
        .await
        .unwrap_err();
    match err {
        esn_db::StoreError::AlreadyResolved { status } => {
            assert_eq!(status, CheckInStatus::Confirmed);
        }
        other => panic!("expected AlreadyResolved, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn scenario_expiry_boundary_is_inclusive() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    h.clock.set(t0());
    h.tick().await?;

    let token = h.store.check_ins_for(user.id)[0].token.clone();

    // Exactly at expires_at the confirmation is already too late.
    h.clock.set(t0() + Duration::days(7));
    let err = h
        .store
        .confirm_check_in(&token, h.clock.now(), &Observer::system())
        .await
        .unwrap_err();
    assert!(matches!(err, esn_db::StoreError::Expired));

    // The late attempt froze the row; the sweep has nothing left to expire.
    let c1 = &h.store.check_ins_for(user.id)[0];
    assert_eq!(c1.status, CheckInStatus::Missed);
    Ok(())
}
