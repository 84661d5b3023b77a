//! A crash between the release commit and the post-commit notification
//! fan-out must not lose the trustee mail: the sweep's recovery scan
//! re-enqueues it, and never re-mints tokens.

use chrono::Duration;
use esn_db::{ReleaseOutcome, StateStore};
use esn_schemas::{Clock, Observer, PollInterval, PollingStatus, ReleaseCause};
use esn_testkit::{t0, Harness};

#[tokio::test]
async fn scenario_notifications_recovered_after_mid_release_crash() -> anyhow::Result<()> {
    let h = Harness::at(t0());
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    h.verified_trustee(&user, "a@trustees.example").await?;

    // Simulate the worker crashing right after commit: the release
    // transaction runs, but none of the step-8 notifications happen.
    h.store
        .record_admin_trigger(user.id, h.clock.now(), &Observer::system())
        .await?;
    let outcome = h
        .store
        .execute_release(
            user.id,
            ReleaseCause::Admin,
            h.clock.now(),
            h.tokens.as_ref(),
        )
        .await?;
    let minted = match outcome {
        ReleaseOutcome::Released { trustees, .. } => {
            trustees[0].access_token.clone().expect("token minted")
        }
        other => panic!("expected Released, got {other:?}"),
    };
    assert_eq!(
        h.store.get_polling_config(user.id).await?.status,
        PollingStatus::Triggered
    );
    assert!(h.mailbox.emails().is_empty(), "crash before any mail");

    // Next sweep: the recovery scan finds the token-without-notification
    // trustee and re-enqueues the access mail.
    h.advance(Duration::minutes(1));
    let report = h.tick().await?;
    assert_eq!(report.notifications_reenqueued, 1);

    let mails = h.mailbox.emails_to("a@trustees.example");
    assert_eq!(mails.len(), 1);
    assert!(mails[0].text.contains(&minted), "same token, never re-minted");

    // The scan converges: nothing left to recover on the next pass.
    h.advance(Duration::minutes(1));
    let report = h.tick().await?;
    assert_eq!(report.notifications_reenqueued, 0);
    assert_eq!(h.mailbox.emails_to("a@trustees.example").len(), 1);
    Ok(())
}
