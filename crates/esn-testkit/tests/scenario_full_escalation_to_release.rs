//! No confirmations, ever: the ladder walks ACTIVE, GRACE_1, GRACE_2,
//! GRACE_3, and the death protocol fires exactly once.

use std::collections::HashSet;

use chrono::Duration;
use esn_db::StateStore;
use esn_queue::JobQueue;
use esn_schemas::{
    Clock, JobPayload, LetterStatus, PollInterval, PollingStatus, ReleaseCause, TrusteeStatus,
};
use esn_testkit::{t0, Harness};

#[tokio::test]
async fn scenario_full_escalation_triggers_release_once() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    let trustee_a = h.verified_trustee(&user, "a@trustees.example").await?;
    let trustee_b = h.verified_trustee(&user, "b@trustees.example").await?;
    h.ready_letter(&user, "daughter").await?;

    // t0: c1 issued.
    h.clock.set(t0());
    h.tick().await?;

    // Day 7: c1 missed -> GRACE_1 (c2 expires day 14).
    h.clock.set(t0() + Duration::days(7));
    h.tick().await?;
    assert_eq!(
        h.store.get_polling_config(user.id).await?.status,
        PollingStatus::Grace1
    );

    // Day 14: c2 missed -> GRACE_2 (c3 expires day 28, the 14-day grace).
    h.clock.set(t0() + Duration::days(14));
    h.tick().await?;
    assert_eq!(
        h.store.get_polling_config(user.id).await?.status,
        PollingStatus::Grace2
    );

    // Day 28: c3 missed -> GRACE_3; release armed for day 35.
    h.clock.set(t0() + Duration::days(28));
    h.tick().await?;
    let cfg = h.store.get_polling_config(user.id).await?;
    assert_eq!(cfg.status, PollingStatus::Grace3);
    assert_eq!(cfg.current_missed_check_ins, 3);

    // Day 35: the final grace window elapses and the protocol commits.
    let fired_at = t0() + Duration::days(35);
    h.clock.set(fired_at);
    h.tick().await?;

    let cfg = h.store.get_polling_config(user.id).await?;
    assert_eq!(cfg.status, PollingStatus::Triggered);
    assert_eq!(cfg.triggered_at, Some(fired_at));

    // Both trustees hold fresh, distinct, 30-day tokens.
    let trustees = h.store.trustees_for_user(user.id).await?;
    let mut tokens = HashSet::new();
    for t in &trustees {
        assert_eq!(t.status, TrusteeStatus::Active);
        let token = t.access_token.clone().expect("access token minted");
        assert!(tokens.insert(token), "tokens must be unique");
        assert_eq!(t.access_granted_at, Some(fired_at));
        assert_eq!(t.access_expires_at, Some(fired_at + Duration::days(30)));
    }
    assert_eq!(tokens.len(), 2);

    // The READY letter was delivered and its mail went out.
    let letters = h.store.letters_for_user(user.id).await?;
    assert_eq!(letters[0].status, LetterStatus::Delivered);
    assert_eq!(letters[0].delivered_at, Some(fired_at));
    assert_eq!(h.mailbox.emails_to("daughter@example.com").len(), 1);

    // Trustees got their access mail, each carrying its own access link.
    assert_eq!(h.mailbox.emails_to("a@trustees.example").len(), 1);
    assert_eq!(h.mailbox.emails_to("b@trustees.example").len(), 1);
    let granted_a = trustees
        .iter()
        .find(|t| t.id == trustee_a.id)
        .expect("trustee a released");
    let access_mail = &h.mailbox.emails_to("a@trustees.example")[0];
    assert!(access_mail
        .text
        .contains(granted_a.access_token.as_deref().unwrap()));

    let kinds = h.store.audit_kinds_for(user.id);
    assert_eq!(
        kinds.iter().filter(|k| *k == "ACCESS_GRANTED").count(),
        2,
        "one grant per eligible trustee"
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == "DEATH_PROTOCOL_TRIGGERED")
            .count(),
        1
    );

    // A second release enqueued right after is a no-op: no new tokens, no
    // second protocol run.
    let now = h.clock.now();
    h.queue
        .enqueue(
            JobPayload::Release {
                user_id: user.id,
                cause: ReleaseCause::GraceTimeout,
            },
            now,
            now,
        )
        .await?;
    h.drain().await?;

    let after = h.store.trustees_for_user(user.id).await?;
    for (before, after) in trustees.iter().zip(after.iter()) {
        assert_eq!(before.access_token, after.access_token);
    }
    let kinds = h.store.audit_kinds_for(user.id);
    assert_eq!(kinds.iter().filter(|k| *k == "ACCESS_GRANTED").count(), 2);
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == "DEATH_PROTOCOL_TRIGGERED")
            .count(),
        1
    );

    let _ = trustee_b;
    Ok(())
}

#[tokio::test]
async fn scenario_audit_chain_stays_verifiable_through_release() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    h.verified_trustee(&user, "a@trustees.example").await?;

    for day in [0i64, 7, 14, 28, 35] {
        h.clock.set(t0() + Duration::days(day));
        h.tick().await?;
    }
    assert_eq!(
        h.store.get_polling_config(user.id).await?.status,
        PollingStatus::Triggered
    );

    // Every event of the user's stream chains hash-to-hash.
    let events = h.store.audit_events_for_user(user.id).await?;
    assert!(events.len() > 8, "a full run leaves a rich trail");
    let jsonl = esn_audit::export_jsonl(&events)?;
    match esn_audit::verify_hash_chain_str(&jsonl)? {
        esn_audit::VerifyResult::Valid { lines } => assert_eq!(lines, events.len()),
        broken => panic!("audit chain broken: {broken:?}"),
    }
    Ok(())
}
