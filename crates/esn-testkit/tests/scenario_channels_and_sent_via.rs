//! `sent_via` records attempted channels, not deliveries. SMS enabled with
//! no phone on file is attempted, fails retriably, and drops out after max
//! attempts while email delivery is unaffected.

use chrono::Duration;
use esn_db::StateStore;
use esn_queue::JobQueue;
use esn_schemas::{Channel, Clock, PollInterval, QueueName};
use esn_testkit::{t0, Harness};

#[tokio::test]
async fn scenario_sms_without_phone_is_attempted_then_dropped() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    h.store.set_channels(user.id, true, true, None).await?;

    h.clock.set(t0());
    h.tick().await?;

    // Both channels were attempted on the check-in.
    let ci = &h.store.check_ins_for(user.id)[0];
    assert_eq!(ci.sent_via, vec![Channel::Email, Channel::Sms]);

    // Email went out; the SMS job is parked in backoff.
    assert_eq!(h.mailbox.emails_to("u1@example.com").len(), 1);
    assert!(h.mailbox.sms_messages().is_empty());
    assert_eq!(h.queue.depth(QueueName::Sms).await?, 1);

    // Walk the retries out; the channel dead-letters without ever blocking
    // the email path.
    for _ in 0..3 {
        h.advance(Duration::minutes(5));
        h.drain().await?;
    }
    assert_eq!(h.queue.depth(QueueName::Sms).await?, 0);
    assert_eq!(h.queue.dead_letter_count().await?, 1);
    assert!(h.mailbox.sms_messages().is_empty());
    Ok(())
}

#[tokio::test]
async fn scenario_transient_email_outage_is_retried_to_success() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    h.user("u1@example.com", "User One", PollInterval::Monthly).await?;

    // Provider down for the first attempt only.
    h.mailbox.fail_next_emails(1);

    h.clock.set(t0());
    h.tick().await?;
    assert!(h.mailbox.emails().is_empty(), "first attempt failed");
    assert_eq!(h.queue.depth(QueueName::Email).await?, 1);

    // Backoff elapses; the retry delivers.
    h.advance(Duration::minutes(1));
    h.drain().await?;
    assert_eq!(h.mailbox.emails_to("u1@example.com").len(), 1);
    assert_eq!(h.queue.dead_letter_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn scenario_phone_on_file_receives_the_check_in_sms() -> anyhow::Result<()> {
    let h = Harness::at(t0() - Duration::days(30));
    let user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;
    h.store
        .set_channels(user.id, true, true, Some("+15550100".to_string()))
        .await?;

    h.clock.set(t0());
    h.tick().await?;

    let sms = h.mailbox.sms_messages();
    assert_eq!(sms.len(), 1);
    assert_eq!(sms[0].to, "+15550100");
    let token = &h.store.check_ins_for(user.id)[0].token;
    assert!(sms[0].message.contains(token));
    Ok(())
}
