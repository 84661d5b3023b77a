//! Queue contract: idempotent enqueues coalesce, failures back off
//! exponentially, and exhausted jobs dead-letter with a JOB_FAILED audit
//! entry.

use chrono::Duration;
use esn_queue::{EnqueueResult, JobQueue};
use esn_schemas::{Clock, JobPayload, PollInterval, QueueName};
use esn_testkit::{t0, Harness};
use uuid::Uuid;

#[tokio::test]
async fn scenario_same_idempotency_key_coalesces() -> anyhow::Result<()> {
    let h = Harness::at(t0());
    let now = h.clock.now();
    let user_id = Uuid::new_v4();

    let payload = JobPayload::Escalation {
        user_id,
        level: 1,
        expected_missed_count: 0,
    };

    let first = h.queue.enqueue(payload.clone(), now, now).await?;
    assert!(first.is_created());

    // Same key while the job is live: coalesced onto the same run.
    let second = h.queue.enqueue(payload.clone(), now, now).await?;
    assert_eq!(second, EnqueueResult::Coalesced(first.job_id()));

    // A different counter is a different logical escalation.
    let other = h
        .queue
        .enqueue(
            JobPayload::Escalation {
                user_id,
                level: 1,
                expected_missed_count: 1,
            },
            now,
            now,
        )
        .await?;
    assert!(other.is_created());

    assert_eq!(h.queue.depth(QueueName::Escalation).await?, 2);
    Ok(())
}

#[tokio::test]
async fn scenario_recently_completed_key_still_coalesces() -> anyhow::Result<()> {
    let h = Harness::at(t0());
    let now = h.clock.now();
    let payload = JobPayload::Release {
        user_id: Uuid::new_v4(),
        cause: esn_schemas::ReleaseCause::GraceTimeout,
    };

    let first = h.queue.enqueue(payload.clone(), now, now).await?;
    let job = h
        .queue
        .claim(QueueName::Release, "w", 1, now)
        .await?
        .pop()
        .unwrap();
    h.queue.mark_succeeded(job.id, now).await?;

    // Two minutes later: still inside the window, swallowed.
    h.advance(Duration::minutes(2));
    let now = h.clock.now();
    let repeat = h.queue.enqueue(payload.clone(), now, now).await?;
    assert_eq!(repeat, EnqueueResult::Coalesced(first.job_id()));

    // Past the window the key is free again.
    h.advance(Duration::minutes(20));
    let now = h.clock.now();
    let fresh = h.queue.enqueue(payload, now, now).await?;
    assert!(fresh.is_created());
    Ok(())
}

#[tokio::test]
async fn scenario_delayed_jobs_wait_for_run_at() -> anyhow::Result<()> {
    let h = Harness::at(t0());
    let now = h.clock.now();
    let run_at = now + Duration::days(7);

    h.queue
        .enqueue(
            JobPayload::Release {
                user_id: Uuid::new_v4(),
                cause: esn_schemas::ReleaseCause::GraceTimeout,
            },
            run_at,
            now,
        )
        .await?;

    assert!(h.queue.claim(QueueName::Release, "w", 10, now).await?.is_empty());
    assert!(h
        .queue
        .claim(QueueName::Release, "w", 10, run_at - Duration::seconds(1))
        .await?
        .is_empty());
    assert_eq!(h.queue.claim(QueueName::Release, "w", 10, run_at).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn scenario_transport_failures_back_off_then_dead_letter() -> anyhow::Result<()> {
    let h = Harness::at(t0());
    let _user = h.user("u1@example.com", "User One", PollInterval::Monthly).await?;

    // An SMS with no recipient can never deliver: the transport rejects it
    // retriably until max attempts drop the channel.
    let now = h.clock.now();
    h.queue
        .enqueue(
            JobPayload::Sms {
                to: String::new(),
                message: "hello".to_string(),
            },
            now,
            now,
        )
        .await?;

    // Attempt 1 fails and reschedules 30 s out.
    h.drain().await?;
    let job = &h.queue.jobs_in(QueueName::Sms)[0];
    assert_eq!(job.attempts, 1);
    assert_eq!(job.run_at, now + Duration::seconds(30));

    // Attempt 2: 60 s later.
    h.advance(Duration::seconds(30));
    h.drain().await?;
    let job = &h.queue.jobs_in(QueueName::Sms)[0];
    assert_eq!(job.attempts, 2);

    // Attempt 3 exhausts max_attempts (3 for notification queues).
    h.advance(Duration::seconds(60));
    h.drain().await?;
    assert_eq!(h.queue.dead_letter_count().await?, 1);

    // The dead-letter left an operator trail in the system audit stream.
    let system_events: Vec<_> = h
        .store
        .audit_log()
        .into_iter()
        .filter(|e| e.kind == "JOB_FAILED")
        .collect();
    assert_eq!(system_events.len(), 1);
    assert_eq!(system_events[0].payload["queue"], "sms");
    Ok(())
}
