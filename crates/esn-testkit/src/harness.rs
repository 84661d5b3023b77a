//! End-to-end harness: memory store + memory queue + manual clock +
//! recording transports, wired to the real scheduler and the real worker
//! handlers. Scenario tests advance the clock, sweep, and drain.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use esn_db::{NewFinalLetter, NewTrustee, NewUser, StateStore};
use esn_queue::JobQueue;
use esn_scheduler::{Scheduler, SchedulerConfig, SweepReport};
use esn_schemas::jobs::ALL_QUEUES;
use esn_schemas::{Clock, PollInterval, TokenGenerator, Trustee, User};
use esn_workers::{process_one, WorkerContext};

use crate::clock::ManualClock;
use crate::mailbox::MemoryMailbox;
use crate::queue::MemoryQueue;
use crate::store::MemoryStore;
use crate::tokens::SequentialTokens;

pub const BASE_URL: &str = "https://sentinel.test";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub clock: Arc<ManualClock>,
    pub tokens: Arc<SequentialTokens>,
    pub mailbox: Arc<MemoryMailbox>,
    pub scheduler: Scheduler,
    pub ctx: Arc<WorkerContext>,
}

impl Harness {
    pub fn at(start: DateTime<Utc>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let clock = Arc::new(ManualClock::at(start));
        let tokens = Arc::new(SequentialTokens::new("tok"));
        let mailbox = Arc::new(MemoryMailbox::new());

        let scheduler = Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            tokens.clone() as Arc<dyn TokenGenerator>,
            SchedulerConfig {
                poll_interval: StdDuration::from_secs(60),
                batch_size: 100,
                holder: "test-scheduler".to_string(),
                base_url: BASE_URL.to_string(),
            },
        );

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            clock: clock.clone(),
            tokens: tokens.clone(),
            email: mailbox.clone(),
            sms: mailbox.clone(),
            base_url: BASE_URL.to_string(),
        });

        Self {
            store,
            queue,
            clock,
            tokens,
            mailbox,
            scheduler,
            ctx,
        }
    }

    // --- fixtures ----------------------------------------------------------

    pub async fn user(&self, email: &str, name: &str, interval: PollInterval) -> Result<User> {
        let now = self.clock.now();
        Ok(self
            .store
            .create_user(
                NewUser {
                    email: email.to_string(),
                    display_name: name.to_string(),
                },
                interval,
                now,
            )
            .await?)
    }

    /// Trustee already past email verification.
    pub async fn verified_trustee(&self, user: &User, email: &str) -> Result<Trustee> {
        let now = self.clock.now();
        let trustee = self
            .store
            .create_trustee(
                NewTrustee {
                    user_id: user.id,
                    name: format!("Trustee {email}"),
                    email: email.to_string(),
                    phone: None,
                    relationship: "friend".to_string(),
                },
                self.tokens.mint(16),
                now,
            )
            .await?;
        let token = trustee.verification_token.clone().expect("fresh trustee");
        Ok(self.store.verify_trustee(&token, now).await?)
    }

    pub async fn ready_letter(&self, user: &User, recipient: &str) -> Result<()> {
        let now = self.clock.now();
        self.store
            .create_final_letter(
                NewFinalLetter {
                    user_id: user.id,
                    recipient_name: recipient.to_string(),
                    recipient_email: format!("{recipient}@example.com"),
                    subject: format!("A letter for {recipient}"),
                    encrypted_body: "b64:ciphertext".to_string(),
                    nonce: "b64:nonce".to_string(),
                    ready: true,
                },
                now,
            )
            .await?;
        Ok(())
    }

    // --- driving -----------------------------------------------------------

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.scheduler.sweep_once().await
    }

    /// Execute every claimable job (including ones enqueued while
    /// draining) until the queues go quiet at the current clock.
    pub async fn drain(&self) -> Result<usize> {
        let mut executed = 0usize;
        loop {
            let mut progressed = false;
            for queue in ALL_QUEUES {
                loop {
                    let now = self.clock.now();
                    let jobs = self.queue.claim(queue, "harness", 1, now).await?;
                    let Some(job) = jobs.into_iter().next() else {
                        break;
                    };
                    process_one(&self.ctx, &job, StdDuration::from_secs(30)).await;
                    executed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(executed);
            }
        }
    }

    /// Sweep then drain: one scheduler period at the current instant.
    pub async fn tick(&self) -> Result<SweepReport> {
        let report = self.sweep().await?;
        self.drain().await?;
        Ok(report)
    }
}

/// The canonical scenario origin: 2025-01-01T00:00:00Z.
pub fn t0() -> DateTime<Utc> {
    use chrono::TimeZone;
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}
