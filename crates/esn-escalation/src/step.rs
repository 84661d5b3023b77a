use chrono::{DateTime, Utc};
use esn_schemas::{AuditKind, PollingConfig, PollingStatus};

use crate::types::{Effect, Event, Step};

/// Apply one event to a polling config.
///
/// Total and deterministic: every `(config, event)` pair has exactly one
/// outcome, and unspecified table cells return the config unchanged with no
/// effects.
pub fn step(config: &PollingConfig, event: &Event, now: DateTime<Utc>) -> Step {
    // Terminal state absorbs everything.
    if config.status.is_terminal() {
        return Step::noop(config);
    }

    match (config.status, event) {
        // -------------------------------------------------------------------
        // Paused: only Resume and the administrative force-confirm escape.
        // -------------------------------------------------------------------
        (PollingStatus::Paused, Event::Resume) => {
            let mut next = reset(config, now, false);
            next.effects.push(Effect::Audit {
                kind: AuditKind::PollingResumed,
            });
            next
        }
        (PollingStatus::Paused, Event::AdminForceCheckIn) => {
            let mut next = reset(config, now, true);
            next.effects.push(Effect::Audit {
                kind: AuditKind::AdminForceCheckIn,
            });
            next
        }
        (PollingStatus::Paused, _) => Step::noop(config),

        // -------------------------------------------------------------------
        // Liveness proofs: reset from any non-paused, non-terminal state.
        // -------------------------------------------------------------------
        (_, Event::Confirm) => {
            let mut next = reset(config, now, true);
            next.effects.push(Effect::Audit {
                kind: AuditKind::CheckInConfirmed,
            });
            next
        }
        (_, Event::AdminForceCheckIn) => {
            let mut next = reset(config, now, true);
            next.effects.push(Effect::Audit {
                kind: AuditKind::AdminForceCheckIn,
            });
            next
        }

        // -------------------------------------------------------------------
        // Escalation on a missed check-in.
        // -------------------------------------------------------------------
        (_, Event::Miss {
            expected_missed_count,
        }) => {
            if *expected_missed_count != config.current_missed_check_ins {
                // The user checked in (or an admin reset) after this
                // escalation was scheduled. Executing it must change nothing.
                return Step {
                    config: config.clone(),
                    effects: vec![Effect::Audit {
                        kind: AuditKind::EscalationSkippedStale,
                    }],
                };
            }

            let target = match config.status {
                PollingStatus::Active => PollingStatus::Grace1,
                PollingStatus::Grace1 => PollingStatus::Grace2,
                PollingStatus::Grace2 | PollingStatus::Grace3 => PollingStatus::Grace3,
                // Paused and Triggered are handled above.
                other => other,
            };
            let level = target.grace_level().unwrap_or(3);

            let mut cfg = config.clone();
            let entering_final_grace =
                config.status == PollingStatus::Grace2 && target == PollingStatus::Grace3;
            cfg.status = target;
            cfg.current_missed_check_ins += 1;
            cfg.updated_at = now;

            let mut effects = vec![
                Effect::CreateGracePeriodCheckIn { level },
                Effect::Audit {
                    kind: AuditKind::escalation_level(level),
                },
            ];
            if entering_final_grace {
                effects.push(Effect::EnqueueRelease {
                    after: cfg.grace_period(3),
                });
            }

            Step {
                config: cfg,
                effects,
            }
        }

        // -------------------------------------------------------------------
        // Terminal grace window elapsed.
        // -------------------------------------------------------------------
        (PollingStatus::Grace3, Event::GraceTimeout) => trigger(config, now),
        (_, Event::GraceTimeout) => Step::noop(config),

        // -------------------------------------------------------------------
        // Administrative pause / trigger.
        // -------------------------------------------------------------------
        (_, Event::Pause) => {
            let mut cfg = config.clone();
            cfg.status = PollingStatus::Paused;
            cfg.updated_at = now;
            Step {
                config: cfg,
                effects: vec![Effect::Audit {
                    kind: AuditKind::PollingPaused,
                }],
            }
        }
        (_, Event::AdminTrigger) => trigger(config, now),

        // Resume outside PAUSED is unspecified.
        (_, Event::Resume) => Step::noop(config),
    }
}

/// "reset": counter to zero, back to ACTIVE, next check-in one full period
/// out. `proof_of_life` additionally stamps `last_check_in_at`.
fn reset(config: &PollingConfig, now: DateTime<Utc>, proof_of_life: bool) -> Step {
    let mut cfg = config.clone();
    cfg.status = PollingStatus::Active;
    cfg.current_missed_check_ins = 0;
    cfg.next_check_in_due = now + cfg.interval.period();
    cfg.updated_at = now;
    if proof_of_life {
        cfg.last_check_in_at = Some(now);
    }
    Step {
        config: cfg,
        effects: vec![Effect::ScheduleNextCheckIn],
    }
}

fn trigger(config: &PollingConfig, now: DateTime<Utc>) -> Step {
    let mut cfg = config.clone();
    cfg.status = PollingStatus::Triggered;
    cfg.triggered_at = Some(now);
    cfg.updated_at = now;
    Step {
        config: cfg,
        effects: vec![Effect::Audit {
            kind: AuditKind::DeathProtocolTriggered,
        }],
    }
}
