use chrono::{Duration, TimeZone, Utc};
use esn_escalation::{step, Effect, Event};
use esn_schemas::{AuditKind, PollInterval, PollingConfig, PollingStatus};
use uuid::Uuid;

fn grace_1_config() -> (PollingConfig, chrono::DateTime<Utc>) {
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let cfg = PollingConfig::new(Uuid::new_v4(), PollInterval::Monthly, t0);
    let cfg = step(&cfg, &Event::Miss { expected_missed_count: 0 }, t0 + Duration::days(7)).config;
    (cfg, t0)
}

#[test]
fn scenario_pause_freezes_escalation_until_resume() {
    let (cfg, t0) = grace_1_config();

    let paused = step(&cfg, &Event::Pause, t0 + Duration::days(8)).config;
    assert_eq!(paused.status, PollingStatus::Paused);
    // Counter is retained while paused; only resume resets it.
    assert_eq!(paused.current_missed_check_ins, 1);

    // Misses, confirms, timeouts, and admin-trigger are all inert while paused.
    for ev in [
        Event::Miss { expected_missed_count: 1 },
        Event::Confirm,
        Event::GraceTimeout,
        Event::AdminTrigger,
        Event::Pause,
    ] {
        let out = step(&paused, &ev, t0 + Duration::days(14));
        assert!(!out.is_transition(&paused), "{ev:?} must be inert while paused");
    }

    // Resume: back to ACTIVE, counter cleared, next due a full period out.
    let resume_at = t0 + Duration::days(20);
    let out = step(&paused, &Event::Resume, resume_at);
    assert_eq!(out.config.status, PollingStatus::Active);
    assert_eq!(out.config.current_missed_check_ins, 0);
    assert_eq!(out.config.next_check_in_due, resume_at + Duration::days(30));
    // Resume is a reschedule, not a proof of life.
    assert_eq!(out.config.last_check_in_at, None);
    assert!(out.has_effect(|e| matches!(e, Effect::Audit { kind: AuditKind::PollingResumed })));
}

#[test]
fn scenario_admin_force_check_in_resets_like_a_confirmation() {
    let (cfg, t0) = grace_1_config();
    let forced_at = t0 + Duration::days(9);

    let out = step(&cfg, &Event::AdminForceCheckIn, forced_at);
    assert_eq!(out.config.status, PollingStatus::Active);
    assert_eq!(out.config.current_missed_check_ins, 0);
    assert_eq!(out.config.last_check_in_at, Some(forced_at));
    assert!(out.has_effect(|e| matches!(e, Effect::Audit { kind: AuditKind::AdminForceCheckIn })));

    // It also works from PAUSED (the second escape hatch).
    let paused = step(&cfg, &Event::Pause, t0 + Duration::days(8)).config;
    let out = step(&paused, &Event::AdminForceCheckIn, forced_at);
    assert_eq!(out.config.status, PollingStatus::Active);
}

#[test]
fn scenario_admin_trigger_is_immediate_and_terminal() {
    let (cfg, t0) = grace_1_config();
    let at = t0 + Duration::days(10);

    let out = step(&cfg, &Event::AdminTrigger, at);
    assert_eq!(out.config.status, PollingStatus::Triggered);
    assert_eq!(out.config.triggered_at, Some(at));
    assert!(out.has_effect(|e| matches!(
        e,
        Effect::Audit { kind: AuditKind::DeathProtocolTriggered }
    )));

    // No event moves a triggered config.
    for ev in [
        Event::Confirm,
        Event::Miss { expected_missed_count: 1 },
        Event::GraceTimeout,
        Event::Pause,
        Event::Resume,
        Event::AdminForceCheckIn,
        Event::AdminTrigger,
    ] {
        let after = step(&out.config, &ev, at + Duration::days(1));
        assert!(!after.is_transition(&out.config));
        assert!(after.effects.is_empty());
    }
}

#[test]
fn scenario_confirm_resets_from_every_grace_level() {
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let base = PollingConfig::new(Uuid::new_v4(), PollInterval::Monthly, t0);

    // Build configs sitting at GRACE_1, GRACE_2, GRACE_3.
    let mut at_level = Vec::new();
    let mut cfg = base;
    for miss in 0..3 {
        cfg = step(
            &cfg,
            &Event::Miss { expected_missed_count: miss },
            t0 + Duration::days(7 * (miss as i64 + 1)),
        )
        .config;
        at_level.push(cfg.clone());
    }

    for (i, grace_cfg) in at_level.iter().enumerate() {
        let confirmed_at = t0 + Duration::days(40 + i as i64);
        let out = step(grace_cfg, &Event::Confirm, confirmed_at);
        assert_eq!(out.config.status, PollingStatus::Active);
        assert_eq!(out.config.current_missed_check_ins, 0);
        assert_eq!(out.config.last_check_in_at, Some(confirmed_at));
        assert_eq!(out.config.next_check_in_due, confirmed_at + Duration::days(30));
    }
}
