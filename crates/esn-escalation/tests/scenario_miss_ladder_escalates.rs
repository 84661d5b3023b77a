use chrono::{Duration, TimeZone, Utc};
use esn_escalation::{step, Effect, Event};
use esn_schemas::{PollInterval, PollingConfig, PollingStatus};
use uuid::Uuid;

fn config_at_t0() -> (PollingConfig, chrono::DateTime<Utc>) {
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    (PollingConfig::new(Uuid::new_v4(), PollInterval::Monthly, t0), t0)
}

#[test]
fn scenario_four_fresh_misses_walk_the_grace_ladder() {
    let (mut cfg, t0) = config_at_t0();

    // Miss 1: ACTIVE -> GRACE_1.
    let out = step(&cfg, &Event::Miss { expected_missed_count: 0 }, t0 + Duration::days(7));
    assert_eq!(out.config.status, PollingStatus::Grace1);
    assert_eq!(out.config.current_missed_check_ins, 1);
    assert!(out.has_effect(|e| matches!(e, Effect::CreateGracePeriodCheckIn { level: 1 })));
    assert!(!out.has_effect(|e| matches!(e, Effect::EnqueueRelease { .. })));
    cfg = out.config;

    // Miss 2: GRACE_1 -> GRACE_2.
    let out = step(&cfg, &Event::Miss { expected_missed_count: 1 }, t0 + Duration::days(14));
    assert_eq!(out.config.status, PollingStatus::Grace2);
    assert_eq!(out.config.current_missed_check_ins, 2);
    cfg = out.config;

    // Miss 3: GRACE_2 -> GRACE_3 arms the release, delayed by grace 3.
    let out = step(&cfg, &Event::Miss { expected_missed_count: 2 }, t0 + Duration::days(28));
    assert_eq!(out.config.status, PollingStatus::Grace3);
    assert_eq!(out.config.current_missed_check_ins, 3);
    assert!(out.has_effect(|e| matches!(
        e,
        Effect::EnqueueRelease { after } if *after == Duration::days(7)
    )));
    cfg = out.config;

    // Miss 4: stays GRACE_3, counter keeps climbing, release NOT re-armed
    // (the scheduler's timeout scan is the safety net).
    let out = step(&cfg, &Event::Miss { expected_missed_count: 3 }, t0 + Duration::days(35));
    assert_eq!(out.config.status, PollingStatus::Grace3);
    assert_eq!(out.config.current_missed_check_ins, 4);
    assert!(out.has_effect(|e| matches!(e, Effect::CreateGracePeriodCheckIn { level: 3 })));
    assert!(!out.has_effect(|e| matches!(e, Effect::EnqueueRelease { .. })));
}

#[test]
fn scenario_grace_timeout_triggers_only_from_grace_3() {
    let (cfg, t0) = config_at_t0();

    // ACTIVE + GraceTimeout is unspecified: no-op.
    let out = step(&cfg, &Event::GraceTimeout, t0 + Duration::days(40));
    assert!(!out.is_transition(&cfg));
    assert!(out.effects.is_empty());

    // Walk to GRACE_3, then time out.
    let mut cfg = cfg;
    for (i, day) in [7i64, 14, 28].iter().enumerate() {
        cfg = step(
            &cfg,
            &Event::Miss { expected_missed_count: i as i32 },
            t0 + Duration::days(*day),
        )
        .config;
    }
    assert_eq!(cfg.status, PollingStatus::Grace3);

    let fired_at = t0 + Duration::days(35);
    let out = step(&cfg, &Event::GraceTimeout, fired_at);
    assert_eq!(out.config.status, PollingStatus::Triggered);
    assert_eq!(out.config.triggered_at, Some(fired_at));

    // Terminal: nothing moves it afterwards.
    let after = step(&out.config, &Event::Confirm, fired_at + Duration::days(1));
    assert!(!after.is_transition(&out.config));
    assert!(after.effects.is_empty());
}

#[test]
fn step_is_deterministic_for_identical_inputs() {
    let (cfg, t0) = config_at_t0();
    let ev = Event::Miss { expected_missed_count: 0 };
    let now = t0 + Duration::days(7);
    assert_eq!(step(&cfg, &ev, now), step(&cfg, &ev, now));
}
