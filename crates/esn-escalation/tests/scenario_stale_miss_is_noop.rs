use chrono::{Duration, TimeZone, Utc};
use esn_escalation::{step, Effect, Event};
use esn_schemas::{AuditKind, PollInterval, PollingConfig, PollingStatus};
use uuid::Uuid;

#[test]
fn scenario_confirm_between_enqueue_and_apply_cancels_the_escalation() {
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let cfg = PollingConfig::new(Uuid::new_v4(), PollInterval::Monthly, t0);

    // Miss at day 7 -> GRACE_1 with counter 1; an escalation for the next
    // level is conceptually in flight carrying expected_missed_count = 1.
    let cfg = step(&cfg, &Event::Miss { expected_missed_count: 0 }, t0 + Duration::days(7)).config;
    assert_eq!(cfg.current_missed_check_ins, 1);

    // The user confirms at day 8: counter back to 0, ACTIVE.
    let cfg = step(&cfg, &Event::Confirm, t0 + Duration::days(8)).config;
    assert_eq!(cfg.status, PollingStatus::Active);
    assert_eq!(cfg.current_missed_check_ins, 0);

    // The delayed escalation fires at day 10 with the stale counter.
    let out = step(&cfg, &Event::Miss { expected_missed_count: 1 }, t0 + Duration::days(10));
    assert!(!out.is_transition(&cfg), "stale miss must not change state");
    assert!(out.has_effect(|e| matches!(
        e,
        Effect::Audit { kind: AuditKind::EscalationSkippedStale }
    )));
}

#[test]
fn scenario_stale_guard_is_exact_counter_equality() {
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let mut cfg = PollingConfig::new(Uuid::new_v4(), PollInterval::Weekly, t0);
    cfg = step(&cfg, &Event::Miss { expected_missed_count: 0 }, t0 + Duration::days(7)).config;
    cfg = step(&cfg, &Event::Miss { expected_missed_count: 1 }, t0 + Duration::days(14)).config;
    assert_eq!(cfg.current_missed_check_ins, 2);

    // Too-low AND too-high expectations are both stale.
    for expected in [0, 1, 3, 5] {
        let out = step(
            &cfg,
            &Event::Miss { expected_missed_count: expected },
            t0 + Duration::days(15),
        );
        assert!(!out.is_transition(&cfg), "expected={expected} should be stale");
    }

    // The matching counter is fresh.
    let out = step(&cfg, &Event::Miss { expected_missed_count: 2 }, t0 + Duration::days(15));
    assert!(out.is_transition(&cfg));
    assert_eq!(out.config.status, PollingStatus::Grace3);
}
