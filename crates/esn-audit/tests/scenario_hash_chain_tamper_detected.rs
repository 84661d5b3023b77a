use chrono::{TimeZone, Utc};
use esn_audit::{export_jsonl, verify_hash_chain_str, AuditEvent, VerifyResult};
use esn_schemas::AuditKind;
use serde_json::json;
use uuid::Uuid;

fn chain_of(n: usize) -> Vec<AuditEvent> {
    let user = Uuid::new_v4();
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let mut prev: Option<String> = None;
    let mut out = Vec::new();
    for i in 0..n {
        let ev = AuditEvent::chained(
            Uuid::new_v4(),
            Some(user),
            t0 + chrono::Duration::minutes(i as i64),
            AuditKind::CheckInConfirmed,
            json!({ "seq": i }),
            prev.clone(),
        )
        .unwrap();
        prev = ev.hash_self.clone();
        out.push(ev);
    }
    out
}

#[test]
fn scenario_intact_chain_verifies() {
    let events = chain_of(5);
    let jsonl = export_jsonl(&events).unwrap();
    let res = verify_hash_chain_str(&jsonl).unwrap();
    assert_eq!(res, VerifyResult::Valid { lines: 5 });
}

#[test]
fn scenario_tampered_payload_breaks_chain() {
    let events = chain_of(4);
    let jsonl = export_jsonl(&events).unwrap();

    // Flip a payload byte in line 3 without recomputing hashes.
    let tampered: String = jsonl
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i == 2 {
                l.replace("\"seq\":2", "\"seq\":99")
            } else {
                l.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    match verify_hash_chain_str(&tampered).unwrap() {
        VerifyResult::Broken { line, .. } => assert_eq!(line, 3),
        other => panic!("expected broken chain, got {other:?}"),
    }
}

#[test]
fn scenario_dropped_event_breaks_chain() {
    let events = chain_of(4);
    let jsonl = export_jsonl(&events).unwrap();

    // Delete line 2: line 3's hash_prev no longer matches.
    let truncated: String = jsonl
        .lines()
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(_, l)| l.to_string())
        .collect::<Vec<_>>()
        .join("\n");

    match verify_hash_chain_str(&truncated).unwrap() {
        VerifyResult::Broken { line, .. } => assert_eq!(line, 2),
        other => panic!("expected broken chain, got {other:?}"),
    }
}
