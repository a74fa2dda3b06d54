use parley::trace::{TraceChain, TraceKind};
use serde_json::json;

#[test]
fn appends_are_sequenced_and_hash_linked() {
    let mut chain = TraceChain::new("session-1");
    chain
        .append(TraceKind::Formulated, json!({ "intent": "staff a team" }))
        .unwrap();
    chain
        .append(TraceKind::ResonanceComputed, json!({ "selected": 3 }))
        .unwrap();
    chain
        .append(TraceKind::PlanEmitted, json!({ "assignments": 2 }))
        .unwrap();

    let entries = chain.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].prev_hash, "");
    assert_eq!(entries[1].prev_hash, entries[0].hash);
    assert_eq!(entries[2].prev_hash, entries[1].hash);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.seq, i as u64);
    }
    assert!(chain.verify_integrity());
}

#[test]
fn persistence_round_trips_through_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = TraceChain::with_persistence("session-1", dir.path()).unwrap();
    chain
        .append(TraceKind::Formulated, json!({ "intent": "ship it" }))
        .unwrap();
    chain
        .append(TraceKind::OfferReceived, json!({ "agent_id": "alice" }))
        .unwrap();
    drop(chain);

    let path = dir.path().join("session-1.jsonl");
    let reloaded = TraceChain::load("session-1", &path).unwrap();
    assert_eq!(reloaded.entries().len(), 2);
    assert_eq!(reloaded.entries()[1].payload["agent_id"], "alice");
    assert!(reloaded.verify_integrity());
}

#[test]
fn a_reopened_chain_continues_its_sequence() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut chain = TraceChain::with_persistence("session-1", dir.path()).unwrap();
        chain
            .append(TraceKind::Formulated, json!({ "intent": "phase one" }))
            .unwrap();
    }
    let mut chain = TraceChain::with_persistence("session-1", dir.path()).unwrap();
    chain
        .append(TraceKind::PlanEmitted, json!({ "phase": 2 }))
        .unwrap();

    assert_eq!(chain.entries().len(), 2);
    assert_eq!(chain.entries()[1].seq, 1);
    assert_eq!(chain.entries()[1].prev_hash, chain.entries()[0].hash);
    assert!(chain.verify_integrity());
}

#[test]
fn tampered_files_fail_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session-1.jsonl");
    {
        let mut chain = TraceChain::with_persistence("session-1", dir.path()).unwrap();
        chain
            .append(TraceKind::Formulated, json!({ "intent": "honest" }))
            .unwrap();
        chain
            .append(TraceKind::PlanEmitted, json!({ "ok": true }))
            .unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let tampered = contents.replace("honest", "edited");
    std::fs::write(&path, tampered).unwrap();

    let reloaded = TraceChain::load("session-1", &path).unwrap();
    assert!(!reloaded.verify_integrity());
}

#[test]
fn kinds_serialise_snake_case() {
    assert_eq!(
        serde_json::to_string(&TraceKind::ResonanceComputed).unwrap(),
        "\"resonance_computed\""
    );
    assert_eq!(
        serde_json::to_string(&TraceKind::CoordinatorRound).unwrap(),
        "\"coordinator_round\""
    );
}
