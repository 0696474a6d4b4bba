//! Rule files on disk through to diagnostic messages.

use std::sync::Arc;
use std::thread;

use serde_json::json;

use conduit_doctor::{
    load_rules_from_path, load_rules_from_str, BuildInfo, DiagnosticMessage, DoctorContext,
    DoctorEngine, PreconditionPolicy, StageContext,
};
use conduit_types::{ConduitError, StageConfiguration, StageDefinition, StageKind};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine(rules: &str, policy: PreconditionPolicy) -> DoctorEngine {
    let context = DoctorContext::new(BuildInfo::new("5.3.0")).with_env("REGION", "eu");
    DoctorEngine::new(&context, load_rules_from_str(rules).unwrap(), policy)
}

fn stage() -> (StageDefinition, StageConfiguration) {
    (
        StageDefinition::new("http", "client", "2", StageKind::Processor),
        StageConfiguration::new("http_1", "http", "client", "2")
            .with_config("url", json!("https://api.local")),
    )
}

fn summaries(messages: &[DiagnosticMessage]) -> Vec<String> {
    messages.iter().map(|m| m.summary.clone()).collect()
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[test]
fn rule_that_always_matches() {
    let engine = engine(
        r#"[{"uuid": "r1", "entity": "stage", "conditions": ["1==1"],
             "message": {"summary": "Always matches"}}]"#,
        PreconditionPolicy::Enforce,
    );
    let (definition, configuration) = stage();
    let err = ConduitError::Other("anything at all".into());
    let messages = engine.on_stage_error(&StageContext::new(&definition, &configuration), &err);
    assert_eq!(summaries(&messages), vec!["Always matches"]);
}

#[test]
fn false_condition_rule_is_skipped_and_empty_condition_rule_matches() {
    let engine = engine(
        r#"[{"uuid": "r1", "entity": "stage", "conditions": ["false"], "message": {"summary": "No"}},
            {"uuid": "r2", "entity": "stage", "conditions": [], "message": {"summary": "Yes"}}]"#,
        PreconditionPolicy::Enforce,
    );
    let (definition, configuration) = stage();
    let messages = engine.on_stage_message(&StageContext::new(&definition, &configuration), "boom");
    assert_eq!(summaries(&messages), vec!["Yes"]);
}

#[test]
fn identical_rules_are_not_deduplicated() {
    let engine = engine(
        r#"[{"uuid": "d1", "entity": "stage", "message": {"summary": "Dup"}},
            {"uuid": "d2", "entity": "stage", "message": {"summary": "Dup"}}]"#,
        PreconditionPolicy::Enforce,
    );
    let (definition, configuration) = stage();
    let messages = engine.on_stage_message(&StageContext::new(&definition, &configuration), "x");
    assert_eq!(summaries(&messages), vec!["Dup", "Dup"]);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

const MIXED_RULES: &str = r#"{"rules": [
    {"uuid": "scope", "entity": "pipeline", "message": {"summary": "pipeline scope"}},
    {"uuid": "env", "entity": "stage", "preconditions": ["env.REGION == 'eu'"],
     "conditions": ["str:startsWith(stage.config.url, 'https')"],
     "message": {"summary": "TLS endpoint ${stage.config.url}", "description": "${issue.message}"}},
    {"uuid": "us-only", "entity": "stage", "preconditions": ["env.REGION == 'us'"],
     "message": {"summary": "US region"}},
    {"uuid": "broken", "entity": "stage", "conditions": ["issue.message > 3"],
     "message": {"summary": "broken"}},
    {"uuid": "last", "entity": "stage", "message": {"summary": "fallback"}}
]}"#;

#[test]
fn scope_filtering_error_containment_and_order() {
    let engine = engine(MIXED_RULES, PreconditionPolicy::Enforce);
    let stats = engine.stats();
    assert_eq!(stats.declared, 5);
    assert_eq!(stats.out_of_scope, 1);
    assert_eq!(stats.excluded, 1);

    let (definition, configuration) = stage();
    let messages = engine.on_stage_message(&StageContext::new(&definition, &configuration), "handshake failed");
    assert_eq!(
        summaries(&messages),
        vec!["TLS endpoint https://api.local", "fallback"]
    );
    assert_eq!(messages[0].description, "handshake failed");
}

#[test]
fn lenient_policy_keeps_the_region_gated_rule() {
    let engine = engine(MIXED_RULES, PreconditionPolicy::Lenient);
    let (definition, configuration) = stage();
    let messages = engine.on_stage_message(&StageContext::new(&definition, &configuration), "x");
    assert_eq!(
        summaries(&messages),
        vec!["TLS endpoint https://api.local", "US region", "fallback"]
    );
}

#[test]
fn shared_engine_is_deterministic_across_threads() {
    let engine = Arc::new(engine(MIXED_RULES, PreconditionPolicy::Enforce));
    let (definition, configuration) = stage();
    let expected =
        engine.on_stage_message(&StageContext::new(&definition, &configuration), "same input");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let (definition, configuration) = stage();
            thread::spawn(move || {
                engine.on_stage_message(&StageContext::new(&definition, &configuration), "same input")
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn rules_load_from_a_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    std::fs::write(&path, MIXED_RULES).unwrap();
    let rules = load_rules_from_path(&path).unwrap();
    assert_eq!(rules.len(), 5);
}
