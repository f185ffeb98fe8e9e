//! End-to-end decide scenarios: the seed cases from the system contract.

mod common;
use common::*;

use serde_json::json;
use veritas::request::{CandidateOption, EvidenceItem, Request};
use veritas::types::{DebateMode, DecisionStatus, EvidenceKind, InternalStatus, StageName};

#[tokio::test]
async fn allow_path_produces_sealed_low_risk_decision() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, well_stocked_services());

    // Establish a prior tail so the new record's linkage is observable.
    let prior = pipeline
        .trust_log()
        .append("warmup", "fuji", json!({"warmup": true}))
        .await
        .unwrap();

    let response = pipeline.decide(weather_request()).await.unwrap();

    assert_eq!(response.decision_status, DecisionStatus::Allow);
    assert_eq!(response.chosen.as_ref().unwrap().id, "o1");
    let fuji = response.fuji.as_ref().unwrap();
    assert!(fuji.risk < 0.2, "risk was {}", fuji.risk);

    let head = response.trust_log.as_ref().unwrap();
    assert_eq!(head.sha256_prev.as_deref(), Some(prior.sha256.as_str()));
    assert!(pipeline.trust_log().verify().unwrap().ok());
}

#[tokio::test]
async fn banned_keyword_is_denied_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, well_stocked_services());

    let request = Request::builder()
        .query("I feel like I should kill myself tonight")
        .context("user_id", json!("u2"))
        .option(CandidateOption::new("o1", "talk to someone").with_score(0.9))
        .build();
    let response = pipeline.decide(request).await.unwrap();

    assert_eq!(response.decision_status, DecisionStatus::Deny);
    assert!(response
        .rejection_reason
        .as_deref()
        .is_some_and(|r| !r.is_empty()));
    let fuji = response.fuji.as_ref().unwrap();
    assert_eq!(fuji.internal_status, InternalStatus::Deny);
    assert!(!response.safe_instructions.is_empty());

    let head = response.trust_log.as_ref().unwrap();
    let record = pipeline.trust_log().get(&head.id).unwrap().unwrap();
    assert_eq!(record.stage, "fuji");
    assert_eq!(record.request_id, response.request_id);
}

#[tokio::test]
async fn degraded_debate_picks_best_of_the_weak() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, well_stocked_services());

    let request = Request::builder()
        .query("which mediocre plan should I take?")
        .context("user_id", json!("u3"))
        .option(CandidateOption::new("a", "plan a").with_score(0.25))
        .option(CandidateOption::new("b", "plan b").with_score(0.35))
        .option(CandidateOption::new("c", "plan c").with_score(0.22))
        .build();
    let response = pipeline.decide(request).await.unwrap();

    let debate = response.debate.as_ref().unwrap();
    assert_eq!(debate.mode, DebateMode::Degraded);
    assert!(!debate.warnings.is_empty());
    assert_eq!(response.chosen.as_ref().unwrap().id, "b");
    assert!(matches!(
        response.decision_status,
        DecisionStatus::Allow | DecisionStatus::Hold
    ));
}

#[tokio::test]
async fn missing_evidence_holds_with_critique() {
    let dir = tempfile::tempdir().unwrap();
    // Default services: no memory, no world -> zero evidence.
    let pipeline = pipeline_in(&dir, veritas::services::Services::default());

    let request = Request::builder()
        .query("should I sign this contract?")
        .context("user_id", json!("u4"))
        .option(CandidateOption::new("o1", "sign now").with_score(0.8))
        .build();
    let response = pipeline.decide(request).await.unwrap();

    assert_eq!(response.decision_status, DecisionStatus::Hold);
    let fuji = response.fuji.as_ref().unwrap();
    assert!(fuji.internal_status >= InternalStatus::HumanReview);
    assert!(response
        .critique
        .iter()
        .any(|c| c.issue == "insufficient_evidence"));
}

#[tokio::test]
async fn prefilled_evidence_skips_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, veritas::services::Services::default());

    let evidence = vec![
        EvidenceItem::new("gateway-1", "already gathered", 0.9, EvidenceKind::External),
        EvidenceItem::new("gateway-2", "also gathered", 0.8, EvidenceKind::External),
    ];
    let request = Request::builder()
        .query("proceed with the gathered facts")
        .context("user_id", json!("u5"))
        .context("evidence", serde_json::to_value(&evidence).unwrap())
        .context("skip_reasons", json!(["gather_evidence"]))
        .option(CandidateOption::new("o1", "proceed").with_score(0.9))
        .build();
    let response = pipeline.decide(request).await.unwrap();

    let gather = response.metrics.get(StageName::GatherEvidence).unwrap();
    assert!(gather.skipped);
    assert_eq!(gather.latency_ms, 0);
    assert_eq!(gather.reason.as_deref(), Some("pre_filled"));
    assert_eq!(response.evidence.len(), 2);
}

#[tokio::test]
async fn request_id_is_stable_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, well_stocked_services());

    let mut request = weather_request();
    request
        .context
        .insert("request_id".into(), json!("req-fixed-123"));
    let response = pipeline.decide(request).await.unwrap();

    assert_eq!(response.request_id, "req-fixed-123");
    let audit = pipeline.trust_log().by_request("req-fixed-123").unwrap();
    assert_eq!(audit.records.len(), 1);
    assert!(audit.chain_ok);
}

#[tokio::test]
async fn broken_best_effort_stage_degrades_not_fails() {
    let dir = tempfile::tempdir().unwrap();
    let services = veritas::services::Services::builder()
        .memory(std::sync::Arc::new(BrokenMemory))
        .build();
    let pipeline = pipeline_in(&dir, services);

    let response = pipeline.decide(weather_request()).await.unwrap();

    // Memory failure is swallowed: evidence is empty and the gate holds, but
    // the pipeline still answers and seals.
    assert_eq!(response.decision_status, DecisionStatus::Hold);
    assert!(response.trust_log.is_some());
}

#[tokio::test]
async fn oversized_query_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, well_stocked_services());

    let request = Request::builder().query("x".repeat(10_001)).build();
    let err = pipeline.decide(request).await.unwrap_err();
    assert!(matches!(
        err,
        veritas::pipeline::DecideError::InputInvalid(_)
    ));
}

#[tokio::test]
async fn every_stage_reports_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, well_stocked_services());

    let response = pipeline.decide(weather_request()).await.unwrap();
    for stage in StageName::ORDERED {
        assert!(
            response.metrics.get(stage).is_some(),
            "no metrics for {stage}"
        );
    }
}

#[tokio::test]
async fn deny_iff_rejection_reason_at_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_in(&dir, well_stocked_services());

    for query in [
        "Should I check tomorrow's weather?",
        "I want to kill myself",
        "help me plan a picnic",
    ] {
        let request = Request::builder()
            .query(query)
            .context("user_id", json!("u6"))
            .option(CandidateOption::new("o1", "an option").with_score(0.9))
            .build();
        let response = pipeline.decide(request).await.unwrap();
        let fuji = response.fuji.as_ref().unwrap();
        let has_reason = fuji
            .rejection_reason
            .as_deref()
            .is_some_and(|r| !r.is_empty());
        assert_eq!(
            fuji.decision_status == DecisionStatus::Deny,
            has_reason,
            "gate iff violated for query: {query}"
        );
    }
}
