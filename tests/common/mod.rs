//! Shared fixtures for the integration tests: fake collaborators and
//! request/pipeline builders.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use veritas::config::VeritasConfig;
use veritas::fuji::FujiGate;
use veritas::pipeline::DecisionPipeline;
use veritas::request::{CandidateOption, EvidenceItem, Request};
use veritas::services::{
    LlmClient, MemoryStore, SafetyHead, SafetyVerdict, ServiceError, Services, WorldModel,
};
use veritas::trustlog::TrustLog;
use veritas::types::EvidenceKind;

/// Memory store returning a fixed evidence set for every recall.
pub struct FakeMemory {
    pub items: Vec<EvidenceItem>,
}

impl FakeMemory {
    pub fn with_items(n: usize) -> Self {
        Self {
            items: (0..n)
                .map(|i| {
                    EvidenceItem::new(
                        format!("memory-{i}"),
                        format!("remembered fact {i}"),
                        0.9 - i as f64 * 0.05,
                        EvidenceKind::MemorySemantic,
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl MemoryStore for FakeMemory {
    async fn recall(
        &self,
        _query: &str,
        kind: EvidenceKind,
        limit: usize,
    ) -> Result<Vec<EvidenceItem>, ServiceError> {
        // Only answer for the semantic channel so counts stay predictable.
        if kind != EvidenceKind::MemorySemantic {
            return Ok(vec![]);
        }
        Ok(self.items.iter().take(limit).cloned().collect())
    }
}

/// Memory store that always fails, for degraded-path tests.
pub struct BrokenMemory;

#[async_trait]
impl MemoryStore for BrokenMemory {
    async fn recall(
        &self,
        _query: &str,
        _kind: EvidenceKind,
        _limit: usize,
    ) -> Result<Vec<EvidenceItem>, ServiceError> {
        Err(ServiceError::Backend {
            service: "memory",
            message: "index offline".to_string(),
        })
    }
}

/// World model returning one observation.
pub struct FakeWorld;

#[async_trait]
impl WorldModel for FakeWorld {
    async fn observe(&self, _query: &str) -> Result<Vec<EvidenceItem>, ServiceError> {
        Ok(vec![EvidenceItem::new(
            "world-state",
            "nothing unusual in the environment",
            0.7,
            EvidenceKind::World,
        )])
    }
}

/// LLM returning a fixed option list.
pub struct FakeLlm {
    pub options: Vec<CandidateOption>,
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn propose_options(
        &self,
        _query: &str,
        _goals: &[String],
        max: usize,
    ) -> Result<Vec<CandidateOption>, ServiceError> {
        Ok(self.options.iter().take(max).cloned().collect())
    }
}

/// Safety head returning a fixed verdict.
pub struct FakeSafetyHead {
    pub verdict: SafetyVerdict,
}

#[async_trait]
impl SafetyHead for FakeSafetyHead {
    async fn classify(&self, _text: &str) -> Result<SafetyVerdict, ServiceError> {
        Ok(self.verdict.clone())
    }
}

/// Services with enough fake evidence for the evidence gate to pass.
pub fn well_stocked_services() -> Services {
    Services::builder()
        .memory(Arc::new(FakeMemory::with_items(3)))
        .world(Arc::new(FakeWorld))
        .build()
}

/// A pipeline rooted in a fresh temp dir; the dir guard must stay alive for
/// the duration of the test.
pub fn pipeline_in(dir: &TempDir, services: Services) -> DecisionPipeline {
    let config = VeritasConfig {
        log_dir: dir.path().to_path_buf(),
        ..VeritasConfig::default()
    };
    let trust_log = TrustLog::open(
        dir.path(),
        config.trust_log_max_segment_bytes,
        config.trust_log_mirror_cap,
    )
    .expect("open trust log");
    DecisionPipeline::new(
        config,
        services,
        FujiGate::with_defaults().expect("default gate"),
        Arc::new(trust_log),
    )
}

/// The canonical benign request from the seed scenarios.
pub fn weather_request() -> Request {
    Request::builder()
        .query("Should I check tomorrow's weather?")
        .context("user_id", json!("u1"))
        .context("goals", json!(["health"]))
        .option(CandidateOption::new("o1", "check weather app").with_score(0.9))
        .build()
}
