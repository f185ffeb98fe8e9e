//! The stage execution contract.
//!
//! A [`Stage`] is one named step in the fixed pipeline order. Stages receive
//! an immutable [`StateSnapshot`](crate::state::StateSnapshot) plus a
//! [`StageContext`] and return a [`StagePatch`] — the orchestrator owns the
//! state and applies patches between stages.
//!
//! # Design
//!
//! - **Pure**: a stage touches no external state beyond the collaborators in
//!   its context, and only I/O-bound stages may suspend.
//! - **Classified**: [`StageClass::Critical`] failures short-circuit the
//!   pipeline; [`StageClass::BestEffort`] failures degrade to a neutral
//!   output plus a `stage_failure` critique.
//! - **Skippable**: a stage whose output slot is already populated is
//!   skipped with reason `pre_filled` and zero recorded latency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::VeritasConfig;
use crate::request::{CandidateOption, Critique, EvidenceItem, Request};
use crate::services::Services;
use crate::state::{DebateResult, NormalizedInput, Plan, StateSnapshot, ValueScore};
use crate::types::StageName;

// ============================================================================
// Core trait
// ============================================================================

/// Failure classification for a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageClass {
    /// Failure aborts the pipeline with a structured `hold`.
    Critical,
    /// Failure degrades: neutral output + a `stage_failure` critique.
    BestEffort,
}

/// One named step in the decision pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// This stage's identity in the fixed order.
    fn name(&self) -> StageName;

    /// Failure classification; most stages are best-effort.
    fn class(&self) -> StageClass {
        StageClass::BestEffort
    }

    /// Whether the caller already supplied this stage's output.
    fn prefilled(&self, snapshot: &StateSnapshot) -> bool;

    /// Execute the stage against a snapshot of accumulated state.
    async fn run(
        &self,
        request: &Request,
        snapshot: StateSnapshot,
        ctx: &StageContext,
    ) -> Result<StagePatch, StageError>;
}

// ============================================================================
// Execution context
// ============================================================================

/// Everything a stage may consult besides the state snapshot.
#[derive(Clone)]
pub struct StageContext {
    /// The request id, generated once at entry.
    pub request_id: String,
    /// Shared configuration (limits, budgets, thresholds).
    pub config: Arc<VeritasConfig>,
    /// External collaborators; stages check availability.
    pub services: Arc<Services>,
    /// Absolute deadline for the whole request.
    pub deadline: Instant,
}

impl StageContext {
    /// Time remaining before the request deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the overall deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

// ============================================================================
// State updates
// ============================================================================

/// Partial state update returned by a stage.
///
/// All slots are optional; a stage fills only what it produced. Critiques
/// merge into the existing set (keyed by issue) rather than replacing it.
#[derive(Clone, Debug, Default)]
pub struct StagePatch {
    pub normalized: Option<NormalizedInput>,
    pub options: Option<Vec<CandidateOption>>,
    pub evidence: Option<Vec<EvidenceItem>>,
    pub critiques: Option<Vec<Critique>>,
    pub debate: Option<DebateResult>,
    pub plan: Option<Plan>,
    pub values: Option<ValueScore>,
}

impl StagePatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_normalized(mut self, normalized: NormalizedInput) -> Self {
        self.normalized = Some(normalized);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: Vec<CandidateOption>) -> Self {
        self.options = Some(options);
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: Vec<EvidenceItem>) -> Self {
        self.evidence = Some(evidence);
        self
    }

    #[must_use]
    pub fn with_critiques(mut self, critiques: Vec<Critique>) -> Self {
        self.critiques = Some(critiques);
        self
    }

    #[must_use]
    pub fn with_debate(mut self, debate: DebateResult) -> Self {
        self.debate = Some(debate);
        self
    }

    #[must_use]
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    #[must_use]
    pub fn with_values(mut self, values: ValueScore) -> Self {
        self.values = Some(values);
        self
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Per-stage execution record attached to the response and the trust log.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StageMetrics {
    pub latency_ms: u64,
    pub ok: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StageMetrics {
    /// A successful run.
    #[must_use]
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            ok: true,
            skipped: false,
            reason: None,
        }
    }

    /// A skip: zero latency, reason recorded.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            latency_ms: 0,
            ok: true,
            skipped: true,
            reason: Some(reason.into()),
        }
    }

    /// A failure with the observed latency.
    #[must_use]
    pub fn failed(latency_ms: u64, reason: impl Into<String>) -> Self {
        Self {
            latency_ms,
            ok: false,
            skipped: false,
            reason: Some(reason.into()),
        }
    }
}

/// All stage metrics for one decide call, in execution order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineMetrics {
    pub stages: Vec<(StageName, StageMetrics)>,
    /// Sum of stage latencies plus orchestrator overhead.
    pub total_latency_ms: u64,
}

impl PipelineMetrics {
    /// Record one stage's metrics.
    pub fn record(&mut self, stage: StageName, metrics: StageMetrics) {
        self.stages.push((stage, metrics));
    }

    /// Lookup by stage name.
    #[must_use]
    pub fn get(&self, stage: StageName) -> Option<&StageMetrics> {
        self.stages
            .iter()
            .find(|(name, _)| *name == stage)
            .map(|(_, m)| m)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Fatal-to-this-stage errors. Whether the pipeline survives depends on the
/// stage's [`StageClass`].
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// A prior stage's output this stage depends on is missing.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(veritas::stage::missing_input),
        help("Check that the earlier stage produced the required data: {what}.")
    )]
    MissingInput { what: &'static str },

    /// An external collaborator failed after retries.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(veritas::stage::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// The stage exceeded its latency budget.
    #[error("stage {stage} exceeded its {budget:?} budget")]
    #[diagnostic(code(veritas::stage::budget))]
    BudgetExceeded { stage: StageName, budget: Duration },

    /// Input validation failed inside the stage.
    #[error("validation failed: {0}")]
    #[diagnostic(code(veritas::stage::validation))]
    ValidationFailed(String),

    /// JSON serialization error.
    #[error(transparent)]
    #[diagnostic(code(veritas::stage::serde_json))]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_metrics_have_zero_latency() {
        let m = StageMetrics::skipped("pre_filled");
        assert_eq!(m.latency_ms, 0);
        assert!(m.skipped);
        assert!(m.ok);
        assert_eq!(m.reason.as_deref(), Some("pre_filled"));
    }

    #[test]
    fn metrics_lookup_by_stage() {
        let mut metrics = PipelineMetrics::default();
        metrics.record(StageName::RunDebate, StageMetrics::ok(12));
        metrics.record(
            StageName::RunPlanner,
            StageMetrics::failed(3, "cycle detected"),
        );

        assert!(metrics.get(StageName::RunDebate).unwrap().ok);
        assert!(!metrics.get(StageName::RunPlanner).unwrap().ok);
        assert!(metrics.get(StageName::FujiGate).is_none());
    }

    #[test]
    fn patch_builder_fills_slots() {
        let patch = StagePatch::new().with_plan(Plan::default());
        assert!(patch.plan.is_some());
        assert!(patch.options.is_none());
    }
}
