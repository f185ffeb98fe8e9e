//! FUJI: the layered safety gate.
//!
//! FUJI decides whether a draft decision is admitted, modified, parked for a
//! human, or denied. Five layers run in a fixed order — keyword/pattern,
//! safety head, policy rules, evidence gate, PII — each contributing a score
//! and optional violations. Aggregation takes the weighted risk, the
//! strictest status proposal, and applies the hard-block set; the coerced
//! invariants then guarantee that an internal deny always surfaces as a
//! client-facing deny with a non-empty rejection reason.
//!
//! The gate is `critical` from the pipeline's point of view: if it cannot
//! produce a valid [`FujiDecision`], the pipeline answers `hold` with
//! `rejection_reason = "fuji_unavailable"`.

pub mod decision;
pub mod layers;
pub mod patch;
pub mod policy;

use std::time::Duration;

use rustc_hash::FxHashMap;

pub use decision::{FujiDecision, LayerOutcome, Violation};
pub use patch::{Patch, PatchField};
pub use policy::{CompiledPolicy, GatePolicy, PolicyError, PolicyStore};

use layers::{
    EvidenceGateLayer, GateInput, GateLayer, KeywordLayer, PiiLayer, PolicyLayer, SafetyHeadLayer,
};

use crate::request::{CandidateOption, Critique};
use crate::services::Services;
use crate::types::{DecisionStatus, InternalStatus, LayerName, clamp01};

/// The draft decision handed to the gate.
pub struct GateRequest<'a> {
    pub query: &'a str,
    pub chosen: Option<&'a CandidateOption>,
    pub evidence_len: usize,
    pub critiques: &'a [Critique],
    /// Budget remaining for external calls inside the gate.
    pub remaining: Duration,
}

/// The layered admission controller.
pub struct FujiGate {
    store: PolicyStore,
    keyword: KeywordLayer,
    safety_head: SafetyHeadLayer,
    policy: PolicyLayer,
    evidence: EvidenceGateLayer,
    pii: PiiLayer,
}

impl FujiGate {
    /// Gate backed by the compiled-in default policy.
    pub fn with_defaults() -> Result<Self, PolicyError> {
        Ok(Self::new(PolicyStore::with_defaults()?))
    }

    /// Gate backed by a policy store (file-backed stores hot-reload).
    #[must_use]
    pub fn new(store: PolicyStore) -> Self {
        Self {
            store,
            keyword: KeywordLayer,
            safety_head: SafetyHeadLayer,
            policy: PolicyLayer,
            evidence: EvidenceGateLayer,
            pii: PiiLayer,
        }
    }

    /// The active policy store, for surfaces that expose reload.
    #[must_use]
    pub fn policy_store(&self) -> &PolicyStore {
        &self.store
    }

    /// Evaluate a draft decision through every layer and aggregate.
    pub async fn evaluate(&self, services: &Services, request: GateRequest<'_>) -> FujiDecision {
        // Pick up policy edits; a failed reload keeps the active policy.
        if let Err(err) = self.store.reload_if_changed() {
            tracing::warn!(error = %err, "gate policy reload failed, keeping active policy");
        }
        let policy = self.store.current();

        let mut input = GateInput {
            query: request.query,
            chosen: request.chosen,
            evidence_len: request.evidence_len,
            critiques: request.critiques,
            policy: &policy,
            services,
            category_risks: Vec::new(),
            remaining: request.remaining,
        };

        let mut layer_results: FxHashMap<LayerName, LayerOutcome> = FxHashMap::default();
        for name in LayerName::ORDERED {
            let outcome = match name {
                LayerName::Keyword => self.keyword.evaluate(&input).await,
                LayerName::SafetyHead => self.safety_head.evaluate(&input).await,
                LayerName::Policy => self.policy.evaluate(&input).await,
                LayerName::EvidenceGate => self.evidence.evaluate(&input).await,
                LayerName::Pii => self.pii.evaluate(&input).await,
            };
            input.absorb_category_risks(&outcome.category_risks);
            layer_results.insert(name, outcome);
        }

        let score = |name: LayerName| layer_results.get(&name).map_or(0.0, |o| o.score);
        let weights = &policy.doc.weights;
        let risk = clamp01(
            weights.keyword * score(LayerName::Keyword)
                + weights.head * score(LayerName::SafetyHead)
                + weights.policy * score(LayerName::Policy),
        );

        let mut internal_status = layer_results
            .values()
            .filter_map(|o| o.proposal)
            .max()
            .unwrap_or(InternalStatus::Allow);

        let violations: Vec<Violation> = LayerName::ORDERED
            .iter()
            .filter_map(|name| layer_results.get(name))
            .flat_map(|o| o.violations.iter().cloned())
            .collect();
        let modifications: Vec<Patch> = LayerName::ORDERED
            .iter()
            .filter_map(|name| layer_results.get(name))
            .flat_map(|o| o.patches.iter().cloned())
            .collect();

        let hard_block = violations
            .iter()
            .find(|v| policy.is_hard_block(&v.code));
        if hard_block.is_some() {
            internal_status = InternalStatus::Deny;
        }

        let decision_status = internal_status.decision_status();
        let rejection_reason = if decision_status == DecisionStatus::Deny {
            hard_block
                .map(|v| format!("hard_block:{}", v.code))
                .or_else(|| {
                    violations
                        .iter()
                        .find(|v| v.layer == LayerName::Policy)
                        .map(|v| v.message.clone())
                })
        } else {
            None
        };

        let safe_instructions = if decision_status == DecisionStatus::Allow {
            Vec::new()
        } else {
            policy.doc.safe_instructions.clone()
        };

        let mut decision = FujiDecision {
            internal_status,
            decision_status,
            rejection_reason,
            risk,
            violations,
            modifications,
            safe_instructions,
            layer_results,
        };
        decision.coerce();

        tracing::debug!(
            internal = %decision.internal_status,
            decision = %decision.decision_status,
            risk = decision.risk,
            violations = decision.violations.len(),
            "fuji gate evaluated"
        );
        decision
    }
}
