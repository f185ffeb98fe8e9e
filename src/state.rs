//! Per-request accumulated state.
//!
//! The orchestrator owns one [`RequestState`] per decide call. Stages never
//! touch it directly: they receive an immutable [`StateSnapshot`] and return
//! a patch, which the orchestrator applies between stages. This keeps every
//! stage pure with respect to pipeline state and makes skip detection (a
//! slot already populated) trivial.
//!
//! The state is discarded once the response is assembled; only the trust-log
//! record persists.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fuji::FujiDecision;
use crate::request::{CandidateOption, Critique, EvidenceItem};
use crate::trustlog::TrustLogHead;
use crate::types::DebateMode;

/// Normalized form of the incoming request, produced by `normalize_input`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NormalizedInput {
    /// Query with surrounding whitespace trimmed and runs collapsed.
    pub query: String,
    /// Goals extracted from context.
    pub goals: Vec<String>,
    /// Constraint strings extracted from context.
    pub constraints: Vec<String>,
    /// Optional affect hint (e.g. "stressed") extracted from context.
    pub affect: Option<String>,
}

/// Outcome of the debate stage's three-tier selection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DebateResult {
    /// The selected option; `Some` whenever at least one option existed.
    pub chosen: Option<CandidateOption>,
    /// All options after enrichment, in their original order.
    pub enriched_options: Vec<CandidateOption>,
    pub mode: DebateMode,
    pub warnings: Vec<String>,
    /// `chosen.risk − min(risk)` over the enriched options, clamped to [0,1].
    pub risk_delta: f64,
}

/// A single plan step. Steps reference each other by id via `dependencies`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub objective: String,
    pub tasks: Vec<String>,
    pub metrics: Vec<String>,
    pub risks: Vec<String>,
    pub done_criteria: Vec<String>,
    pub dependencies: Vec<String>,
}

/// An execution plan; `steps` must form a DAG.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

/// Value evaluation output: per-factor scores plus a persisted running EMA.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValueScore {
    pub total: f64,
    pub factors: Vec<(String, f64)>,
    /// Exponential moving average (α = 0.1) of `total`, per user.
    pub ema: f64,
}

/// State accumulated across the pipeline for one request.
///
/// Every field is a slot one stage fills; a slot that is already `Some`
/// before its stage runs means the caller pre-filled it and the stage is
/// skipped.
#[derive(Clone, Debug, Default)]
pub struct RequestState {
    pub normalized: Option<NormalizedInput>,
    pub options: Option<Vec<CandidateOption>>,
    pub evidence: Option<Vec<EvidenceItem>>,
    pub critiques: Option<Vec<Critique>>,
    pub debate: Option<DebateResult>,
    pub plan: Option<Plan>,
    pub values: Option<ValueScore>,
    pub fuji: Option<FujiDecision>,
    pub trust_log: Option<TrustLogHead>,
}

/// Immutable view of [`RequestState`] handed to stages.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    pub normalized: Option<NormalizedInput>,
    pub options: Option<Vec<CandidateOption>>,
    pub evidence: Option<Vec<EvidenceItem>>,
    pub critiques: Option<Vec<Critique>>,
    pub debate: Option<DebateResult>,
    pub plan: Option<Plan>,
    pub values: Option<ValueScore>,
    pub fuji: Option<FujiDecision>,
}

impl RequestState {
    /// Clone the current slots into a snapshot for the next stage.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            normalized: self.normalized.clone(),
            options: self.options.clone(),
            evidence: self.evidence.clone(),
            critiques: self.critiques.clone(),
            debate: self.debate.clone(),
            plan: self.plan.clone(),
            values: self.values.clone(),
            fuji: self.fuji.clone(),
        }
    }

    /// Add a critique, keeping the set keyed by `issue` (last write wins).
    pub fn push_critique(&mut self, critique: Critique) {
        let critiques = self.critiques.get_or_insert_with(Vec::new);
        if let Some(existing) = critiques.iter_mut().find(|c| c.issue == critique.issue) {
            *existing = critique;
        } else {
            critiques.push(critique);
        }
    }
}

impl StateSnapshot {
    /// The normalized query, falling back to empty when normalize was skipped.
    #[must_use]
    pub fn query(&self) -> &str {
        self.normalized.as_ref().map_or("", |n| n.query.as_str())
    }

    /// The current leading option: debate's choice, else the highest-scored.
    #[must_use]
    pub fn leading_option(&self) -> Option<&CandidateOption> {
        if let Some(debate) = &self.debate {
            if let Some(chosen) = &debate.chosen {
                return Some(chosen);
            }
        }
        self.options.as_deref().and_then(|options| {
            options.iter().max_by(|a, b| {
                a.score
                    .unwrap_or(0.0)
                    .total_cmp(&b.score.unwrap_or(0.0))
            })
        })
    }

    /// Evidence count, zero when the slot is unfilled.
    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.evidence.as_deref().map_or(0, <[EvidenceItem]>::len)
    }
}

/// Summary of the pipeline state serialized into trust-log payloads.
#[must_use]
pub fn state_digest(state: &RequestState) -> Value {
    serde_json::json!({
        "options": state.options.as_deref().map_or(0, <[CandidateOption]>::len),
        "evidence": state.evidence.as_deref().map_or(0, <[EvidenceItem]>::len),
        "critiques": state.critiques.as_deref().map_or(0, <[Critique]>::len),
        "debate_mode": state.debate.as_ref().map(|d| d.mode.to_string()),
        "chosen": state
            .debate
            .as_ref()
            .and_then(|d| d.chosen.as_ref())
            .map(|c| c.id.clone()),
        "plan_steps": state.plan.as_ref().map_or(0, |p| p.steps.len()),
        "value_total": state.values.as_ref().map(|v| v.total),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    #[test]
    fn snapshot_is_independent() {
        let mut state = RequestState::default();
        state.options = Some(vec![CandidateOption::new("o1", "first")]);
        let snapshot = state.snapshot();
        state.options = None;
        assert_eq!(snapshot.options.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn critiques_form_a_set_by_issue() {
        let mut state = RequestState::default();
        state.push_critique(Critique::new("high_risk", Severity::Medium, "review"));
        state.push_critique(Critique::new("high_risk", Severity::High, "block"));
        state.push_critique(Critique::new("low_value", Severity::Low, "rescore"));

        let critiques = state.critiques.as_ref().unwrap();
        assert_eq!(critiques.len(), 2);
        let high_risk = critiques.iter().find(|c| c.issue == "high_risk").unwrap();
        assert_eq!(high_risk.severity, Severity::High);
    }

    #[test]
    fn leading_option_prefers_debate_choice() {
        let mut snapshot = StateSnapshot::default();
        snapshot.options = Some(vec![
            CandidateOption::new("o1", "a").with_score(0.9),
            CandidateOption::new("o2", "b").with_score(0.5),
        ]);
        assert_eq!(snapshot.leading_option().unwrap().id, "o1");

        snapshot.debate = Some(DebateResult {
            chosen: Some(CandidateOption::new("o2", "b").with_score(0.5)),
            enriched_options: vec![],
            mode: DebateMode::Normal,
            warnings: vec![],
            risk_delta: 0.0,
        });
        assert_eq!(snapshot.leading_option().unwrap().id, "o2");
    }
}
