//! The five gate layers, evaluated in a fixed order.
//!
//! Each layer inspects the draft decision and contributes a score, an
//! optional status proposal, violations, and (for the PII layer) redaction
//! patches. A layer's internal failure is never fatal to the gate: it
//! degrades to its documented baseline and raises a violation instead.
//!
//! Layers communicate forward through `GateInput::category_risks`: the
//! keyword and safety-head layers report per-category risks, and the policy
//! layer applies the declarative rules to the merged map.

use std::time::Duration;

use async_trait::async_trait;

use super::decision::{LayerOutcome, Violation};
use super::patch::{Patch, PatchField};
use super::policy::CompiledPolicy;
use crate::request::{CandidateOption, Critique};
use crate::services::Services;
use crate::types::{InternalStatus, LayerName, clamp01};

/// Baseline risk contributed when the safety head cannot be reached.
pub const SAFETY_HEAD_BASELINE_RISK: f64 = 0.30;

/// Everything a layer may inspect.
pub struct GateInput<'a> {
    pub query: &'a str,
    pub chosen: Option<&'a CandidateOption>,
    pub evidence_len: usize,
    pub critiques: &'a [Critique],
    pub policy: &'a CompiledPolicy,
    pub services: &'a Services,
    /// Per-category risks accumulated from earlier layers.
    pub category_risks: Vec<(String, f64)>,
    /// Budget left for external calls.
    pub remaining: Duration,
}

impl GateInput<'_> {
    /// The text surface the pattern layers inspect: query plus the draft
    /// decision's title and rationale.
    #[must_use]
    pub fn inspection_text(&self) -> String {
        let mut text = self.query.to_string();
        if let Some(chosen) = self.chosen {
            text.push('\n');
            text.push_str(&chosen.title);
            if let Some(rationale) = &chosen.rationale {
                text.push('\n');
                text.push_str(rationale);
            }
        }
        text
    }

    /// Merge a layer's reported category risks into the accumulated map.
    pub fn absorb_category_risks(&mut self, risks: &[(String, f64)]) {
        for (name, risk) in risks {
            match self.category_risks.iter_mut().find(|(n, _)| n == name) {
                Some((_, existing)) => *existing = existing.max(*risk),
                None => self.category_risks.push((name.clone(), *risk)),
            }
        }
    }
}

/// One layer of the gate.
#[async_trait]
pub trait GateLayer: Send + Sync {
    fn name(&self) -> LayerName;

    /// Evaluate the draft decision. Infallible by contract: failures are
    /// folded into the outcome as baseline scores plus violations.
    async fn evaluate(&self, input: &GateInput<'_>) -> LayerOutcome;
}

// ============================================================================
// 1. Keyword / pattern layer
// ============================================================================

/// Matches banned keywords and regex patterns from the policy categories.
#[derive(Debug, Default)]
pub struct KeywordLayer;

#[async_trait]
impl GateLayer for KeywordLayer {
    fn name(&self) -> LayerName {
        LayerName::Keyword
    }

    async fn evaluate(&self, input: &GateInput<'_>) -> LayerOutcome {
        let text = input.inspection_text();
        let mut outcome = LayerOutcome::default();

        for matcher in &input.policy.matchers {
            if !matcher.matches(&text) {
                continue;
            }
            // A direct hit is a certain signal for its category.
            outcome
                .category_risks
                .push((matcher.name.clone(), 1.0));
            outcome.score = 1.0;
            let code = if matcher.keyword_hit(&text) {
                format!("{}_keyword", matcher.name)
            } else {
                format!("{}_pattern", matcher.name)
            };
            outcome.violations.push(Violation::new(
                code,
                LayerName::Keyword,
                format!("matched banned content in category {}", matcher.name),
            ));
        }

        if !outcome.violations.is_empty() {
            outcome.proposal = Some(InternalStatus::Warn);
        }
        outcome
    }
}

// ============================================================================
// 2. Safety-head layer
// ============================================================================

/// Consults the external safety classifier; degrades to a documented
/// baseline risk when the classifier is absent or fails.
#[derive(Debug, Default)]
pub struct SafetyHeadLayer;

impl SafetyHeadLayer {
    fn degraded(reason: &str) -> LayerOutcome {
        LayerOutcome {
            score: SAFETY_HEAD_BASELINE_RISK,
            proposal: None,
            violations: vec![Violation::new(
                "safety_head_error",
                LayerName::SafetyHead,
                reason.to_string(),
            )],
            patches: vec![],
            category_risks: vec![],
            note: Some("degraded to baseline risk".to_string()),
        }
    }
}

#[async_trait]
impl GateLayer for SafetyHeadLayer {
    fn name(&self) -> LayerName {
        LayerName::SafetyHead
    }

    async fn evaluate(&self, input: &GateInput<'_>) -> LayerOutcome {
        let Some(head) = input.services.safety_head.get() else {
            let reason = input
                .services
                .safety_head
                .reason()
                .unwrap_or("safety head unavailable");
            return Self::degraded(reason);
        };

        let text = input.inspection_text();
        let call = head.classify(&text);
        match tokio::time::timeout(input.remaining, call).await {
            Ok(Ok(verdict)) => {
                let risk = clamp01(verdict.risk);
                let proposal = if risk >= 0.7 {
                    Some(InternalStatus::HumanReview)
                } else if risk >= 0.4 {
                    Some(InternalStatus::Warn)
                } else {
                    None
                };
                LayerOutcome {
                    score: risk,
                    proposal,
                    violations: vec![],
                    patches: vec![],
                    category_risks: verdict
                        .categories
                        .into_iter()
                        .map(|(name, r)| (name, clamp01(r)))
                        .collect(),
                    note: None,
                }
            }
            Ok(Err(err)) => Self::degraded(&err.to_string()),
            Err(_) => Self::degraded("safety head call timed out"),
        }
    }
}

// ============================================================================
// 3. Policy layer
// ============================================================================

/// Applies the declarative category rules to the merged category risks.
/// Rules run in declared order; the first exceeding rule proposes its action.
#[derive(Debug, Default)]
pub struct PolicyLayer;

#[async_trait]
impl GateLayer for PolicyLayer {
    fn name(&self) -> LayerName {
        LayerName::Policy
    }

    async fn evaluate(&self, input: &GateInput<'_>) -> LayerOutcome {
        let mut outcome = LayerOutcome::default();
        let mut max_risk: f64 = 0.0;

        for matcher in &input.policy.matchers {
            let risk = input
                .category_risks
                .iter()
                .find(|(name, _)| name == &matcher.name)
                .map_or(0.0, |(_, r)| *r);
            max_risk = max_risk.max(risk);

            if risk > matcher.max_risk_allow && outcome.proposal.is_none() {
                outcome.proposal = Some(matcher.action_on_exceed.proposal());
                outcome.violations.push(Violation::new(
                    format!("{}_policy_exceed", matcher.name),
                    LayerName::Policy,
                    format!(
                        "category {} risk {:.2} exceeds cap {:.2}",
                        matcher.name, risk, matcher.max_risk_allow
                    ),
                ));
                outcome.note = Some(format!("rule {} triggered", matcher.name));
            }
        }

        outcome.score = clamp01(max_risk);
        outcome
    }
}

// ============================================================================
// 4. Evidence-gate layer
// ============================================================================

/// Proposes human review when the decision rests on too little evidence.
#[derive(Debug, Default)]
pub struct EvidenceGateLayer;

#[async_trait]
impl GateLayer for EvidenceGateLayer {
    fn name(&self) -> LayerName {
        LayerName::EvidenceGate
    }

    async fn evaluate(&self, input: &GateInput<'_>) -> LayerOutcome {
        let floor = input.policy.doc.min_evidence;
        if input.evidence_len >= floor {
            return LayerOutcome::default();
        }
        LayerOutcome {
            score: 0.0,
            proposal: Some(InternalStatus::HumanReview),
            violations: vec![Violation::new(
                "insufficient_evidence",
                LayerName::EvidenceGate,
                format!(
                    "decision rests on {} evidence items, floor is {}",
                    input.evidence_len, floor
                ),
            )],
            patches: vec![],
            category_risks: vec![],
            note: None,
        }
    }
}

// ============================================================================
// 5. PII layer
// ============================================================================

/// Scans the query and draft decision for PII; confirmed findings become
/// idempotent redaction patches.
#[derive(Debug, Default)]
pub struct PiiLayer;

#[async_trait]
impl GateLayer for PiiLayer {
    fn name(&self) -> LayerName {
        LayerName::Pii
    }

    async fn evaluate(&self, input: &GateInput<'_>) -> LayerOutcome {
        let min_confidence = input.policy.doc.pii.min_confidence;
        let mut outcome = LayerOutcome::default();

        let mut surfaces: Vec<(PatchField, &str)> = vec![(PatchField::Query, input.query)];
        if let Some(chosen) = input.chosen {
            surfaces.push((PatchField::ChosenTitle, chosen.title.as_str()));
            if let Some(rationale) = &chosen.rationale {
                surfaces.push((PatchField::ChosenRationale, rationale.as_str()));
            }
        }

        for (field, text) in surfaces {
            for finding in input.services.pii.scan(text) {
                if finding.confidence < min_confidence {
                    continue;
                }
                outcome.patches.push(Patch::new(
                    field,
                    finding.matched.clone(),
                    finding.replacement.clone(),
                ));
                outcome.violations.push(Violation::new(
                    format!("pii_{}", finding.kind),
                    LayerName::Pii,
                    format!("confirmed {} detected", finding.kind),
                ));
            }
        }

        if !outcome.patches.is_empty() {
            outcome.proposal = Some(InternalStatus::Warn);
            outcome.note = Some("redaction patches attached".to_string());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuji::policy::GatePolicy;

    fn input_for<'a>(
        query: &'a str,
        policy: &'a CompiledPolicy,
        services: &'a Services,
    ) -> GateInput<'a> {
        GateInput {
            query,
            chosen: None,
            evidence_len: 3,
            critiques: &[],
            policy,
            services,
            category_risks: Vec::new(),
            remaining: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn keyword_layer_flags_banned_phrase() {
        let policy = CompiledPolicy::compile(GatePolicy::default()).unwrap();
        let services = Services::default();
        let input = input_for("I want to kill myself", &policy, &services);
        let outcome = KeywordLayer.evaluate(&input).await;
        assert_eq!(outcome.score, 1.0);
        assert!(outcome
            .violations
            .iter()
            .any(|v| v.code == "self_harm_keyword"));
        assert!(outcome
            .category_risks
            .iter()
            .any(|(name, risk)| name == "self_harm" && *risk == 1.0));
    }

    #[tokio::test]
    async fn safety_head_degrades_to_baseline() {
        let policy = CompiledPolicy::compile(GatePolicy::default()).unwrap();
        let services = Services::default(); // no safety head configured
        let input = input_for("anything", &policy, &services);
        let outcome = SafetyHeadLayer.evaluate(&input).await;
        assert_eq!(outcome.score, SAFETY_HEAD_BASELINE_RISK);
        assert!(outcome
            .violations
            .iter()
            .any(|v| v.code == "safety_head_error"));
    }

    #[tokio::test]
    async fn policy_layer_applies_first_exceeding_rule() {
        let policy = CompiledPolicy::compile(GatePolicy::default()).unwrap();
        let services = Services::default();
        let mut input = input_for("q", &policy, &services);
        input.category_risks = vec![("self_harm".to_string(), 0.9)];
        let outcome = PolicyLayer.evaluate(&input).await;
        assert_eq!(outcome.proposal, Some(InternalStatus::Deny));
        assert!(outcome
            .violations
            .iter()
            .any(|v| v.code == "self_harm_policy_exceed"));
        assert_eq!(outcome.score, 0.9);
    }

    #[tokio::test]
    async fn evidence_gate_triggers_below_floor() {
        let policy = CompiledPolicy::compile(GatePolicy::default()).unwrap();
        let services = Services::default();
        let mut input = input_for("q", &policy, &services);
        input.evidence_len = 0;
        let outcome = EvidenceGateLayer.evaluate(&input).await;
        assert_eq!(outcome.proposal, Some(InternalStatus::HumanReview));
    }

    #[tokio::test]
    async fn pii_layer_attaches_patches() {
        let policy = CompiledPolicy::compile(GatePolicy::default()).unwrap();
        let services = Services::default();
        let input = input_for("reach me at jo@example.com", &policy, &services);
        let outcome = PiiLayer.evaluate(&input).await;
        assert_eq!(outcome.patches.len(), 1);
        assert_eq!(outcome.patches[0].replace, "[REDACTED:email]");
        assert_eq!(outcome.proposal, Some(InternalStatus::Warn));
    }
}
