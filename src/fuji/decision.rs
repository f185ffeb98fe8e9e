//! The gate's decision record and its coerced invariants.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::patch::Patch;
use crate::types::{DecisionStatus, InternalStatus, LayerName, clamp01};

/// Reason applied when an internal deny reached the caller without one.
pub const REASON_DENY_COERCE: &str = "policy_deny_coerce";
/// Reason applied when a deny carried an empty reason.
pub const REASON_GATE_DENY: &str = "policy_or_poc_gate_deny";

/// A violation raised by one gate layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Stable code, e.g. `self_harm_keyword`, `safety_head_error`.
    pub code: String,
    /// The layer that raised it.
    pub layer: LayerName,
    pub message: String,
}

impl Violation {
    #[must_use]
    pub fn new(code: impl Into<String>, layer: LayerName, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            layer,
            message: message.into(),
        }
    }
}

/// What one layer concluded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerOutcome {
    /// This layer's risk contribution in [0, 1].
    pub score: f64,
    /// The status this layer proposes; the strictest proposal wins.
    pub proposal: Option<InternalStatus>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Per-category risks this layer observed, consumed by the policy layer.
    #[serde(default)]
    pub category_risks: Vec<(String, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The gate's full verdict for one draft decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FujiDecision {
    pub internal_status: InternalStatus,
    pub decision_status: DecisionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Weighted combination of layer scores, clamped to [0, 1].
    pub risk: f64,
    pub violations: Vec<Violation>,
    pub modifications: Vec<Patch>,
    pub safe_instructions: Vec<String>,
    pub layer_results: FxHashMap<LayerName, LayerOutcome>,
}

impl FujiDecision {
    /// Enforce the canonical invariants after aggregation.
    ///
    /// - internal deny forces decision deny, stamping `policy_deny_coerce`
    ///   when no reason was set;
    /// - a decision deny never leaves with an empty reason.
    pub fn coerce(&mut self) {
        self.risk = clamp01(self.risk);

        if self.internal_status == InternalStatus::Deny
            && self.decision_status != DecisionStatus::Deny
        {
            self.decision_status = DecisionStatus::Deny;
            if self.reason_is_empty() {
                self.rejection_reason = Some(REASON_DENY_COERCE.to_string());
            }
        }

        if self.decision_status == DecisionStatus::Deny && self.reason_is_empty() {
            self.rejection_reason = Some(REASON_GATE_DENY.to_string());
        }

        if self.decision_status != DecisionStatus::Deny
            && self.rejection_reason.as_deref() == Some("")
        {
            self.rejection_reason = None;
        }
    }

    fn reason_is_empty(&self) -> bool {
        self.rejection_reason.as_deref().is_none_or(str::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(internal: InternalStatus, decision: DecisionStatus) -> FujiDecision {
        FujiDecision {
            internal_status: internal,
            decision_status: decision,
            rejection_reason: None,
            risk: 0.0,
            violations: vec![],
            modifications: vec![],
            safe_instructions: vec![],
            layer_results: FxHashMap::default(),
        }
    }

    #[test]
    fn internal_deny_coerces_decision() {
        let mut decision = base(InternalStatus::Deny, DecisionStatus::Allow);
        decision.coerce();
        assert_eq!(decision.decision_status, DecisionStatus::Deny);
        assert_eq!(
            decision.rejection_reason.as_deref(),
            Some(REASON_DENY_COERCE)
        );
    }

    #[test]
    fn deny_without_reason_gets_the_gate_reason() {
        let mut decision = base(InternalStatus::Deny, DecisionStatus::Deny);
        decision.coerce();
        assert_eq!(decision.rejection_reason.as_deref(), Some(REASON_GATE_DENY));
    }

    #[test]
    fn existing_reason_is_preserved() {
        let mut decision = base(InternalStatus::Deny, DecisionStatus::Allow);
        decision.rejection_reason = Some("self_harm category".to_string());
        decision.coerce();
        assert_eq!(
            decision.rejection_reason.as_deref(),
            Some("self_harm category")
        );
    }

    #[test]
    fn risk_is_clamped() {
        let mut decision = base(InternalStatus::Allow, DecisionStatus::Allow);
        decision.risk = 1.7;
        decision.coerce();
        assert_eq!(decision.risk, 1.0);
    }

    #[test]
    fn allow_with_blank_reason_drops_it() {
        let mut decision = base(InternalStatus::Allow, DecisionStatus::Allow);
        decision.rejection_reason = Some(String::new());
        decision.coerce();
        assert!(decision.rejection_reason.is_none());
    }
}
