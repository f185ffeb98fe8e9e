//! Core types for the VERITAS decision pipeline.
//!
//! This module defines the closed enumerations used throughout the system:
//! stage identities, gate statuses, evidence kinds, and severities. These are
//! the domain concepts the rest of the crate is written in terms of.
//!
//! # Key Types
//!
//! - [`StageName`]: Identifies the fixed, ordered pipeline stages
//! - [`InternalStatus`] / [`DecisionStatus`]: The gate's fine-grained and
//!   client-facing verdicts, with the canonical mapping between them
//! - [`Severity`]: Ordered severity for critiques and violations
//!
//! # Examples
//!
//! ```rust
//! use veritas::types::{DecisionStatus, InternalStatus};
//!
//! // warn is admitted; human_review is parked for a human.
//! assert_eq!(InternalStatus::Warn.decision_status(), DecisionStatus::Allow);
//! assert_eq!(
//!     InternalStatus::HumanReview.decision_status(),
//!     DecisionStatus::Hold,
//! );
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// The client-facing verdict for one decide call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// The decision is admitted as-is (possibly with modifications applied).
    Allow,
    /// The decision is parked pending review or infrastructure recovery.
    Hold,
    /// The decision is rejected; `rejection_reason` is always populated.
    Deny,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Hold => write!(f, "hold"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// The gate's fine-grained verdict, ordered from most to least permissive.
///
/// `Ord` is derived so that "strictest layer wins" aggregation can be written
/// as a plain `max()` over layer proposals.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InternalStatus {
    /// No layer objected.
    Allow,
    /// Admitted, but a layer flagged something worth surfacing.
    Warn,
    /// A layer wants a human in the loop before this proceeds.
    HumanReview,
    /// A layer demands rejection.
    Deny,
}

impl InternalStatus {
    /// The canonical mapping onto the client-facing status.
    ///
    /// `allow → allow`, `warn → allow`, `human_review → hold`, `deny → deny`.
    #[must_use]
    pub fn decision_status(self) -> DecisionStatus {
        match self {
            Self::Allow | Self::Warn => DecisionStatus::Allow,
            Self::HumanReview => DecisionStatus::Hold,
            Self::Deny => DecisionStatus::Deny,
        }
    }
}

impl fmt::Display for InternalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Warn => write!(f, "warn"),
            Self::HumanReview => write!(f, "human_review"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Verdict attached to a candidate option as it is enriched by stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    NeedsReview,
    Rejected,
}

/// Provenance of an evidence item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    MemoryEpisodic,
    MemorySemantic,
    World,
    Tool,
    External,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryEpisodic => write!(f, "memory_episodic"),
            Self::MemorySemantic => write!(f, "memory_semantic"),
            Self::World => write!(f, "world"),
            Self::Tool => write!(f, "tool"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Severity level for critiques and gate violations.
///
/// Ordered so that comparisons like `severity >= Severity::High` read
/// naturally; `High` critiques are blockers.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Selection mode reported by the debate stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateMode {
    /// A non-rejected option cleared the normal score bar.
    Normal,
    /// Only the lowered score bar produced a candidate.
    Degraded,
    /// No option scored; the first option was taken with a strong warning.
    SafeFallback,
}

impl fmt::Display for DebateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Degraded => write!(f, "degraded"),
            Self::SafeFallback => write!(f, "safe_fallback"),
        }
    }
}

/// Identifies a pipeline stage.
///
/// The variant order is the execution order; [`StageName::ORDERED`] is the
/// canonical sequence the orchestrator runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    NormalizeInput,
    CollectOptions,
    GatherEvidence,
    RunCritique,
    RunDebate,
    RunPlanner,
    EvaluateValues,
    FujiGate,
    SealTrustLog,
    FinalizeResponse,
}

impl StageName {
    /// The fixed execution order of the pipeline.
    pub const ORDERED: [StageName; 10] = [
        StageName::NormalizeInput,
        StageName::CollectOptions,
        StageName::GatherEvidence,
        StageName::RunCritique,
        StageName::RunDebate,
        StageName::RunPlanner,
        StageName::EvaluateValues,
        StageName::FujiGate,
        StageName::SealTrustLog,
        StageName::FinalizeResponse,
    ];

    /// Stable string form used in metrics, skip flags, and TrustLog payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NormalizeInput => "normalize_input",
            Self::CollectOptions => "collect_options",
            Self::GatherEvidence => "gather_evidence",
            Self::RunCritique => "run_critique",
            Self::RunDebate => "run_debate",
            Self::RunPlanner => "run_planner",
            Self::EvaluateValues => "evaluate_values",
            Self::FujiGate => "fuji_gate",
            Self::SealTrustLog => "seal_trust_log",
            Self::FinalizeResponse => "finalize_response",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a gate layer. A small closed set; `layer_results` is keyed by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerName {
    Keyword,
    SafetyHead,
    Policy,
    EvidenceGate,
    Pii,
}

impl LayerName {
    /// The fixed evaluation order of the gate layers.
    pub const ORDERED: [LayerName; 5] = [
        LayerName::Keyword,
        LayerName::SafetyHead,
        LayerName::Policy,
        LayerName::EvidenceGate,
        LayerName::Pii,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::SafetyHead => "safety_head",
            Self::Policy => "policy",
            Self::EvidenceGate => "evidence_gate",
            Self::Pii => "pii",
        }
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clamp a score into `[0.0, 1.0]`, mapping NaN to 0.
#[must_use]
pub fn clamp01(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_status_ordering() {
        assert!(InternalStatus::Allow < InternalStatus::Warn);
        assert!(InternalStatus::Warn < InternalStatus::HumanReview);
        assert!(InternalStatus::HumanReview < InternalStatus::Deny);
    }

    #[test]
    fn internal_to_decision_mapping() {
        assert_eq!(InternalStatus::Allow.decision_status(), DecisionStatus::Allow);
        assert_eq!(InternalStatus::Warn.decision_status(), DecisionStatus::Allow);
        assert_eq!(
            InternalStatus::HumanReview.decision_status(),
            DecisionStatus::Hold
        );
        assert_eq!(InternalStatus::Deny.decision_status(), DecisionStatus::Deny);
    }

    #[test]
    fn stage_order_is_fixed() {
        let names: Vec<&str> = StageName::ORDERED.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "normalize_input",
                "collect_options",
                "gather_evidence",
                "run_critique",
                "run_debate",
                "run_planner",
                "evaluate_values",
                "fuji_gate",
                "seal_trust_log",
                "finalize_response",
            ]
        );
    }

    #[test]
    fn statuses_round_trip_json() {
        let json = serde_json::to_string(&InternalStatus::HumanReview).unwrap();
        assert_eq!(json, r#""human_review""#);
        let parsed: InternalStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, InternalStatus::HumanReview);
    }

    #[test]
    fn clamp01_bounds() {
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(clamp01(1.5), 1.0);
        assert_eq!(clamp01(f64::NAN), 0.0);
        assert_eq!(clamp01(0.25), 0.25);
    }
}
