//! `run_critique` — threshold-driven review of the leading option.
//!
//! Each check emits a critique only when its condition holds. Thresholds are
//! configurable through the request context (`risk_threshold`,
//! `complexity_threshold`, ...) and default to the documented values.

use async_trait::async_trait;
use serde_json::json;

use crate::request::{CandidateOption, Critique, Request};
use crate::stage::{Stage, StageContext, StageError, StagePatch};
use crate::state::StateSnapshot;
use crate::types::{Severity, StageName};

/// Default risk threshold above which an option draws a `high_risk` critique.
pub const DEFAULT_RISK_THRESHOLD: f64 = 0.7;
/// Default complexity threshold.
pub const DEFAULT_COMPLEXITY_THRESHOLD: f64 = 5.0;
/// Default floor for the value factor.
pub const DEFAULT_VALUE_FLOOR: f64 = 0.3;
/// Default floor for feasibility.
pub const DEFAULT_FEASIBILITY_FLOOR: f64 = 0.3;
/// Default timeline ceiling in days.
pub const DEFAULT_TIMELINE_CEILING_DAYS: u32 = 180;
/// Risk may exceed value by at most this margin before imbalance is flagged.
pub const DEFAULT_IMBALANCE_MARGIN: f64 = 0.4;

#[derive(Debug, Default)]
pub struct RunCritiqueStage;

#[async_trait]
impl Stage for RunCritiqueStage {
    fn name(&self) -> StageName {
        StageName::RunCritique
    }

    fn prefilled(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.critiques.is_some()
    }

    async fn run(
        &self,
        request: &Request,
        snapshot: StateSnapshot,
        ctx: &StageContext,
    ) -> Result<StagePatch, StageError> {
        let mut critiques = Vec::new();

        let min_evidence = request
            .threshold("min_evidence")
            .map_or(ctx.config.min_evidence, |v| v as usize);
        let evidence_len = snapshot.evidence_len();
        if evidence_len < min_evidence {
            critiques.push(
                Critique::new(
                    "insufficient_evidence",
                    Severity::High,
                    "gather more supporting evidence before acting",
                )
                .with_details(json!({ "found": evidence_len, "required": min_evidence })),
            );
        }

        if let Some(option) = snapshot.leading_option() {
            critiques.extend(critique_option(request, option));
        }

        critiques.truncate(ctx.config.max_critiques);
        Ok(StagePatch::new().with_critiques(critiques))
    }
}

fn critique_option(request: &Request, option: &CandidateOption) -> Vec<Critique> {
    let mut critiques = Vec::new();

    let risk_threshold = request
        .threshold("risk_threshold")
        .unwrap_or(DEFAULT_RISK_THRESHOLD);
    if let Some(risk) = option.risk {
        if risk > risk_threshold {
            critiques.push(
                Critique::new(
                    "high_risk",
                    Severity::High,
                    "reduce scope or add mitigations before proceeding",
                )
                .with_details(json!({ "option": option.id, "risk": risk })),
            );
        }
    }

    let complexity_threshold = request
        .threshold("complexity_threshold")
        .unwrap_or(DEFAULT_COMPLEXITY_THRESHOLD);
    if let Some(complexity) = option.complexity {
        if complexity > complexity_threshold {
            critiques.push(
                Critique::new(
                    "excessive_complexity",
                    Severity::Medium,
                    "split the option into smaller steps",
                )
                .with_details(json!({ "option": option.id, "complexity": complexity })),
            );
        }
    }

    let value_floor = request.threshold("value_floor").unwrap_or(DEFAULT_VALUE_FLOOR);
    if let Some(value) = option.value {
        if value < value_floor {
            critiques.push(
                Critique::new("low_value", Severity::Low, "reconsider expected benefit")
                    .with_details(json!({ "option": option.id, "value": value })),
            );
        }
    }

    let feasibility_floor = request
        .threshold("feasibility_floor")
        .unwrap_or(DEFAULT_FEASIBILITY_FLOOR);
    if let Some(feasibility) = option.feasibility {
        if feasibility < feasibility_floor {
            critiques.push(
                Critique::new(
                    "low_feasibility",
                    Severity::Medium,
                    "identify the blocking constraint and address it first",
                )
                .with_details(json!({ "option": option.id, "feasibility": feasibility })),
            );
        }
    }

    let timeline_ceiling = request
        .threshold("timeline_ceiling_days")
        .map_or(DEFAULT_TIMELINE_CEILING_DAYS, |v| v as u32);
    if let Some(days) = option.timeline_days {
        if days > timeline_ceiling {
            critiques.push(
                Critique::new(
                    "excessive_timeline",
                    Severity::Low,
                    "break the work into nearer-term milestones",
                )
                .with_details(json!({ "option": option.id, "timeline_days": days })),
            );
        }
    }

    if let (Some(risk), Some(value)) = (option.risk, option.value) {
        if risk > value + DEFAULT_IMBALANCE_MARGIN {
            critiques.push(
                Critique::new(
                    "risk_value_imbalance",
                    Severity::Medium,
                    "the risk taken is out of proportion to the expected value",
                )
                .with_details(json!({ "option": option.id, "risk": risk, "value": value })),
            );
        }
    }

    critiques
}
