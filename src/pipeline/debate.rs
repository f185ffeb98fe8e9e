//! `run_debate` — three-tier option selection.
//!
//! 1. *normal*: max-score among non-rejected options scoring ≥ 0.4;
//! 2. *degraded*: max-score among all options scoring ≥ 0.2, with warnings;
//! 3. *safe_fallback*: the first option, with a strong warning.
//!
//! Whenever at least one option exists, a choice is made. `risk_delta` is
//! the chosen option's risk above the least risky candidate, clamped.

use async_trait::async_trait;

use crate::request::{CandidateOption, Request};
use crate::stage::{Stage, StageContext, StageError, StagePatch};
use crate::state::{DebateResult, StateSnapshot};
use crate::types::{DebateMode, Severity, StageName, Verdict, clamp01};

/// Score floor for the normal tier.
pub const NORMAL_SCORE_FLOOR: f64 = 0.4;
/// Score floor for the degraded tier.
pub const DEGRADED_SCORE_FLOOR: f64 = 0.2;

#[derive(Debug, Default)]
pub struct RunDebateStage;

#[async_trait]
impl Stage for RunDebateStage {
    fn name(&self) -> StageName {
        StageName::RunDebate
    }

    fn prefilled(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.debate.is_some()
    }

    async fn run(
        &self,
        _request: &Request,
        snapshot: StateSnapshot,
        _ctx: &StageContext,
    ) -> Result<StagePatch, StageError> {
        let options = snapshot.options.clone().unwrap_or_default();
        let blockers = snapshot
            .critiques
            .as_deref()
            .map(|critiques| {
                critiques
                    .iter()
                    .filter(|c| c.severity >= Severity::High)
                    .count()
            })
            .unwrap_or(0);
        Ok(StagePatch::new().with_debate(select(options, blockers)))
    }
}

/// The three-tier selection, pure and synchronous.
pub(crate) fn select(options: Vec<CandidateOption>, blockers: usize) -> DebateResult {
    let enriched: Vec<CandidateOption> = options.into_iter().map(enrich).collect();
    let mut warnings = Vec::new();
    if blockers > 0 {
        warnings.push(format!("{blockers} blocking critique(s) outstanding"));
    }

    if enriched.is_empty() {
        warnings.push("no candidate options were available".to_string());
        return DebateResult {
            chosen: None,
            enriched_options: enriched,
            mode: DebateMode::SafeFallback,
            warnings,
            risk_delta: 0.0,
        };
    }

    let best = |candidates: Vec<&CandidateOption>| -> Option<CandidateOption> {
        candidates
            .into_iter()
            .max_by(|a, b| a.score.unwrap_or(0.0).total_cmp(&b.score.unwrap_or(0.0)))
            .cloned()
    };

    // Tier 1: non-rejected options above the normal floor.
    let tier1: Vec<&CandidateOption> = enriched
        .iter()
        .filter(|o| o.verdict != Some(Verdict::Rejected))
        .filter(|o| o.score.unwrap_or(0.0) >= NORMAL_SCORE_FLOOR)
        .collect();
    if let Some(chosen) = best(tier1) {
        let risk_delta = risk_delta(&chosen, &enriched);
        return DebateResult {
            chosen: Some(chosen),
            enriched_options: enriched,
            mode: DebateMode::Normal,
            warnings,
            risk_delta,
        };
    }

    // Tier 2: any option above the degraded floor.
    let tier2: Vec<&CandidateOption> = enriched
        .iter()
        .filter(|o| o.score.unwrap_or(0.0) >= DEGRADED_SCORE_FLOOR)
        .collect();
    if let Some(chosen) = best(tier2) {
        warnings.push("no option cleared the normal score bar".to_string());
        let risk_delta = risk_delta(&chosen, &enriched);
        return DebateResult {
            chosen: Some(chosen),
            enriched_options: enriched,
            mode: DebateMode::Degraded,
            warnings,
            risk_delta,
        };
    }

    // Tier 3: nothing scored; take the first option under protest.
    warnings.push("all options scored below every selection floor".to_string());
    let chosen = enriched[0].clone();
    let risk_delta = risk_delta(&chosen, &enriched);
    DebateResult {
        chosen: Some(chosen),
        enriched_options: enriched,
        mode: DebateMode::SafeFallback,
        warnings,
        risk_delta,
    }
}

/// Fill in a verdict from the score when the option has none.
fn enrich(mut option: CandidateOption) -> CandidateOption {
    if option.verdict.is_none() {
        let score = option.score.unwrap_or(0.0);
        option.verdict = Some(if score >= 0.7 {
            Verdict::Accepted
        } else if score >= NORMAL_SCORE_FLOOR {
            Verdict::NeedsReview
        } else {
            Verdict::Rejected
        });
    }
    option
}

fn risk_delta(chosen: &CandidateOption, all: &[CandidateOption]) -> f64 {
    let min_risk = all
        .iter()
        .map(|o| o.risk.unwrap_or(0.0))
        .fold(f64::INFINITY, f64::min);
    if !min_risk.is_finite() {
        return 0.0;
    }
    clamp01(chosen.risk.unwrap_or(0.0) - min_risk)
}
