//! The decision pipeline orchestrator.
//!
//! [`DecisionPipeline::decide`] runs the fixed stage order, threading an
//! accumulated [`RequestState`] through the seven adapter stages, then the
//! FUJI gate, then the trust-log seal, and finally assembles the response
//! envelope. Per-stage latency, success, and skip metrics are collected
//! throughout and mirrored into the sealed record.
//!
//! # Failure policy
//!
//! - `normalize_input`, `fuji_gate`, and `seal_trust_log` are critical: a
//!   failure short-circuits to a structured `hold` that still seals a
//!   trust-log entry describing what happened.
//! - Every other stage is best-effort: a failure (or budget overrun) leaves
//!   a neutral output, records a `stage_failure` critique, and the pipeline
//!   continues.
//! - The orchestrator never lets an error escape as a panic; the only `Err`
//!   returns are entry validation and unrecoverable setup problems.

pub mod critique;
pub mod debate;
pub mod evidence;
pub mod normalize;
pub mod options;
pub mod planner;
pub mod values;

use std::sync::Arc;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;

use crate::config::VeritasConfig;
use crate::fuji::patch::{PatchField, apply_all};
use crate::fuji::{FujiGate, GateRequest, PolicyStore};
use crate::request::{
    CandidateOption, Critique, EvidenceItem, Request, RequestError, validate,
};
use crate::services::Services;
use crate::stage::{
    PipelineMetrics, Stage, StageClass, StageContext, StageMetrics, StagePatch,
};
use crate::state::{DebateResult, Plan, RequestState, ValueScore, state_digest};
use crate::trustlog::{TrustLog, TrustLogError, TrustLogHead};
use crate::types::{DecisionStatus, Severity, StageName};

use critique::RunCritiqueStage;
use debate::RunDebateStage;
use evidence::GatherEvidenceStage;
use normalize::NormalizeStage;
use options::CollectOptionsStage;
use planner::RunPlannerStage;
use values::EvaluateValuesStage;

/// Rejection reason for deadline expiry before the gate ran.
pub const REASON_TIMEOUT: &str = "timeout";
/// Rejection reason when the gate could not produce a decision.
pub const REASON_FUJI_UNAVAILABLE: &str = "fuji_unavailable";
/// Rejection reason when the trust log could not be written.
pub const REASON_TRUST_LOG_UNAVAILABLE: &str = "trust_log_unavailable";

// ============================================================================
// Response envelope
// ============================================================================

/// The structured result of one decide call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub request_id: String,
    pub decision_status: DecisionStatus,
    pub chosen: Option<CandidateOption>,
    pub alternatives: Vec<CandidateOption>,
    pub evidence: Vec<EvidenceItem>,
    pub critique: Vec<Critique>,
    pub debate: Option<DebateResult>,
    pub plan: Plan,
    pub values: Option<ValueScore>,
    pub fuji: Option<crate::fuji::FujiDecision>,
    pub trust_log: Option<TrustLogHead>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub safe_instructions: Vec<String>,
    /// The stage whose failure produced a `hold`, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageName>,
    pub metrics: PipelineMetrics,
}

/// Errors surfaced to the caller as errors (everything else is a structured
/// response).
#[derive(Debug, Error, Diagnostic)]
pub enum DecideError {
    #[error("invalid request: {0}")]
    #[diagnostic(code(veritas::decide::input_invalid))]
    InputInvalid(#[from] RequestError),

    #[error("fatal infrastructure failure: {message}")]
    #[diagnostic(code(veritas::decide::fatal))]
    Fatal { message: String },
}

impl From<TrustLogError> for DecideError {
    fn from(err: TrustLogError) -> Self {
        Self::Fatal {
            message: err.to_string(),
        }
    }
}

enum HoldKind {
    Timeout,
    StageFailed(String),
    FujiUnavailable,
}

impl HoldKind {
    fn reason(&self, stage: StageName) -> String {
        match self {
            Self::Timeout => REASON_TIMEOUT.to_string(),
            Self::StageFailed(_) => format!("stage_failed:{stage}"),
            Self::FujiUnavailable => REASON_FUJI_UNAVAILABLE.to_string(),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// The orchestrator: owns the stage list, the gate, and the trust log.
pub struct DecisionPipeline {
    config: Arc<VeritasConfig>,
    services: Arc<Services>,
    gate: FujiGate,
    trust_log: Arc<TrustLog>,
    adapters: Vec<Arc<dyn Stage>>,
}

impl DecisionPipeline {
    /// Assemble a pipeline from explicit parts.
    #[must_use]
    pub fn new(
        config: VeritasConfig,
        services: Services,
        gate: FujiGate,
        trust_log: Arc<TrustLog>,
    ) -> Self {
        let adapters: Vec<Arc<dyn Stage>> = vec![
            Arc::new(NormalizeStage),
            Arc::new(CollectOptionsStage),
            Arc::new(GatherEvidenceStage),
            Arc::new(RunCritiqueStage),
            Arc::new(RunDebateStage),
            Arc::new(RunPlannerStage),
            Arc::new(EvaluateValuesStage),
        ];
        Self {
            config: Arc::new(config),
            services: Arc::new(services),
            gate,
            trust_log,
            adapters,
        }
    }

    /// Open a pipeline with the trust log under `config.log_dir` and the
    /// policy from `config.policy_path` (compiled defaults when unset).
    pub fn open(config: VeritasConfig, services: Services) -> Result<Self, DecideError> {
        let store = match &config.policy_path {
            Some(path) => PolicyStore::from_file(path).map_err(|e| DecideError::Fatal {
                message: e.to_string(),
            })?,
            None => PolicyStore::with_defaults().map_err(|e| DecideError::Fatal {
                message: e.to_string(),
            })?,
        };
        let trust_log = TrustLog::open(
            &config.log_dir,
            config.trust_log_max_segment_bytes,
            config.trust_log_mirror_cap,
        )?;
        Ok(Self::new(
            config,
            services,
            FujiGate::new(store),
            Arc::new(trust_log),
        ))
    }

    /// The trust log, for the fetch operations a surface exposes.
    #[must_use]
    pub fn trust_log(&self) -> &Arc<TrustLog> {
        &self.trust_log
    }

    /// The gate, for surfaces that expose policy reload.
    #[must_use]
    pub fn gate(&self) -> &FujiGate {
        &self.gate
    }

    /// Run one request through the full pipeline.
    #[instrument(skip(self, request), err)]
    pub async fn decide(&self, mut request: Request) -> Result<DecisionResponse, DecideError> {
        validate(&request, &self.config.limits)?;
        let request_id = request.resolve_request_id();
        let started = Instant::now();
        let ctx = StageContext {
            request_id: request_id.clone(),
            config: self.config.clone(),
            services: self.services.clone(),
            deadline: started + self.config.deadline(),
        };

        let mut state = RequestState::default();
        let mut metrics = PipelineMetrics::default();
        seed_from_context(&request, &mut state);

        for stage in &self.adapters {
            let name = stage.name();
            if ctx.expired() {
                return self
                    .short_circuit(HoldKind::Timeout, name, &request_id, state, metrics, started)
                    .await;
            }
            if stage.prefilled(&state.snapshot()) {
                metrics.record(name, StageMetrics::skipped("pre_filled"));
                continue;
            }

            let budget = self.config.budgets.for_stage(name).min(ctx.remaining());
            let t0 = Instant::now();
            let outcome =
                tokio::time::timeout(budget, stage.run(&request, state.snapshot(), &ctx)).await;
            let latency = t0.elapsed().as_millis() as u64;

            let failure = match outcome {
                Ok(Ok(patch)) => {
                    apply_patch(&mut state, patch, self.config.max_critiques);
                    metrics.record(name, StageMetrics::ok(latency));
                    None
                }
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!("exceeded {budget:?} latency budget")),
            };

            if let Some(message) = failure {
                metrics.record(name, StageMetrics::failed(latency, message.clone()));
                tracing::warn!(stage = %name, error = %message, "stage failed");
                if stage.class() == StageClass::Critical {
                    return self
                        .short_circuit(
                            HoldKind::StageFailed(message),
                            name,
                            &request_id,
                            state,
                            metrics,
                            started,
                        )
                        .await;
                }
                state.push_critique(
                    Critique::new(
                        format!("stage_failure:{name}"),
                        Severity::Medium,
                        format!("stage {name} degraded to a neutral output"),
                    )
                    .with_details(json!({ "error": message })),
                );
            }
        }

        // FUJI gate: critical, with its own budget.
        if ctx.expired() {
            return self
                .short_circuit(
                    HoldKind::Timeout,
                    StageName::FujiGate,
                    &request_id,
                    state,
                    metrics,
                    started,
                )
                .await;
        }
        let fuji_budget = self
            .config
            .budgets
            .for_stage(StageName::FujiGate)
            .min(ctx.remaining());
        let snapshot = state.snapshot();
        let gate_request = GateRequest {
            query: snapshot.query(),
            chosen: snapshot.debate.as_ref().and_then(|d| d.chosen.as_ref()),
            evidence_len: snapshot.evidence_len(),
            critiques: snapshot.critiques.as_deref().unwrap_or(&[]),
            remaining: fuji_budget,
        };
        let t0 = Instant::now();
        let gate_outcome =
            tokio::time::timeout(fuji_budget, self.gate.evaluate(&self.services, gate_request))
                .await;
        let gate_latency = t0.elapsed().as_millis() as u64;
        match gate_outcome {
            Ok(decision) => {
                metrics.record(StageName::FujiGate, StageMetrics::ok(gate_latency));
                state.fuji = Some(decision);
            }
            Err(_) => {
                metrics.record(
                    StageName::FujiGate,
                    StageMetrics::failed(gate_latency, "gate exceeded its latency budget"),
                );
                return self
                    .short_circuit(
                        HoldKind::FujiUnavailable,
                        StageName::FujiGate,
                        &request_id,
                        state,
                        metrics,
                        started,
                    )
                    .await;
            }
        }

        // Seal: one attempt, with the configured grace even past the deadline.
        let seal_budget = ctx.remaining().max(self.config.seal_grace());
        let payload = seal_payload(&state, &metrics);
        let t0 = Instant::now();
        let sealed = tokio::time::timeout(
            seal_budget,
            self.trust_log.append(&request_id, "fuji", payload),
        )
        .await;
        let seal_latency = t0.elapsed().as_millis() as u64;
        let seal_failed = match sealed {
            Ok(Ok(head)) => {
                metrics.record(StageName::SealTrustLog, StageMetrics::ok(seal_latency));
                state.trust_log = Some(head);
                false
            }
            Ok(Err(err)) => {
                metrics.record(
                    StageName::SealTrustLog,
                    StageMetrics::failed(seal_latency, err.to_string()),
                );
                true
            }
            Err(_) => {
                metrics.record(
                    StageName::SealTrustLog,
                    StageMetrics::failed(seal_latency, "seal exceeded the grace period"),
                );
                true
            }
        };
        if seal_failed {
            let hold = Some((
                REASON_TRUST_LOG_UNAVAILABLE.to_string(),
                StageName::SealTrustLog,
            ));
            return Ok(self.finalize(request_id, state, metrics, started, hold));
        }

        Ok(self.finalize(request_id, state, metrics, started, None))
    }

    /// Critical-path exit: build a `hold` response and still seal an entry
    /// describing the failure (degrading to a chain-unavailable note if even
    /// that write fails).
    async fn short_circuit(
        &self,
        kind: HoldKind,
        stage: StageName,
        request_id: &str,
        mut state: RequestState,
        mut metrics: PipelineMetrics,
        started: Instant,
    ) -> Result<DecisionResponse, DecideError> {
        let reason = kind.reason(stage);
        let detail = match &kind {
            HoldKind::StageFailed(message) => Some(message.clone()),
            _ => None,
        };
        let payload = json!({
            "outcome": "hold",
            "rejection_reason": &reason,
            "failed_stage": stage.as_str(),
            "detail": detail,
            "metrics": &metrics,
            "state": state_digest(&state),
        });

        let t0 = Instant::now();
        let sealed = tokio::time::timeout(
            self.config.seal_grace(),
            self.trust_log.append(request_id, stage.as_str(), payload.clone()),
        )
        .await;
        let seal_latency = t0.elapsed().as_millis() as u64;

        let reason = match sealed {
            Ok(Ok(head)) => {
                metrics.record(StageName::SealTrustLog, StageMetrics::ok(seal_latency));
                state.trust_log = Some(head);
                reason
            }
            _ => {
                metrics.record(
                    StageName::SealTrustLog,
                    StageMetrics::failed(seal_latency, "seal failed during short-circuit"),
                );
                // Last line of defense: a degraded record keeps the audit
                // trail append-only even when the canonical seal cannot run.
                if let Ok(Ok(head)) = tokio::time::timeout(
                    self.config.seal_grace(),
                    self.trust_log
                        .append_degraded(request_id, stage.as_str(), payload),
                )
                .await
                {
                    state.trust_log = Some(head);
                    reason
                } else {
                    REASON_TRUST_LOG_UNAVAILABLE.to_string()
                }
            }
        };

        Ok(self.finalize(
            request_id.to_string(),
            state,
            metrics,
            started,
            Some((reason, stage)),
        ))
    }

    /// Assemble the response envelope; the final stage in the fixed order.
    fn finalize(
        &self,
        request_id: String,
        state: RequestState,
        mut metrics: PipelineMetrics,
        started: Instant,
        hold: Option<(String, StageName)>,
    ) -> DecisionResponse {
        metrics.record(StageName::FinalizeResponse, StageMetrics::ok(0));
        metrics.total_latency_ms = started.elapsed().as_millis() as u64;

        let fuji = state.fuji.clone();
        let (decision_status, rejection_reason, failed_stage) = match &hold {
            Some((reason, stage)) => (DecisionStatus::Hold, Some(reason.clone()), Some(*stage)),
            None => match &fuji {
                Some(decision) => (
                    decision.decision_status,
                    decision.rejection_reason.clone(),
                    None,
                ),
                // No gate verdict and no explicit hold: park the request.
                None => (
                    DecisionStatus::Hold,
                    Some(REASON_FUJI_UNAVAILABLE.to_string()),
                    Some(StageName::FujiGate),
                ),
            },
        };

        let debate = state.debate.clone();
        let mut chosen = debate.as_ref().and_then(|d| d.chosen.clone());
        if let (Some(option), Some(decision)) = (chosen.as_mut(), fuji.as_ref()) {
            if decision_status != DecisionStatus::Deny && !decision.modifications.is_empty() {
                option.title = apply_all(
                    &decision.modifications,
                    PatchField::ChosenTitle,
                    &option.title,
                );
                if let Some(rationale) = &option.rationale {
                    option.rationale = Some(apply_all(
                        &decision.modifications,
                        PatchField::ChosenRationale,
                        rationale,
                    ));
                }
            }
        }
        let alternatives = debate
            .as_ref()
            .map(|d| {
                d.enriched_options
                    .iter()
                    .filter(|o| chosen.as_ref().map(|c| c.id != o.id).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let safe_instructions = fuji
            .as_ref()
            .map(|d| d.safe_instructions.clone())
            .unwrap_or_default();

        DecisionResponse {
            request_id,
            decision_status,
            chosen,
            alternatives,
            evidence: state.evidence.unwrap_or_default(),
            critique: state.critiques.unwrap_or_default(),
            debate,
            plan: state.plan.unwrap_or_default(),
            values: state.values,
            fuji,
            trust_log: state.trust_log,
            rejection_reason,
            safe_instructions,
            failed_stage,
            metrics,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Pre-fill state slots the caller supplied through the context map.
///
/// A gateway that already ran a stage passes its output under the matching
/// key; the stage is then skipped with reason `pre_filled`.
fn seed_from_context(request: &Request, state: &mut RequestState) {
    fn take<T: serde::de::DeserializeOwned>(context_value: Option<&Value>) -> Option<T> {
        context_value.and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    state.normalized = take(request.context.get("normalized"));
    state.evidence = take(request.context.get("evidence"));
    state.critiques = take(request.context.get("critiques"));
    state.debate = take(request.context.get("debate"));
    state.plan = take(request.context.get("plan"));
    state.values = take(request.context.get("values"));
    if state.options.is_none() {
        state.options = take(request.context.get("prefilled_options"));
    }
}

fn apply_patch(state: &mut RequestState, patch: StagePatch, max_critiques: usize) {
    if let Some(normalized) = patch.normalized {
        state.normalized = Some(normalized);
    }
    if let Some(options) = patch.options {
        state.options = Some(options);
    }
    if let Some(evidence) = patch.evidence {
        state.evidence = Some(evidence);
    }
    if let Some(critiques) = patch.critiques {
        for critique in critiques {
            state.push_critique(critique);
        }
    }
    if let Some(critiques) = state.critiques.as_mut() {
        critiques.truncate(max_critiques);
    }
    if let Some(debate) = patch.debate {
        state.debate = Some(debate);
    }
    if let Some(plan) = patch.plan {
        state.plan = Some(plan);
    }
    if let Some(values) = patch.values {
        state.values = Some(values);
    }
}

fn seal_payload(state: &RequestState, metrics: &PipelineMetrics) -> Value {
    let fuji_summary = state.fuji.as_ref().map(|decision| {
        json!({
            "internal_status": decision.internal_status,
            "decision_status": decision.decision_status,
            "risk": decision.risk,
            "rejection_reason": decision.rejection_reason,
            "violations": decision
                .violations
                .iter()
                .map(|v| v.code.clone())
                .collect::<Vec<_>>(),
            "modifications": decision.modifications.len(),
        })
    });
    json!({
        "outcome": state
            .fuji
            .as_ref()
            .map(|d| d.decision_status.to_string())
            .unwrap_or_else(|| "hold".to_string()),
        "fuji": fuji_summary,
        "metrics": metrics,
        "state": state_digest(state),
    })
}
