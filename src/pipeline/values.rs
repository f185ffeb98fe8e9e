//! `evaluate_values` — factor scoring plus a persisted per-user EMA.
//!
//! The total is a clamped mean over four factors (goal alignment, safety,
//! feasibility, evidence support). Each user's running exponential moving
//! average (α = 0.1) is persisted to `log_dir/value_stats.<user>.json` with
//! the standard write-temp-fsync-rename protocol.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::request::Request;
use crate::stage::{Stage, StageContext, StageError, StagePatch};
use crate::state::{StateSnapshot, ValueScore};
use crate::types::{StageName, clamp01};
use crate::utils::atomic_io;

/// User bucket for requests without a `user_id`.
pub const ANONYMOUS_USER: &str = "anonymous";

/// On-disk per-user value statistics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValueStats {
    pub user: String,
    pub count: u64,
    pub ema: f64,
    pub updated_at: String,
}

/// Path of the stats file for `user` under `log_dir`.
#[must_use]
pub fn stats_path(log_dir: &Path, user: &str) -> PathBuf {
    let safe: String = user
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    log_dir.join(format!("value_stats.{safe}.json"))
}

/// Load, fold, and persist the EMA for one observation.
pub fn update_ema(
    log_dir: &Path,
    user: &str,
    total: f64,
    alpha: f64,
) -> Result<ValueStats, StageError> {
    let path = stats_path(log_dir, user);
    let previous: Option<ValueStats> = std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok());

    let stats = match previous {
        Some(prev) => ValueStats {
            user: user.to_string(),
            count: prev.count + 1,
            ema: clamp01(alpha * total + (1.0 - alpha) * prev.ema),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        },
        None => ValueStats {
            user: user.to_string(),
            count: 1,
            ema: clamp01(total),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        },
    };

    let body = serde_json::to_vec(&stats)?;
    atomic_io::write_atomic(&path, &body)
        .map_err(|e| StageError::ValidationFailed(format!("value stats persist failed: {e}")))?;
    Ok(stats)
}

#[derive(Debug, Default)]
pub struct EvaluateValuesStage;

#[async_trait]
impl Stage for EvaluateValuesStage {
    fn name(&self) -> StageName {
        StageName::EvaluateValues
    }

    fn prefilled(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.values.is_some()
    }

    async fn run(
        &self,
        request: &Request,
        snapshot: StateSnapshot,
        ctx: &StageContext,
    ) -> Result<StagePatch, StageError> {
        let factors = score_factors(&snapshot, ctx.config.min_evidence);
        let total = clamp01(
            factors.iter().map(|(_, v)| v).sum::<f64>() / factors.len().max(1) as f64,
        );

        let user = request.user_id().unwrap_or(ANONYMOUS_USER);
        let stats = update_ema(&ctx.config.log_dir, user, total, ctx.config.value_ema_alpha)?;

        Ok(StagePatch::new().with_values(ValueScore {
            total,
            factors,
            ema: stats.ema,
        }))
    }
}

fn score_factors(snapshot: &StateSnapshot, min_evidence: usize) -> Vec<(String, f64)> {
    let chosen = snapshot.leading_option();

    let goal_alignment = match snapshot.normalized.as_ref() {
        Some(normalized) if !normalized.goals.is_empty() => {
            let haystack = format!(
                "{} {}",
                normalized.query.to_lowercase(),
                chosen.map(|c| c.title.to_lowercase()).unwrap_or_default()
            );
            let hits = normalized
                .goals
                .iter()
                .filter(|goal| haystack.contains(&goal.to_lowercase()))
                .count();
            hits as f64 / normalized.goals.len() as f64
        }
        // No stated goals: neutral alignment.
        _ => 0.5,
    };

    let safety = 1.0 - chosen.and_then(|c| c.risk).unwrap_or(0.2);
    let feasibility = chosen
        .and_then(|c| c.feasibility.or(c.score))
        .unwrap_or(0.5);
    let evidence_support = if min_evidence == 0 {
        1.0
    } else {
        (snapshot.evidence_len() as f64 / (2.0 * min_evidence as f64)).min(1.0)
    };

    vec![
        ("goal_alignment".to_string(), clamp01(goal_alignment)),
        ("safety".to_string(), clamp01(safety)),
        ("feasibility".to_string(), clamp01(feasibility)),
        ("evidence_support".to_string(), clamp01(evidence_support)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CandidateOption;
    use crate::state::NormalizedInput;

    #[test]
    fn factors_are_clamped_and_named() {
        let snapshot = StateSnapshot {
            normalized: Some(NormalizedInput {
                query: "improve my health routine".to_string(),
                goals: vec!["health".to_string(), "wealth".to_string()],
                constraints: vec![],
                affect: None,
            }),
            options: Some(vec![CandidateOption::new("o1", "morning run")
                .with_score(0.8)
                .with_risk(0.1)]),
            ..StateSnapshot::default()
        };
        let factors = score_factors(&snapshot, 2);
        let get = |name: &str| factors.iter().find(|(n, _)| n == name).unwrap().1;
        assert!((get("goal_alignment") - 0.5).abs() < 1e-9); // 1 of 2 goals
        assert!((get("safety") - 0.9).abs() < 1e-9);
        assert!(factors.iter().all(|(_, v)| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn ema_converges_to_constant_score() {
        let dir = tempfile::tempdir().unwrap();
        let mut last = 0.0;
        for _ in 0..60 {
            last = update_ema(dir.path(), "u1", 0.8, 0.1).unwrap().ema;
        }
        assert!((last - 0.8).abs() < 1e-6);
    }

    #[test]
    fn ema_folds_from_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        update_ema(dir.path(), "u1", 1.0, 0.1).unwrap(); // ema = 1.0
        let second = update_ema(dir.path(), "u1", 0.0, 0.1).unwrap();
        assert!((second.ema - 0.9).abs() < 1e-9);
        assert_eq!(second.count, 2);
    }

    #[test]
    fn user_names_are_sanitized_for_paths() {
        let path = stats_path(Path::new("/logs"), "../evil user");
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "value_stats.___evil_user.json"
        );
    }
}
