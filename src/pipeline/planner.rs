//! `run_planner` — a deterministic execution plan for the chosen option.
//!
//! The plan is derived from the debate outcome and the blocking critiques:
//! assess, mitigate (only when blockers exist), execute, review. Steps must
//! form a DAG; a dependency cycle is a best-effort failure that yields an
//! empty plan plus a critique.

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::request::Request;
use crate::stage::{Stage, StageContext, StageError, StagePatch};
use crate::state::{Plan, PlanStep, StateSnapshot};
use crate::types::{Severity, StageName};

#[derive(Debug, Default)]
pub struct RunPlannerStage;

#[async_trait]
impl Stage for RunPlannerStage {
    fn name(&self) -> StageName {
        StageName::RunPlanner
    }

    fn prefilled(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.plan.is_some()
    }

    async fn run(
        &self,
        _request: &Request,
        snapshot: StateSnapshot,
        ctx: &StageContext,
    ) -> Result<StagePatch, StageError> {
        let Some(chosen) = snapshot.leading_option().cloned() else {
            // Nothing to plan for; an empty plan is a valid output.
            return Ok(StagePatch::new().with_plan(Plan::default()));
        };

        let blockers: Vec<String> = snapshot
            .critiques
            .as_deref()
            .map(|critiques| {
                critiques
                    .iter()
                    .filter(|c| c.severity >= Severity::High)
                    .map(|c| c.fix.clone())
                    .collect()
            })
            .unwrap_or_default();
        let evidence_sources: Vec<String> = snapshot
            .evidence
            .as_deref()
            .map(|items| items.iter().map(|e| e.source.clone()).collect())
            .unwrap_or_default();

        let mut steps = Vec::new();
        steps.push(PlanStep {
            id: "assess".to_string(),
            title: format!("Assess: {}", chosen.title),
            objective: "validate the assumptions behind the chosen option".to_string(),
            tasks: if evidence_sources.is_empty() {
                vec!["collect at least one corroborating source".to_string()]
            } else {
                evidence_sources
                    .iter()
                    .map(|s| format!("re-check evidence from {s}"))
                    .collect()
            },
            metrics: vec!["all assumptions confirmed or retired".to_string()],
            risks: vec!["assumptions may be stale".to_string()],
            done_criteria: vec!["assessment notes recorded".to_string()],
            dependencies: vec![],
        });

        let execute_deps = if blockers.is_empty() {
            vec!["assess".to_string()]
        } else {
            steps.push(PlanStep {
                id: "mitigate".to_string(),
                title: "Mitigate blocking critiques".to_string(),
                objective: "clear every blocker raised by the critique stage".to_string(),
                tasks: blockers,
                metrics: vec!["no high-severity critiques remain".to_string()],
                risks: vec!["mitigation may invalidate the option".to_string()],
                done_criteria: vec!["critique re-run is clean".to_string()],
                dependencies: vec!["assess".to_string()],
            });
            vec!["assess".to_string(), "mitigate".to_string()]
        };

        steps.push(PlanStep {
            id: "execute".to_string(),
            title: format!("Execute: {}", chosen.title),
            objective: chosen
                .rationale
                .clone()
                .unwrap_or_else(|| "carry out the chosen option".to_string()),
            tasks: vec![format!("perform {}", chosen.title)],
            metrics: vec!["option completed".to_string()],
            risks: chosen
                .risk
                .map(|r| vec![format!("residual risk {r:.2}")])
                .unwrap_or_default(),
            done_criteria: vec!["outcome observed".to_string()],
            dependencies: execute_deps,
        });
        steps.push(PlanStep {
            id: "review".to_string(),
            title: "Review outcome".to_string(),
            objective: "compare the outcome against the stated goals".to_string(),
            tasks: vec!["record what happened".to_string()],
            metrics: vec!["review notes filed".to_string()],
            risks: vec![],
            done_criteria: vec!["follow-ups captured".to_string()],
            dependencies: vec!["execute".to_string()],
        });

        steps.truncate(ctx.config.max_plan_steps);
        let plan = Plan { steps };
        validate_dag(&plan)?;
        Ok(StagePatch::new().with_plan(plan))
    }
}

/// Reject plans whose dependency graph contains a cycle or a dangling edge.
pub(crate) fn validate_dag(plan: &Plan) -> Result<(), StageError> {
    let ids: FxHashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &plan.steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(StageError::ValidationFailed(format!(
                    "step {} depends on unknown step {dep}",
                    step.id
                )));
            }
        }
    }

    // Iterative DFS with colors: 0 = unvisited, 1 = on stack, 2 = done.
    let index: FxHashMap<&str, usize> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut color = vec![0u8; plan.steps.len()];
    for start in 0..plan.steps.len() {
        if color[start] != 0 {
            continue;
        }
        let mut stack = vec![(start, 0usize)];
        color[start] = 1;
        while let Some((node, edge)) = stack.last().copied() {
            let deps = &plan.steps[node].dependencies;
            if edge < deps.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = index[deps[edge].as_str()];
                match color[next] {
                    0 => {
                        color[next] = 1;
                        stack.push((next, 0));
                    }
                    1 => {
                        return Err(StageError::ValidationFailed(format!(
                            "plan dependencies form a cycle through {}",
                            plan.steps[next].id
                        )));
                    }
                    _ => {}
                }
            } else {
                color[node] = 2;
                stack.pop();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VeritasConfig;
    use crate::request::{CandidateOption, Critique};
    use crate::services::Services;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn ctx() -> StageContext {
        StageContext {
            request_id: "req-1".to_string(),
            config: Arc::new(VeritasConfig::default()),
            services: Arc::new(Services::default()),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            title: id.to_string(),
            objective: String::new(),
            tasks: vec![],
            metrics: vec![],
            risks: vec![],
            done_criteria: vec![],
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn plan_includes_mitigation_for_blockers() {
        let snapshot = StateSnapshot {
            options: Some(vec![CandidateOption::new("o1", "ship it").with_score(0.8)]),
            critiques: Some(vec![Critique::new(
                "high_risk",
                Severity::High,
                "add a rollback path",
            )]),
            ..StateSnapshot::default()
        };
        let patch = RunPlannerStage
            .run(&Request::builder().query("q").build(), snapshot, &ctx())
            .await
            .unwrap();
        let plan = patch.plan.unwrap();
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["assess", "mitigate", "execute", "review"]);
        assert!(validate_dag(&plan).is_ok());
    }

    #[tokio::test]
    async fn no_options_yields_empty_plan() {
        let patch = RunPlannerStage
            .run(
                &Request::builder().query("q").build(),
                StateSnapshot::default(),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(patch.plan.unwrap().steps.is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let plan = Plan {
            steps: vec![step("a", &["b"]), step("b", &["a"])],
        };
        assert!(matches!(
            validate_dag(&plan),
            Err(StageError::ValidationFailed(_))
        ));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let plan = Plan {
            steps: vec![step("a", &["ghost"])],
        };
        assert!(validate_dag(&plan).is_err());
    }

    #[test]
    fn diamond_dependencies_are_fine() {
        let plan = Plan {
            steps: vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("d", &["b", "c"]),
            ],
        };
        assert!(validate_dag(&plan).is_ok());
    }
}
