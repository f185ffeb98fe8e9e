//! `collect_options` — adopt caller options or ask the LLM for candidates.
//!
//! When the request carries options they are adopted as-is (capped). When it
//! does not, the LLM service is consulted with bounded retries; if no
//! candidates can be obtained at all, one conservative fallback option is
//! synthesized so every downstream invariant (debate always chooses when an
//! option exists) stays meaningful.

use std::time::Duration;

use async_trait::async_trait;

use crate::request::{CandidateOption, Request};
use crate::services::retry_with_backoff;
use crate::stage::{Stage, StageContext, StageError, StagePatch};
use crate::state::StateSnapshot;
use crate::types::{StageName, Verdict};

/// Id of the synthesized fallback option.
pub const FALLBACK_OPTION_ID: &str = "opt-fallback";

#[derive(Debug, Default)]
pub struct CollectOptionsStage;

#[async_trait]
impl Stage for CollectOptionsStage {
    fn name(&self) -> StageName {
        StageName::CollectOptions
    }

    fn prefilled(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.options.is_some()
    }

    async fn run(
        &self,
        request: &Request,
        snapshot: StateSnapshot,
        ctx: &StageContext,
    ) -> Result<StagePatch, StageError> {
        let max = ctx.config.limits.max_options;

        if !request.options.is_empty() {
            let mut options = request.options.clone();
            options.truncate(max);
            return Ok(StagePatch::new().with_options(options));
        }

        let query = snapshot.query().to_string();
        let goals = snapshot
            .normalized
            .as_ref()
            .map(|n| n.goals.clone())
            .unwrap_or_default();

        if let Some(llm) = ctx.services.llm.get() {
            let proposed = retry_with_backoff(
                "llm",
                2,
                Duration::from_millis(200),
                Duration::from_secs(5),
                ctx.deadline,
                || llm.propose_options(&query, &goals, max),
            )
            .await;
            match proposed {
                Ok(options) if !options.is_empty() => {
                    let mut options = options;
                    options.truncate(max);
                    return Ok(StagePatch::new().with_options(options));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "llm option proposal failed, synthesizing fallback");
                }
            }
        }

        Ok(StagePatch::new().with_options(vec![fallback_option(&query)]))
    }
}

fn fallback_option(query: &str) -> CandidateOption {
    let mut preview = query.to_string();
    if preview.chars().count() > 60 {
        preview = preview.chars().take(60).collect::<String>();
        preview.push('…');
    }
    CandidateOption::new(FALLBACK_OPTION_ID, format!("Proceed cautiously: {preview}"))
        .with_score(0.5)
        .with_verdict(Verdict::NeedsReview)
        .with_risk(0.2)
        .with_rationale("no candidate options were supplied or generated")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VeritasConfig;
    use crate::services::{LlmClient, ServiceError, Services};
    use crate::state::NormalizedInput;
    use std::sync::Arc;
    use tokio::time::Instant;

    struct FixedLlm(Vec<CandidateOption>);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn propose_options(
            &self,
            _query: &str,
            _goals: &[String],
            _max: usize,
        ) -> Result<Vec<CandidateOption>, ServiceError> {
            Ok(self.0.clone())
        }
    }

    fn ctx(services: Services) -> StageContext {
        StageContext {
            request_id: "req-1".to_string(),
            config: Arc::new(VeritasConfig::default()),
            services: Arc::new(services),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            normalized: Some(NormalizedInput {
                query: "pick a plan".to_string(),
                goals: vec![],
                constraints: vec![],
                affect: None,
            }),
            ..StateSnapshot::default()
        }
    }

    #[tokio::test]
    async fn caller_options_are_adopted() {
        let request = Request::builder()
            .query("pick a plan")
            .option(CandidateOption::new("o1", "plan a"))
            .build();
        let patch = CollectOptionsStage
            .run(&request, snapshot(), &ctx(Services::default()))
            .await
            .unwrap();
        assert_eq!(patch.options.unwrap()[0].id, "o1");
    }

    #[tokio::test]
    async fn llm_options_are_used_when_request_has_none() {
        let services = Services::builder()
            .llm(Arc::new(FixedLlm(vec![CandidateOption::new("llm-1", "try x")])))
            .build();
        let request = Request::builder().query("pick a plan").build();
        let patch = CollectOptionsStage
            .run(&request, snapshot(), &ctx(services))
            .await
            .unwrap();
        assert_eq!(patch.options.unwrap()[0].id, "llm-1");
    }

    #[tokio::test]
    async fn fallback_is_synthesized_without_llm() {
        let request = Request::builder().query("pick a plan").build();
        let patch = CollectOptionsStage
            .run(&request, snapshot(), &ctx(Services::default()))
            .await
            .unwrap();
        let options = patch.options.unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].id, FALLBACK_OPTION_ID);
        assert_eq!(options[0].verdict, Some(Verdict::NeedsReview));
    }
}
