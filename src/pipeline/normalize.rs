//! `normalize_input` — the first (critical) stage.
//!
//! Collapses whitespace in the query and lifts goals, constraints, and the
//! affect hint out of the raw context map. Later stages read the normalized
//! form only.

use async_trait::async_trait;
use serde_json::Value;

use crate::request::Request;
use crate::stage::{Stage, StageClass, StageContext, StageError, StagePatch};
use crate::state::{NormalizedInput, StateSnapshot};
use crate::types::StageName;

#[derive(Debug, Default)]
pub struct NormalizeStage;

#[async_trait]
impl Stage for NormalizeStage {
    fn name(&self) -> StageName {
        StageName::NormalizeInput
    }

    fn class(&self) -> StageClass {
        StageClass::Critical
    }

    fn prefilled(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.normalized.is_some()
    }

    async fn run(
        &self,
        request: &Request,
        _snapshot: StateSnapshot,
        _ctx: &StageContext,
    ) -> Result<StagePatch, StageError> {
        let query = collapse_whitespace(&request.query);
        if query.is_empty() {
            return Err(StageError::ValidationFailed(
                "query is empty after normalization".to_string(),
            ));
        }

        let constraints = request
            .context
            .get("constraints")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let affect = request
            .context
            .get("affect")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(StagePatch::new().with_normalized(NormalizedInput {
            query,
            goals: request.goals(),
            constraints,
            affect,
        }))
    }
}

/// Trim and collapse internal whitespace runs into single spaces.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VeritasConfig;
    use crate::services::Services;
    use serde_json::json;
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

    #[tokio::test]
    async fn collapses_whitespace_and_extracts_context() {
        let request = Request::builder()
            .query("  what   should\n I do? ")
            .context("goals", json!(["health", "focus"]))
            .context("constraints", json!(["budget under 50"]))
            .context("affect", json!("stressed"))
            .build();

        let patch = NormalizeStage
            .run(&request, StateSnapshot::default(), &ctx())
            .await
            .unwrap();
        let normalized = patch.normalized.unwrap();
        assert_eq!(normalized.query, "what should I do?");
        assert_eq!(normalized.goals, vec!["health", "focus"]);
        assert_eq!(normalized.constraints, vec!["budget under 50"]);
        assert_eq!(normalized.affect.as_deref(), Some("stressed"));
    }

    #[tokio::test]
    async fn whitespace_only_query_fails() {
        let request = Request::builder().query("   \n\t ").build();
        let err = NormalizeStage
            .run(&request, StateSnapshot::default(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ValidationFailed(_)));
    }

    #[test]
    fn stage_is_critical() {
        assert_eq!(NormalizeStage.class(), StageClass::Critical);
    }
}
