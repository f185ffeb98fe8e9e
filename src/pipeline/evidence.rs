//! `gather_evidence` — bounded, ranked evidence from memory and world.
//!
//! Unavailable collaborators degrade silently (fewer items); ranking is by
//! confidence descending with ties broken by source name, and the result is
//! capped at `max_evidence`.

use async_trait::async_trait;

use crate::request::{EvidenceItem, Request};
use crate::stage::{Stage, StageContext, StageError, StagePatch};
use crate::state::StateSnapshot;
use crate::types::{EvidenceKind, StageName};

#[derive(Debug, Default)]
pub struct GatherEvidenceStage;

#[async_trait]
impl Stage for GatherEvidenceStage {
    fn name(&self) -> StageName {
        StageName::GatherEvidence
    }

    fn prefilled(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.evidence.is_some()
    }

    async fn run(
        &self,
        _request: &Request,
        snapshot: StateSnapshot,
        ctx: &StageContext,
    ) -> Result<StagePatch, StageError> {
        let query = snapshot.query().to_string();
        let cap = ctx.config.max_evidence;
        let mut items: Vec<EvidenceItem> = Vec::new();

        if let Some(memory) = ctx.services.memory.get() {
            for kind in [EvidenceKind::MemoryEpisodic, EvidenceKind::MemorySemantic] {
                match memory.recall(&query, kind, cap).await {
                    Ok(mut recalled) => items.append(&mut recalled),
                    Err(err) => {
                        tracing::debug!(error = %err, kind = %kind, "memory recall failed");
                    }
                }
            }
        }

        if let Some(world) = ctx.services.world.get() {
            match world.observe(&query).await {
                Ok(mut observed) => items.append(&mut observed),
                Err(err) => tracing::debug!(error = %err, "world observation failed"),
            }
        }

        Ok(StagePatch::new().with_evidence(rank_and_cap(items, cap)))
    }
}

/// Confidence descending, ties by source name lexicographic; cap applied last.
pub(crate) fn rank_and_cap(mut items: Vec<EvidenceItem>, cap: usize) -> Vec<EvidenceItem> {
    items.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.source.cmp(&b.source))
    });
    items.truncate(cap);
    items
}
