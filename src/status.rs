//! Aggregate status derivation
//!
//! Folds the ordered per-stage statuses of an entity into one
//! [`AggregateStatus`]. Pure and deterministic; used both for display and to
//! decide which stage is currently actionable.
use crate::directory::Directory;
use crate::stage::{Pipeline, Stage, StageStatus};
use crate::types::ScopeId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum AggregateStatus {
    /// Index of the first non-skipped stage still pending.
    #[n(0)]
    AwaitingStage(#[n(0)] usize),
    #[n(1)]
    FullyApproved,
    #[n(2)]
    Rejected,
}

impl AggregateStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AggregateStatus::AwaitingStage(_))
    }
}

/// Derive from statuses and skip flags given in configured order. A missing
/// skip flag counts as "not skipped".
///
/// Any non-skipped rejection wins, wherever it sits. Otherwise the first
/// non-skipped pending stage is the one being awaited.
pub fn derive(statuses: &[StageStatus], skipped: &[bool]) -> AggregateStatus {
    let active = || {
        statuses
            .iter()
            .enumerate()
            .filter(|(i, _)| !skipped.get(*i).copied().unwrap_or(false))
    };

    if active().any(|(_, status)| *status == StageStatus::Rejected) {
        return AggregateStatus::Rejected;
    }

    active()
        .find(|(_, status)| **status == StageStatus::Pending)
        .map(|(i, _)| AggregateStatus::AwaitingStage(i))
        .unwrap_or(AggregateStatus::FullyApproved)
}

/// Convenience over [`derive`] for stage records.
pub fn derive_stages(stages: &[Stage], skipped: &[bool]) -> AggregateStatus {
    let statuses: Vec<StageStatus> = stages.iter().map(|s| s.status).collect();
    derive(&statuses, skipped)
}

/// Derive for stage records of an entity living in `scope`, evaluating the
/// pipeline's skip predicates against `directory`.
pub fn derive_for(
    stages: &[Stage],
    pipeline: &Pipeline,
    scope: &ScopeId,
    directory: &Directory,
) -> AggregateStatus {
    derive_stages(stages, &pipeline.skip_flags(stages, scope, directory))
}
