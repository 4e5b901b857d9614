//! Audit records of applied transitions
use crate::eligibility::Action;
use crate::entity::CurrentState;
use crate::types::{EntityId, Identity, TimeStamp};
use chrono::Utc;

/// One applied transition. Carries everything a notifier needs to describe it.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct TransitionRecord {
    #[n(0)]
    pub entity_id: EntityId,
    #[n(1)]
    pub revision: u64, // revision the transition produced
    #[n(2)]
    pub actor: Identity,
    #[n(3)]
    pub action: Action,
    #[n(4)]
    pub prior: CurrentState,
    #[n(5)]
    pub next: CurrentState,
    #[n(6)]
    pub stage: Option<String>, // stage resolved by an approve/reject
    #[n(7)]
    pub justification: Option<String>,
    #[n(8)]
    pub at: TimeStamp<Utc>,
}

impl TransitionRecord {
    /// Encode to CBOR and hash it. The digest is stable for a given record and
    /// serves as the idempotency key for notification delivery.
    pub fn build(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }

    /// `{entity id}/{revision}`, zero padded so records sort in order.
    pub fn storage_key(&self) -> String {
        history_key(&self.entity_id, self.revision)
    }

    pub fn history_prefix(entity_id: &EntityId) -> String {
        format!("{entity_id}/")
    }
}

fn history_key(entity_id: &EntityId, revision: u64) -> String {
    format!("{entity_id}/{revision:020}")
}
