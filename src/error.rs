use crate::eligibility::Action;
use crate::entity::CurrentState;
use crate::types::{EntityId, Identity, ScopeId};

/// Malformed stage tables, hierarchies or config files. Fatal at startup.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// An entity draft that cannot be submitted.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DraftError {
    #[error("{0} is not set")]
    MissingField(&'static str),
    #[error("amount is set to zero")]
    ZeroAmount,
    #[error("new tickets start open and unassigned")]
    NotFresh,
}

/// Business-rule outcomes of an attempted transition. These are expected and
/// recoverable; callers match on them instead of treating them as faults.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{actor} may not {action:?} while the entity is {state:?}")]
    IneligibleAction {
        actor: Identity,
        action: Action,
        state: CurrentState,
    },
    #[error("{action:?} is not defined while the entity is {state:?}")]
    InvalidTransition { action: Action, state: CurrentState },
    #[error("snapshot of {entity_id} is at revision {seen}, store holds revision {current}")]
    StaleEntityState {
        entity_id: EntityId,
        seen: u64,
        current: u64,
    },
    #[error("a rejection requires a non-empty justification note")]
    MissingJustification,
}

/// Infrastructure failure of the remote directory. Never read as "no roles".
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory lookup failed for {subject}: {reason}")]
    DirectoryLookupFailure { subject: String, reason: String },
}

impl DirectoryError {
    pub fn lookup(subject: impl ToString, reason: impl ToString) -> Self {
        Self::DirectoryLookupFailure {
            subject: subject.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything the service layer can return.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error("scope {0} is not part of the organization")]
    UnknownScope(ScopeId),
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl ServiceError {
    /// True for outcomes the actor caused (and can recover from), false for
    /// infrastructure faults.
    pub fn is_business_rule(&self) -> bool {
        matches!(self, ServiceError::Transition(_) | ServiceError::Draft(_))
    }

    pub fn as_transition(&self) -> Option<&TransitionError> {
        match self {
            ServiceError::Transition(err) => Some(err),
            _ => None,
        }
    }
}
