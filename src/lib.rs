//! Role-gated approval and ticket workflows.
//!
//! Expense claims move through an ordered pipeline of approval stages, service
//! tickets through a fixed lifecycle. Who may act is decided from the actor's
//! roles in an organizational hierarchy, see [`eligibility`].

pub mod config;
pub mod directory;
pub mod eligibility;
pub mod entity;
pub mod error;
pub mod executor;
pub mod query;
pub mod record;
pub mod service;
pub mod stage;
pub mod status;
pub mod store;
pub mod ticket;
pub mod types;
pub mod utils;

pub use config::EngineConfig;
pub use directory::{Directory, DirectoryProvider, NodeKind, OrgNode, Role, RoleAssignment};
pub use eligibility::{Action, Command, Eligibility};
pub use entity::{Currency, CurrentState, EntityKind, EntityPatch, ExpenseClaim, WorkflowEntity};
pub use error::{ConfigError, DirectoryError, DraftError, ServiceError, TransitionError};
pub use executor::{Applied, Executor};
pub use query::{Criteria, ViewMode};
pub use service::{Listing, WorkflowService};
pub use stage::{Pipeline, SkipRule, StageDefinition, StageStatus};
pub use status::AggregateStatus;
pub use store::{EntityStore, SledStore};
pub use ticket::{Ticket, TicketState};
pub use types::{EntityId, Identity, ScopeId, TimeStamp};
