//! Eligibility / permission engine
//!
//! Who may do what to an entity in its current state. Everything here is a pure
//! function of the entity, the actor and the directory snapshot the
//! [`Eligibility`] was built with; nothing is cached between calls.
//!
//! The rules live in one table, `Eligibility::rule`, keyed by
//! `(CurrentState, Action)`. A missing entry means the action is undefined in
//! that state ([`TransitionError::InvalidTransition`]); an entry whose predicate
//! fails means the actor lacks permission ([`TransitionError::IneligibleAction`]).
use crate::directory::{Directory, Role};
use crate::entity::{CurrentState, EntityPatch, WorkflowEntity};
use crate::error::TransitionError;
use crate::stage::{Pipeline, StageStatus};
use crate::status::{self, AggregateStatus};
use crate::ticket::{TicketState, normalize_technicians};
use crate::types::{Identity, TimeStamp};
use chrono::Utc;
use std::collections::BTreeSet;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum Action {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
    #[n(2)]
    AssignTechnician,
    #[n(3)]
    UpdateStatus,
    #[n(4)]
    ScheduleDate,
    #[n(5)]
    Edit,
    #[n(6)]
    Delete,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Approve,
        Action::Reject,
        Action::AssignTechnician,
        Action::UpdateStatus,
        Action::ScheduleDate,
        Action::Edit,
        Action::Delete,
    ];

    /// Creator self-service actions, granted outside the stage table.
    pub fn is_self_service(&self) -> bool {
        matches!(self, Action::Edit | Action::Delete)
    }
}

/// An action together with its payload. Delete has no command form: the
/// engine only authorizes it, the store performs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Approve,
    Reject,
    AssignTechnicians(Vec<Identity>),
    UpdateStatus(TicketState),
    ScheduleDate(TimeStamp<Utc>),
    Edit(EntityPatch),
}

impl Command {
    pub fn action(&self) -> Action {
        match self {
            Command::Approve => Action::Approve,
            Command::Reject => Action::Reject,
            Command::AssignTechnicians(_) => Action::AssignTechnician,
            Command::UpdateStatus(_) => Action::UpdateStatus,
            Command::ScheduleDate(_) => Action::ScheduleDate,
            Command::Edit(_) => Action::Edit,
        }
    }

    /// Rejections need a justification note.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Command::Reject | Command::UpdateStatus(TicketState::Cancelled)
        )
    }
}

type Predicate<'a> = fn(&Eligibility<'a>, &WorkflowEntity, &Identity) -> bool;

#[derive(Debug, Clone, Copy)]
pub struct Eligibility<'a> {
    pipeline: &'a Pipeline,
    directory: &'a Directory,
}

impl<'a> Eligibility<'a> {
    pub fn new(pipeline: &'a Pipeline, directory: &'a Directory) -> Self {
        Self {
            pipeline,
            directory,
        }
    }

    pub fn pipeline(&self) -> &'a Pipeline {
        self.pipeline
    }

    pub fn directory(&self) -> &'a Directory {
        self.directory
    }

    pub fn skip_flags(&self, entity: &WorkflowEntity) -> Vec<bool> {
        self.pipeline
            .skip_flags(entity.stages(), entity.scope(), self.directory)
    }

    pub fn current_state(&self, entity: &WorkflowEntity) -> CurrentState {
        match entity.ticket_body() {
            Some(ticket) => CurrentState::Lifecycle(ticket.state),
            None => CurrentState::Staged(status::derive_for(
                entity.stages(),
                self.pipeline,
                entity.scope(),
                self.directory,
            )),
        }
    }

    pub fn can_act(&self, entity: &WorkflowEntity, actor: &Identity, action: Action) -> bool {
        self.check(entity, actor, action).is_ok()
    }

    pub fn available_actions(&self, entity: &WorkflowEntity, actor: &Identity) -> BTreeSet<Action> {
        let state = self.current_state(entity);
        Action::ALL
            .into_iter()
            .filter(|action| self.check_in(state, entity, actor, *action).is_ok())
            .collect()
    }

    /// The actor has some workflow action on the entity, creator self-service
    /// not counted. Feeds the "actionable" view.
    pub fn is_actionable(&self, entity: &WorkflowEntity, actor: &Identity) -> bool {
        let state = self.current_state(entity);
        Action::ALL
            .into_iter()
            .filter(|action| !action.is_self_service())
            .any(|action| self.check_in(state, entity, actor, action).is_ok())
    }

    pub fn check(
        &self,
        entity: &WorkflowEntity,
        actor: &Identity,
        action: Action,
    ) -> Result<(), TransitionError> {
        self.check_in(self.current_state(entity), entity, actor, action)
    }

    /// [`check`](Self::check) plus validation of the command's payload.
    pub fn check_command(
        &self,
        entity: &WorkflowEntity,
        actor: &Identity,
        command: &Command,
    ) -> Result<(), TransitionError> {
        let state = self.current_state(entity);
        let action = command.action();
        self.check_in(state, entity, actor, action)?;

        let payload_ok = match command {
            Command::Approve | Command::Reject => true,
            Command::UpdateStatus(next) => entity
                .ticket_body()
                .is_some_and(|ticket| ticket.state.can_move_to(*next)),
            Command::AssignTechnicians(technicians) => {
                let wanted = normalize_technicians(technicians);
                !wanted.is_empty()
                    && entity
                        .ticket_body()
                        .is_some_and(|ticket| ticket.technicians != wanted)
                    && wanted.iter().all(|tech| {
                        self.directory
                            .has_role_in(tech, Role::Technician, entity.scope())
                    })
            }
            Command::ScheduleDate(date) => entity
                .ticket_body()
                .is_some_and(|ticket| ticket.scheduled_for.as_ref() != Some(date)),
            Command::Edit(patch) => patch
                .apply(entity.body())
                .is_some_and(|(_, changed)| changed),
        };

        if payload_ok {
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition { action, state })
        }
    }

    pub fn can_apply(&self, entity: &WorkflowEntity, actor: &Identity, command: &Command) -> bool {
        self.check_command(entity, actor, command).is_ok()
    }

    fn check_in(
        &self,
        state: CurrentState,
        entity: &WorkflowEntity,
        actor: &Identity,
        action: Action,
    ) -> Result<(), TransitionError> {
        let Some(predicate) = Self::rule(state, action) else {
            return Err(TransitionError::InvalidTransition { action, state });
        };
        if predicate(self, entity, actor) {
            Ok(())
        } else {
            Err(TransitionError::IneligibleAction {
                actor: actor.clone(),
                action,
                state,
            })
        }
    }

    /// The transition table.
    fn rule(state: CurrentState, action: Action) -> Option<Predicate<'a>> {
        use Action::*;
        use AggregateStatus::*;
        use TicketState::*;

        match state {
            CurrentState::Staged(status) => match (status, action) {
                (AwaitingStage(_), Approve | Reject) => Some(Self::resolves_current_stage),
                (AwaitingStage(_), Edit | Delete) => Some(Self::owns_unlocked),
                (AwaitingStage(_), AssignTechnician | UpdateStatus | ScheduleDate) => None,
                (FullyApproved | Rejected, _) => None,
            },
            CurrentState::Lifecycle(ticket_state) => match (ticket_state, action) {
                (Open | Assigned, AssignTechnician) => Some(Self::manages_scope),
                (InProgress | OnHold, AssignTechnician) => None,
                (Open | Assigned | InProgress | OnHold, UpdateStatus | ScheduleDate) => {
                    Some(Self::works_on_ticket)
                }
                (Open | Assigned | InProgress | OnHold, Edit | Delete) => Some(Self::owns_unlocked),
                (Open | Assigned | InProgress | OnHold, Approve | Reject) => None,
                (Completed | Cancelled, _) => None,
            },
        }
    }

    // Predicates

    /// Holds the role of the first pending non-skipped stage in the entity's
    /// scope, every earlier stage is approved or skipped, and has not already
    /// signed an earlier stage of this entity.
    fn resolves_current_stage(&self, entity: &WorkflowEntity, actor: &Identity) -> bool {
        let skipped = self.skip_flags(entity);
        let AggregateStatus::AwaitingStage(index) = status::derive_stages(entity.stages(), &skipped)
        else {
            return false;
        };
        let stages = entity.stages();
        let Some(definition) = self.pipeline.definition(&stages[index].name) else {
            return false;
        };

        let earlier_settled = stages[..index]
            .iter()
            .zip(&skipped)
            .all(|(stage, skip)| *skip || stage.status == StageStatus::Approved);
        let already_signed = stages
            .iter()
            .any(|stage| stage.resolved_by.as_ref() == Some(actor));

        earlier_settled
            && !already_signed
            && self
                .directory
                .has_role_in(actor, definition.role, entity.scope())
    }

    /// Administrator anywhere, or supervisor of the entity's scope.
    fn manages_scope(&self, entity: &WorkflowEntity, actor: &Identity) -> bool {
        self.directory.has_role(actor, Role::Administrator)
            || self
                .directory
                .has_role_in(actor, Role::Supervisor, entity.scope())
    }

    /// A manager, or a technician explicitly assigned to this ticket.
    fn works_on_ticket(&self, entity: &WorkflowEntity, actor: &Identity) -> bool {
        if self.manages_scope(entity, actor) {
            return true;
        }
        entity
            .ticket_body()
            .is_some_and(|ticket| ticket.is_assigned(actor))
            && self.directory.has_role(actor, Role::Technician)
    }

    fn owns_unlocked(&self, entity: &WorkflowEntity, actor: &Identity) -> bool {
        entity.owner() == actor && !entity.edit_locked()
    }
}
