//! Transition executor
//!
//! Applies a [`Command`] to the freshest snapshot of an entity. Eligibility is
//! always re-checked here; a decision the caller made earlier (for instance
//! when it rendered its controls) is never trusted.
use crate::eligibility::{Action, Command, Eligibility};
use crate::entity::{CurrentState, WorkflowEntity};
use crate::error::TransitionError;
use crate::record::TransitionRecord;
use crate::stage::StageStatus;
use crate::status::AggregateStatus;
use crate::ticket::TicketState;
use crate::types::{Identity, TimeStamp};

/// Result of a successful transition. Callers replace their copy of the
/// entity with `entity`; they never merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub entity: WorkflowEntity,
    pub record: TransitionRecord,
}

#[derive(Debug, Clone, Copy)]
pub struct Executor<'a> {
    eligibility: Eligibility<'a>,
}

impl<'a> Executor<'a> {
    pub fn new(eligibility: Eligibility<'a>) -> Self {
        Self { eligibility }
    }

    /// `fresh` is the latest snapshot read from the store, `seen_revision` the
    /// revision the actor was looking at when they chose the command.
    pub fn apply_action(
        &self,
        fresh: &WorkflowEntity,
        seen_revision: u64,
        actor: &Identity,
        command: Command,
        justification: Option<&str>,
    ) -> Result<Applied, TransitionError> {
        ensure_fresh(fresh, seen_revision)?;

        let prior = self.eligibility.current_state(fresh);
        self.eligibility.check_command(fresh, actor, &command)?;

        let note = justification.map(str::trim).filter(|note| !note.is_empty());
        if command.is_rejection() && note.is_none() {
            return Err(TransitionError::MissingJustification);
        }

        let action = command.action();
        let mut next = fresh.clone();
        let stage = match (prior, command) {
            (CurrentState::Staged(AggregateStatus::AwaitingStage(index)), Command::Approve) => {
                let skipped = self.eligibility.skip_flags(fresh);
                let stages = next.stages_mut();
                stages[index].resolve(StageStatus::Approved, actor);

                // Skipped stages are stamped by the approver who passes them,
                // so a later change of the skip predicate cannot reopen them.
                // The final approval also passes every skipped stage after it.
                let last_open = !stages
                    .iter()
                    .zip(&skipped)
                    .skip(index + 1)
                    .any(|(stage, skip)| !*skip && stage.status == StageStatus::Pending);
                let passed = if last_open { stages.len() } else { index };
                for (stage, _) in stages[..passed]
                    .iter_mut()
                    .zip(&skipped)
                    .filter(|(stage, skip)| **skip && stage.status == StageStatus::Pending)
                {
                    stage.resolve(StageStatus::Approved, actor);
                }
                next.lock();
                Some(next.stages()[index].name.clone())
            }
            (CurrentState::Staged(AggregateStatus::AwaitingStage(index)), Command::Reject) => {
                next.stages_mut()[index].resolve(StageStatus::Rejected, actor);
                next.lock();
                Some(next.stages()[index].name.clone())
            }
            (CurrentState::Lifecycle(state), Command::AssignTechnicians(technicians)) => {
                if let Some(ticket) = next.ticket_mut() {
                    ticket.set_technicians(technicians);
                    if state == TicketState::Open {
                        ticket.state = TicketState::Assigned;
                    }
                }
                if state == TicketState::Open {
                    next.lock();
                }
                None
            }
            (CurrentState::Lifecycle(_), Command::UpdateStatus(target)) => {
                if let Some(ticket) = next.ticket_mut() {
                    ticket.state = target;
                }
                next.lock();
                None
            }
            (CurrentState::Lifecycle(_), Command::ScheduleDate(date)) => {
                if let Some(ticket) = next.ticket_mut() {
                    ticket.scheduled_for = Some(date);
                }
                None
            }
            (_, Command::Edit(patch)) => {
                if let Some((body, _)) = patch.apply(fresh.body()) {
                    next.replace_body(body);
                }
                None
            }
            // check_command only admits the pairs handled above
            (state, _) => return Err(TransitionError::InvalidTransition { action, state }),
        };

        if let Some(note) = note {
            next.set_audit_note(note);
        }
        next.bump_revision();

        let record = TransitionRecord {
            entity_id: next.id().clone(),
            revision: next.revision(),
            actor: actor.clone(),
            action,
            prior,
            next: self.eligibility.current_state(&next),
            stage,
            justification: note.map(str::to_string),
            at: TimeStamp::new(),
        };

        tracing::debug!(
            entity_id = %record.entity_id,
            actor = %actor,
            action = ?action,
            revision = record.revision,
            prior = ?record.prior,
            next = ?record.next,
            "transition applied"
        );

        Ok(Applied {
            entity: next,
            record,
        })
    }

    /// Verify that `actor` may delete the entity. Removal itself is the
    /// store's job.
    pub fn authorize_delete(
        &self,
        fresh: &WorkflowEntity,
        seen_revision: u64,
        actor: &Identity,
    ) -> Result<(), TransitionError> {
        ensure_fresh(fresh, seen_revision)?;
        self.eligibility.check(fresh, actor, Action::Delete)
    }
}

fn ensure_fresh(fresh: &WorkflowEntity, seen_revision: u64) -> Result<(), TransitionError> {
    if fresh.revision() != seen_revision {
        tracing::warn!(
            entity_id = %fresh.id(),
            seen = seen_revision,
            current = fresh.revision(),
            "rejecting transition on a stale snapshot"
        );
        return Err(TransitionError::StaleEntityState {
            entity_id: fresh.id().clone(),
            seen: seen_revision,
            current: fresh.revision(),
        });
    }
    Ok(())
}
