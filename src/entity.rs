//! Workflow entities: expense claims and service tickets
use crate::error::DraftError;
use crate::stage::{Pipeline, Stage};
use crate::status::AggregateStatus;
use crate::ticket::{Ticket, TicketState};
use crate::types::{EntityId, Identity, ScopeId, TimeStamp};
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Currency {
    #[n(0)]
    USD,
    #[n(1)]
    GBP,
    #[n(2)]
    EUR,
}

// Also used as the draft while the owner fills it in
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Eq, PartialEq)]
pub struct ExpenseClaim {
    #[n(0)]
    currency: Option<Currency>,
    #[n(1)]
    amount: u64, // minor units
    #[n(2)]
    description: String,
    #[n(3)]
    spent_on: Option<TimeStamp<Utc>>,
}

impl ExpenseClaim {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }
    pub fn set_amount(mut self, amount: u64) -> Self {
        self.amount = amount;
        self
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
    pub fn set_spent_on(mut self, date: TimeStamp<Utc>) -> Self {
        self.spent_on = Some(date);
        self
    }
    pub fn currency(&self) -> Option<Currency> {
        self.currency
    }
    pub fn amount(&self) -> u64 {
        self.amount
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn spent_on(&self) -> Option<&TimeStamp<Utc>> {
        self.spent_on.as_ref()
    }

    pub fn validate(&self) -> Result<(), DraftError> {
        if self.currency.is_none() {
            return Err(DraftError::MissingField("currency"));
        }
        if self.amount == 0 {
            return Err(DraftError::ZeroAmount);
        }
        if self.description.trim().is_empty() {
            return Err(DraftError::MissingField("description"));
        }
        if self.spent_on.is_none() {
            return Err(DraftError::MissingField("spent_on"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EntityBody {
    #[n(0)]
    Expense(#[n(0)] ExpenseClaim),
    #[n(1)]
    Ticket(#[n(0)] Ticket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Expense,
    Ticket,
}

impl EntityKind {
    pub fn id_prefix(&self) -> &'static str {
        match self {
            EntityKind::Expense => "claim_",
            EntityKind::Ticket => "ticket_",
        }
    }
}

/// What the eligibility table is keyed on: the derived aggregate status for
/// staged approvals, the lifecycle state for tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum CurrentState {
    #[n(0)]
    Staged(#[n(0)] AggregateStatus),
    #[n(1)]
    Lifecycle(#[n(0)] TicketState),
}

impl CurrentState {
    pub fn is_terminal(&self) -> bool {
        match self {
            CurrentState::Staged(status) => status.is_terminal(),
            CurrentState::Lifecycle(state) => state.is_terminal(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            CurrentState::Staged(AggregateStatus::Rejected)
                | CurrentState::Lifecycle(TicketState::Cancelled)
        )
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            CurrentState::Staged(AggregateStatus::FullyApproved)
                | CurrentState::Lifecycle(TicketState::Completed)
        )
    }
}

/// Owner edits to domain fields. Scope and owner are not editable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPatch {
    pub description: Option<String>,
    pub amount: Option<u64>,
    pub currency: Option<Currency>,
    pub spent_on: Option<TimeStamp<Utc>>,
    pub ticket_type: Option<String>,
}

impl EntityPatch {
    /// Apply onto `body`, returning whether anything changed. `None` when the
    /// patch carries fields that do not exist on this kind of entity or would
    /// leave it invalid.
    pub(crate) fn apply(&self, body: &EntityBody) -> Option<(EntityBody, bool)> {
        let mut next = body.clone();
        match &mut next {
            EntityBody::Expense(claim) => {
                if self.ticket_type.is_some() {
                    return None;
                }
                if let Some(description) = &self.description {
                    claim.description = description.clone();
                }
                if let Some(amount) = self.amount {
                    claim.amount = amount;
                }
                if let Some(currency) = self.currency {
                    claim.currency = Some(currency);
                }
                if let Some(date) = &self.spent_on {
                    claim.spent_on = Some(date.clone());
                }
                claim.validate().ok()?;
            }
            EntityBody::Ticket(ticket) => {
                if self.amount.is_some() || self.currency.is_some() || self.spent_on.is_some() {
                    return None;
                }
                if let Some(description) = &self.description {
                    ticket.description = description.clone();
                }
                if let Some(ticket_type) = &self.ticket_type {
                    ticket.ticket_type = ticket_type.clone();
                }
                if ticket.description.trim().is_empty() {
                    return None;
                }
            }
        }
        let changed = next != *body;
        Some((next, changed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct WorkflowEntity {
    #[n(0)]
    id: EntityId,
    #[n(1)]
    scope: ScopeId,
    #[n(2)]
    owner: Identity,
    #[n(3)]
    stages: Vec<Stage>,
    #[n(4)]
    edit_locked: bool,
    #[n(5)]
    audit_note: String,
    #[n(6)]
    created_at: TimeStamp<Utc>,
    #[n(7)]
    revision: u64,
    #[n(8)]
    body: EntityBody,
}

impl WorkflowEntity {
    /// A new claim, Pending at every stage of `pipeline`.
    pub fn expense(
        id: EntityId,
        owner: Identity,
        scope: ScopeId,
        claim: ExpenseClaim,
        pipeline: &Pipeline,
    ) -> Result<Self, DraftError> {
        claim.validate()?;
        Ok(Self {
            id,
            scope,
            owner,
            stages: pipeline.initial_stages(),
            edit_locked: false,
            audit_note: String::new(),
            created_at: TimeStamp::new(),
            revision: 0,
            body: EntityBody::Expense(claim),
        })
    }

    /// A new ticket in [`TicketState::Open`].
    pub fn ticket(
        id: EntityId,
        owner: Identity,
        scope: ScopeId,
        ticket: Ticket,
    ) -> Result<Self, DraftError> {
        if ticket.description.trim().is_empty() {
            return Err(DraftError::MissingField("description"));
        }
        if ticket.state != TicketState::Open || !ticket.technicians.is_empty() {
            return Err(DraftError::NotFresh);
        }
        Ok(Self {
            id,
            scope,
            owner,
            stages: vec![],
            edit_locked: false,
            audit_note: String::new(),
            created_at: TimeStamp::new(),
            revision: 0,
            body: EntityBody::Ticket(ticket),
        })
    }

    /// Backdate creation. Used when importing entities from another system.
    pub fn with_created_at(mut self, created_at: TimeStamp<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }
    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }
    pub fn owner(&self) -> &Identity {
        &self.owner
    }
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
    pub fn edit_locked(&self) -> bool {
        self.edit_locked
    }
    pub fn audit_note(&self) -> &str {
        &self.audit_note
    }
    pub fn created_at(&self) -> &TimeStamp<Utc> {
        &self.created_at
    }
    pub fn revision(&self) -> u64 {
        self.revision
    }
    pub fn body(&self) -> &EntityBody {
        &self.body
    }

    pub fn kind(&self) -> EntityKind {
        match self.body {
            EntityBody::Expense(_) => EntityKind::Expense,
            EntityBody::Ticket(_) => EntityKind::Ticket,
        }
    }

    pub fn ticket_body(&self) -> Option<&Ticket> {
        match &self.body {
            EntityBody::Ticket(ticket) => Some(ticket),
            EntityBody::Expense(_) => None,
        }
    }

    pub fn expense_body(&self) -> Option<&ExpenseClaim> {
        match &self.body {
            EntityBody::Expense(claim) => Some(claim),
            EntityBody::Ticket(_) => None,
        }
    }

    pub fn description(&self) -> &str {
        match &self.body {
            EntityBody::Expense(claim) => &claim.description,
            EntityBody::Ticket(ticket) => &ticket.description,
        }
    }

    /// Case-insensitive match of an already lowercased needle against id,
    /// owner, audit note and description.
    pub fn matches_text(&self, needle: &str) -> bool {
        [
            self.id.as_str(),
            self.owner.as_str(),
            self.audit_note.as_str(),
            self.description(),
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(needle))
    }

    pub(crate) fn stages_mut(&mut self) -> &mut Vec<Stage> {
        &mut self.stages
    }

    pub(crate) fn ticket_mut(&mut self) -> Option<&mut Ticket> {
        match &mut self.body {
            EntityBody::Ticket(ticket) => Some(ticket),
            EntityBody::Expense(_) => None,
        }
    }

    pub(crate) fn replace_body(&mut self, body: EntityBody) {
        self.body = body;
    }

    pub(crate) fn lock(&mut self) {
        self.edit_locked = true;
    }

    pub(crate) fn set_audit_note(&mut self, note: &str) {
        self.audit_note = note.to_string();
    }

    pub(crate) fn bump_revision(&mut self) {
        self.revision += 1;
    }
}
