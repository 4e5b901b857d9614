//! Service ticket lifecycle
use crate::types::{Identity, TimeStamp};
use chrono::Utc;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum TicketState {
    #[n(0)]
    Open,
    /// Technicians are assigned but work has not started. The only state in
    /// which the assignment may be changed.
    #[n(1)]
    Assigned,
    #[n(2)]
    InProgress,
    #[n(3)]
    OnHold,
    #[n(4)]
    Completed,
    #[n(5)]
    Cancelled,
}

impl TicketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketState::Completed | TicketState::Cancelled)
    }

    /// Targets reachable through a status update. Assignment (Open -> Assigned)
    /// is its own action and not listed here.
    pub fn next_states(&self) -> &'static [TicketState] {
        use TicketState::*;
        match self {
            Open => &[Cancelled],
            Assigned => &[InProgress, Cancelled],
            InProgress => &[OnHold, Completed, Cancelled],
            OnHold => &[InProgress, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_move_to(&self, next: TicketState) -> bool {
        self.next_states().contains(&next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Ticket {
    #[n(0)]
    pub ticket_type: String,
    #[n(1)]
    pub description: String,
    #[n(2)]
    pub state: TicketState,
    // kept sorted and free of duplicates
    #[n(3)]
    pub technicians: Vec<Identity>,
    #[n(4)]
    pub scheduled_for: Option<TimeStamp<Utc>>,
}

impl Ticket {
    pub fn new(ticket_type: &str, description: &str) -> Self {
        Self {
            ticket_type: ticket_type.to_string(),
            description: description.to_string(),
            state: TicketState::Open,
            technicians: vec![],
            scheduled_for: None,
        }
    }

    pub fn is_assigned(&self, identity: &Identity) -> bool {
        self.technicians.binary_search(identity).is_ok()
    }

    pub(crate) fn set_technicians(&mut self, mut technicians: Vec<Identity>) {
        technicians.sort();
        technicians.dedup();
        self.technicians = technicians;
    }
}

/// Sorted, deduplicated copy, the form technicians are stored in.
pub fn normalize_technicians(technicians: &[Identity]) -> Vec<Identity> {
    let mut normalized = technicians.to_vec();
    normalized.sort();
    normalized.dedup();
    normalized
}
