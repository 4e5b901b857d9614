//! Walks one expense claim and one service ticket through their workflows
//! against a throwaway sled database.
//!
//! `WORKFLOW_LOG=debug cargo run --example walkthrough`

use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use workflow_approval::{
    Command, Criteria, Currency, Directory, EngineConfig, ExpenseClaim, NodeKind, OrgNode, Role,
    Ticket, TicketState, TimeStamp, ViewMode, WorkflowService,
};

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("WORKFLOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "workflow_approval=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let directory = Directory::builder()
        .version(1)
        .node(OrgNode::department("finance"))
        .node(OrgNode::department("sales"))
        .node(OrgNode::new("acme", NodeKind::Company, None))
        .node(OrgNode::new("hq", NodeKind::Building, Some("acme".into())))
        .node(OrgNode::new("hq-3f", NodeKind::Site, Some("hq".into())))
        .assign("assistant@acme", Role::Assistant, "finance")
        .assign("boss@acme", Role::Boss, "finance")
        .assign("boss@acme", Role::Boss, "sales")
        .assign("accounting@acme", Role::Accounting, "finance")
        .assign("accounting@acme", Role::Accounting, "sales")
        .assign("supervisor@acme", Role::Supervisor, "hq")
        .assign("tech@acme", Role::Technician, "hq-3f")
        .build()?;

    let temp_dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("walkthrough.db"))?);
    let service = WorkflowService::new(db, directory, EngineConfig::default())?;

    // expense claim in a department without an assistant: Boss goes first
    let claim = ExpenseClaim::new()
        .set_currency(Currency::GBP)
        .set_amount(240_00)
        .set_description("Client dinner")
        .set_spent_on(TimeStamp::new());
    let claim = service.submit_claim(&"seller@acme".into(), &"sales".into(), claim)?;
    println!("submitted {} in {}", claim.id(), claim.scope());

    let boss = "boss@acme".into();
    println!(
        "boss may {:?}",
        service.available_actions(claim.id(), &boss)?
    );
    let applied = service.apply(claim.id(), claim.revision(), &boss, Command::Approve, None)?;
    println!("after boss: {:?}", applied.record.next);

    let applied = service.apply(
        claim.id(),
        applied.entity.revision(),
        &"accounting@acme".into(),
        Command::Approve,
        None,
    )?;
    println!("after accounting: {:?}", applied.record.next);

    // service ticket on a site, supervised from the building
    let ticket = service.open_ticket(
        &"seller@acme".into(),
        &"hq-3f".into(),
        Ticket::new("plumbing", "Leaking tap in the kitchen"),
    )?;
    let supervisor = "supervisor@acme".into();
    let tech = "tech@acme".into();

    let applied = service.apply(
        ticket.id(),
        ticket.revision(),
        &supervisor,
        Command::AssignTechnicians(vec!["tech@acme".into()]),
        None,
    )?;
    let applied = service.apply(
        ticket.id(),
        applied.entity.revision(),
        &tech,
        Command::UpdateStatus(TicketState::InProgress),
        None,
    )?;
    let applied = service.apply(
        ticket.id(),
        applied.entity.revision(),
        &tech,
        Command::UpdateStatus(TicketState::Completed),
        None,
    )?;
    println!("ticket is now {:?}", applied.record.next);

    for record in service.history(ticket.id())? {
        let (digest, _) = record.build()?;
        println!(
            "  r{} {} {:?} {:?} -> {:?} [{}]",
            record.revision, record.actor, record.action, record.prior, record.next, &digest[..12]
        );
    }

    let resolved = service.list(&boss, &Criteria::new().set_view_mode(ViewMode::Resolved))?;
    println!("{} resolved entities", resolved.len());
    for entity in resolved.page(0) {
        println!("  {} {}", entity.id(), entity.description());
    }

    Ok(())
}
