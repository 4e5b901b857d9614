//! End to end workflows against the sled backed service.
//!
//! Sled uses file-based locking, so every test opens its own database in a
//! temp directory, which also takes care of cleanup.

use anyhow::Context;
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};
use workflow_approval::{
    Action, AggregateStatus, Command, Criteria, Currency, CurrentState, Directory,
    DirectoryError, DirectoryProvider, Eligibility, EngineConfig, EntityId, EntityPatch,
    EntityStore, Executor, ExpenseClaim, Identity, NodeKind, OrgNode, Pipeline, Role,
    RoleAssignment, ScopeId, ServiceError, SledStore, StageStatus, Ticket, TicketState,
    TimeStamp, TransitionError, ViewMode, WorkflowEntity, WorkflowService,
    query::{CacheKey, EligibilityCache, filter_entities},
    record::TransitionRecord,
    store::{StoreQuery, WriteOutcome},
};

fn directory() -> anyhow::Result<Directory> {
    Ok(Directory::builder()
        .node(OrgNode::department("finance"))
        .node(OrgNode::department("sales"))
        .node(OrgNode::new("acme", NodeKind::Company, None))
        .node(OrgNode::new("hq", NodeKind::Building, Some("acme".into())))
        .node(OrgNode::new("hq-3f", NodeKind::Site, Some("hq".into())))
        .assign("assistant", Role::Assistant, "finance")
        .assign("boss", Role::Boss, "finance")
        .assign("boss", Role::Boss, "sales")
        .assign("accounting", Role::Accounting, "finance")
        .assign("accounting", Role::Accounting, "sales")
        .assign("admin", Role::Administrator, "acme")
        .assign("supervisor", Role::Supervisor, "hq")
        .assign("tech-1", Role::Technician, "hq-3f")
        .assign("tech-2", Role::Technician, "hq-3f")
        .build()?)
}

fn open_service(
    name: &str,
    config: EngineConfig,
) -> anyhow::Result<(TempDir, WorkflowService<Directory>)> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join(name))?);
    let service = WorkflowService::new(db, directory()?, config)?;
    Ok((temp_dir, service))
}

fn receipt(description: &str) -> ExpenseClaim {
    ExpenseClaim::new()
        .set_currency(Currency::GBP)
        .set_amount(42_00)
        .set_description(description)
        .set_spent_on(TimeStamp::new())
}

fn id(name: &str) -> Identity {
    Identity::from(name)
}

#[test]
fn boss_waits_for_the_assistant() -> anyhow::Result<()> {
    let (_dir, service) = open_service("scenario_a.db", EngineConfig::default())?;

    let claim = service.submit_claim(&id("owner"), &"finance".into(), receipt("Hotel"))?;
    assert!(claim.stages().iter().all(|s| s.status == StageStatus::Pending));
    assert_eq!(claim.stages().len(), 3);

    let boss_actions = service.available_actions(claim.id(), &id("boss"))?;
    assert!(!boss_actions.contains(&Action::Approve));

    let applied = service
        .apply(claim.id(), claim.revision(), &id("assistant"), Command::Approve, None)
        .context("assistant approval")?;
    assert_eq!(
        applied.record.next,
        CurrentState::Staged(AggregateStatus::AwaitingStage(1))
    );

    let boss_actions = service.available_actions(claim.id(), &id("boss"))?;
    assert!(boss_actions.contains(&Action::Approve));
    Ok(())
}

#[test]
fn missing_assistant_lets_the_boss_go_first() -> anyhow::Result<()> {
    let (_dir, service) = open_service("scenario_b.db", EngineConfig::default())?;

    let claim = service.submit_claim(&id("seller"), &"sales".into(), receipt("Client lunch"))?;
    assert!(service.available_actions(claim.id(), &id("boss"))?.contains(&Action::Approve));

    let applied = service.apply(claim.id(), 0, &id("boss"), Command::Approve, None)?;
    assert_eq!(
        applied.record.next,
        CurrentState::Staged(AggregateStatus::AwaitingStage(2))
    );
    let skipped = &applied.entity.stages()[0];
    assert_eq!(skipped.status, StageStatus::Approved);
    assert_eq!(skipped.resolved_by, Some(id("boss")));

    let applied = service.apply(claim.id(), 1, &id("accounting"), Command::Approve, None)?;
    assert_eq!(
        applied.record.next,
        CurrentState::Staged(AggregateStatus::FullyApproved)
    );
    Ok(())
}

#[test]
fn only_assigned_technicians_and_managers_update_tickets() -> anyhow::Result<()> {
    let (_dir, service) = open_service("scenario_c.db", EngineConfig::default())?;

    let ticket = service.open_ticket(
        &id("tenant"),
        &"hq-3f".into(),
        Ticket::new("electrical", "Flickering lights on the third floor"),
    )?;

    // a technician without the role is refused as a payload problem, not a permission one
    let err = service
        .apply(
            ticket.id(),
            0,
            &id("supervisor"),
            Command::AssignTechnicians(vec![id("tenant")]),
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err.as_transition(),
        Some(TransitionError::InvalidTransition { .. })
    ));

    let applied = service.apply(
        ticket.id(),
        0,
        &id("supervisor"),
        Command::AssignTechnicians(vec![id("tech-1")]),
        None,
    )?;
    assert_eq!(applied.record.next, CurrentState::Lifecycle(TicketState::Assigned));
    assert!(applied.entity.edit_locked());

    let applied = service.apply(
        ticket.id(),
        1,
        &id("tech-1"),
        Command::UpdateStatus(TicketState::InProgress),
        None,
    )?;
    assert_eq!(
        applied.record.next,
        CurrentState::Lifecycle(TicketState::InProgress)
    );

    for actor in ["tech-1", "supervisor", "admin"] {
        let actions = service.available_actions(ticket.id(), &id(actor))?;
        assert!(actions.contains(&Action::UpdateStatus), "{actor} should update");
    }
    assert!(service.available_actions(ticket.id(), &id("tech-2"))?.is_empty());
    assert!(service.available_actions(ticket.id(), &id("tenant"))?.is_empty());
    Ok(())
}

#[test]
fn rejection_needs_a_reason_and_ends_the_workflow() -> anyhow::Result<()> {
    let (_dir, service) = open_service("scenario_d.db", EngineConfig::default())?;
    let claim = service.submit_claim(&id("owner"), &"finance".into(), receipt("Taxi"))?;

    let err = service
        .apply(claim.id(), 0, &id("assistant"), Command::Reject, Some(""))
        .unwrap_err();
    assert_eq!(err.as_transition(), Some(&TransitionError::MissingJustification));
    assert!(err.is_business_rule());
    // nothing was written
    assert_eq!(service.get(claim.id())?.revision(), 0);

    let applied = service.apply(
        claim.id(),
        0,
        &id("assistant"),
        Command::Reject,
        Some("Missing receipt"),
    )?;
    assert!(applied.entity.edit_locked());
    assert_eq!(applied.entity.audit_note(), "Missing receipt");
    assert_eq!(
        applied.record.justification.as_deref(),
        Some("Missing receipt")
    );

    for actor in ["owner", "assistant", "boss", "accounting", "admin"] {
        assert!(
            service.available_actions(claim.id(), &id(actor))?.is_empty(),
            "{actor} should have nothing left to do"
        );
    }
    Ok(())
}

#[test]
fn cancelling_a_ticket_needs_a_reason() -> anyhow::Result<()> {
    let (_dir, service) = open_service("cancel.db", EngineConfig::default())?;
    let ticket = service.open_ticket(&id("tenant"), &"hq".into(), Ticket::new("hvac", "Too cold"))?;

    let err = service
        .apply(
            ticket.id(),
            0,
            &id("admin"),
            Command::UpdateStatus(TicketState::Cancelled),
            None,
        )
        .unwrap_err();
    assert_eq!(err.as_transition(), Some(&TransitionError::MissingJustification));

    let applied = service.apply(
        ticket.id(),
        0,
        &id("admin"),
        Command::UpdateStatus(TicketState::Cancelled),
        Some("Duplicate of an earlier request"),
    )?;
    assert!(applied.record.next.is_rejected());
    Ok(())
}

#[test]
fn second_writer_on_the_same_snapshot_is_stale() -> anyhow::Result<()> {
    let (dir, first) = open_service("concurrent.db", EngineConfig::default())?;
    let claim = first.submit_claim(&id("owner"), &"finance".into(), receipt("Train"))?;
    let seen = claim.revision();

    let outcomes: Vec<Result<_, ServiceError>> = std::thread::scope(|scope| {
        let approve =
            scope.spawn(|| first.apply(claim.id(), seen, &id("assistant"), Command::Approve, None));
        let edit = scope.spawn(|| {
            let patch = EntityPatch {
                amount: Some(10_00),
                ..EntityPatch::default()
            };
            first.apply(claim.id(), seen, &id("owner"), Command::Edit(patch), None)
        });
        vec![approve.join(), edit.join()]
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|_| Err(anyhow::anyhow!("writer panicked").into())))
            .collect()
    });

    let won: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    assert_eq!(won.len(), 1);
    let lost = outcomes.iter().find_map(|o| o.as_ref().err()).unwrap();
    assert!(matches!(
        lost.as_transition(),
        Some(TransitionError::StaleEntityState { seen: 0, current: 1, .. })
    ));

    let stored = first.get(claim.id())?;
    assert_eq!(stored.revision(), 1);
    assert_eq!(stored, won[0].entity);
    assert_eq!(first.history(claim.id())?.len(), 1);

    drop(first);
    drop(dir);
    Ok(())
}

#[test]
fn store_refuses_a_write_against_an_old_revision() -> anyhow::Result<()> {
    let (_dir, service) = open_service("store_race.db", EngineConfig::default())?;
    let claim = service.submit_claim(&id("owner"), &"finance".into(), receipt("Parking"))?;
    let applied = service.apply(claim.id(), 0, &id("assistant"), Command::Approve, None)?;

    // replay the same write as if the first had not happened yet
    let outcome = service
        .store()
        .update(0, &applied.entity, &applied.record)?;
    assert_eq!(
        outcome,
        WriteOutcome::Conflict {
            current_revision: Some(1)
        }
    );
    Ok(())
}

#[test]
fn derived_status_survives_a_store_round_trip() -> anyhow::Result<()> {
    let (_dir, service) = open_service("round_trip.db", EngineConfig::default())?;
    let snapshot = directory()?;
    let eligibility = Eligibility::new(&service.config().expense, &snapshot);

    let claim = service.submit_claim(&id("owner"), &"sales".into(), receipt("Flights"))?;
    let applied = service.apply(claim.id(), 0, &id("boss"), Command::Approve, None)?;
    let before = eligibility.current_state(&applied.entity);

    let stored = service.get(claim.id())?;
    assert_eq!(stored, applied.entity);
    assert_eq!(eligibility.current_state(&stored), before);
    Ok(())
}

#[test]
fn owner_deletes_an_untouched_claim() -> anyhow::Result<()> {
    let (_dir, service) = open_service("delete.db", EngineConfig::default())?;
    let claim = service.submit_claim(&id("owner"), &"finance".into(), receipt("Snacks"))?;

    let err = service.delete(claim.id(), 0, &id("boss")).unwrap_err();
    assert!(matches!(
        err.as_transition(),
        Some(TransitionError::IneligibleAction { .. })
    ));

    let record = service.delete(claim.id(), 0, &id("owner"))?;
    assert_eq!(record.action, Action::Delete);
    assert!(matches!(service.get(claim.id()), Err(ServiceError::NotFound(_))));

    let history = service.history(claim.id())?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].actor, id("owner"));
    Ok(())
}

#[test]
fn history_lists_transitions_in_order() -> anyhow::Result<()> {
    let (_dir, service) = open_service("history.db", EngineConfig::default())?;
    let claim = service.submit_claim(&id("owner"), &"finance".into(), receipt("Books"))?;

    service.apply(claim.id(), 0, &id("assistant"), Command::Approve, None)?;
    service.apply(claim.id(), 1, &id("boss"), Command::Approve, None)?;
    service.apply(claim.id(), 2, &id("accounting"), Command::Approve, None)?;

    let history = service.history(claim.id())?;
    let revisions: Vec<u64> = history.iter().map(|r| r.revision).collect();
    assert_eq!(revisions, vec![1, 2, 3]);
    let stages: Vec<&str> = history.iter().filter_map(|r| r.stage.as_deref()).collect();
    assert_eq!(stages, vec!["Assistant", "Boss", "Accounting"]);

    let (first_digest, _) = history[0].build()?;
    let (again, _) = service.history(claim.id())?[0].build()?;
    assert_eq!(first_digest, again);
    Ok(())
}

#[test]
fn unknown_scope_is_refused() -> anyhow::Result<()> {
    let (_dir, service) = open_service("unknown_scope.db", EngineConfig::default())?;
    let err = service
        .submit_claim(&id("owner"), &"atlantis".into(), receipt("Submarine"))
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnknownScope(_)));
    Ok(())
}

struct Offline;

impl DirectoryProvider for Offline {
    fn get_roles(&self, identity: &Identity) -> Result<Vec<RoleAssignment>, DirectoryError> {
        Err(DirectoryError::lookup(identity, "timed out"))
    }
    fn get_org_node(&self, scope: &ScopeId) -> Result<Option<OrgNode>, DirectoryError> {
        Err(DirectoryError::lookup(scope, "timed out"))
    }
    fn get_scope_assignments(
        &self,
        scope: &ScopeId,
    ) -> Result<Vec<RoleAssignment>, DirectoryError> {
        Err(DirectoryError::lookup(scope, "timed out"))
    }
}

#[test]
fn directory_outage_is_an_infrastructure_error() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("offline.db"))?);
    let service = WorkflowService::new(db, Offline, EngineConfig::default())?;

    let err = service
        .submit_claim(&id("owner"), &"finance".into(), receipt("Coffee"))
        .unwrap_err();
    assert!(matches!(err, ServiceError::Directory(_)));
    assert!(!err.is_business_rule());
    Ok(())
}

#[test]
fn listing_pages_and_reuses_the_eligibility_map() -> anyhow::Result<()> {
    let config = EngineConfig {
        expense: Pipeline::standard(),
        page_size: 2,
    };
    let (_dir, service) = open_service("listing.db", config)?;
    for n in 0..5 {
        service.submit_claim(&id("owner"), &"finance".into(), receipt(&format!("Trip {n}")))?;
    }

    let actionable = Criteria::new().set_view_mode(ViewMode::Actionable);
    let listing = service.list(&id("assistant"), &actionable)?;
    assert_eq!(listing.len(), 5);
    assert_eq!(listing.page_count(), 3);
    assert_eq!(listing.page(2).len(), 1);
    assert!(listing.iter().all(|entity| listing.is_actionable(entity.id())));

    let again = service.list(&id("assistant"), &Criteria::new().set_free_text("trip 3"))?;
    assert_eq!(again.len(), 1);
    assert_eq!(service.cache_builds(), 1);

    let first = listing.page(0)[0].clone();
    service.apply(first.id(), 0, &id("assistant"), Command::Approve, None)?;
    let after = service.list(&id("assistant"), &actionable)?;
    assert_eq!(after.len(), 4);
    assert_eq!(service.cache_builds(), 2);

    service.invalidate_cache();
    service.list(&id("assistant"), &actionable)?;
    assert_eq!(service.cache_builds(), 3);
    Ok(())
}

/// Sled store that commits one queued transition right after a listing read
/// its rows, as a concurrent writer would.
struct InterleavedStore {
    inner: SledStore,
    queued: Mutex<Option<(u64, WorkflowEntity, TransitionRecord)>>,
}

impl EntityStore for InterleavedStore {
    fn create(&self, entity: &WorkflowEntity) -> anyhow::Result<WorkflowEntity> {
        self.inner.create(entity)
    }

    fn get(&self, id: &EntityId) -> anyhow::Result<Option<WorkflowEntity>> {
        self.inner.get(id)
    }

    fn list(&self, query: &StoreQuery) -> anyhow::Result<Vec<WorkflowEntity>> {
        let rows = self.inner.list(query)?;
        let queued = self.queued.lock().unwrap().take();
        if let Some((expected, entity, record)) = queued {
            self.inner.update(expected, &entity, &record)?;
        }
        Ok(rows)
    }

    fn update(
        &self,
        expected_revision: u64,
        entity: &WorkflowEntity,
        record: &TransitionRecord,
    ) -> anyhow::Result<WriteOutcome> {
        self.inner.update(expected_revision, entity, record)
    }

    fn remove(
        &self,
        id: &EntityId,
        expected_revision: u64,
        record: &TransitionRecord,
    ) -> anyhow::Result<WriteOutcome> {
        self.inner.remove(id, expected_revision, record)
    }

    fn history(&self, id: &EntityId) -> anyhow::Result<Vec<TransitionRecord>> {
        self.inner.history(id)
    }

    fn version(&self) -> u64 {
        self.inner.version()
    }
}

#[test]
fn write_during_a_listing_does_not_poison_the_cache() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("interleaved.db"))?);
    let store = InterleavedStore {
        inner: SledStore::new(db)?,
        queued: Mutex::new(None),
    };
    let service = WorkflowService::with_store(store, directory()?, EngineConfig::default());
    let claim = service.submit_claim(&id("owner"), &"finance".into(), receipt("Parking"))?;

    let pipeline = Pipeline::standard();
    let snapshot = directory()?;
    let applied = Executor::new(Eligibility::new(&pipeline, &snapshot)).apply_action(
        &claim,
        claim.revision(),
        &id("assistant"),
        Command::Approve,
        None,
    )?;
    *service.store().queued.lock().unwrap() =
        Some((claim.revision(), applied.entity, applied.record));

    let actionable = Criteria::new().set_view_mode(ViewMode::Actionable);
    // rows read before the approval landed
    let racing = service.list(&id("assistant"), &actionable)?;
    assert_eq!(racing.len(), 1);
    assert!(service.available_actions(claim.id(), &id("assistant"))?.is_empty());

    let quiet = service.list(&id("assistant"), &actionable)?;
    assert!(quiet.is_empty());
    assert_eq!(service.cache_builds(), 2);
    assert_eq!(service.cached_maps(), 1);
    Ok(())
}

#[test]
fn long_running_service_keeps_one_map_per_actor() -> anyhow::Result<()> {
    let (_dir, service) = open_service("cache_growth.db", EngineConfig::default())?;
    let everything = Criteria::new();

    for n in 0..50 {
        service.submit_claim(&id("owner"), &"finance".into(), receipt(&format!("Cab {n}")))?;
        service.list(&id("assistant"), &everything)?;
        assert_eq!(service.cached_maps(), 1);
    }
    assert_eq!(service.cache_builds(), 50);

    service.list(&id("boss"), &everything)?;
    service.list(&id("accounting"), &everything)?;
    assert_eq!(service.cached_maps(), 3);

    service.submit_claim(&id("owner"), &"sales".into(), receipt("Late cab"))?;
    service.list(&id("boss"), &everything)?;
    assert_eq!(service.cached_maps(), 1);
    Ok(())
}

#[test]
fn store_query_narrows_by_owner_and_scope() -> anyhow::Result<()> {
    let (_dir, service) = open_service("store_query.db", EngineConfig::default())?;
    service.submit_claim(&id("ann"), &"finance".into(), receipt("A"))?;
    service.submit_claim(&id("bob"), &"finance".into(), receipt("B"))?;
    service.submit_claim(&id("ann"), &"sales".into(), receipt("C"))?;

    let query = StoreQuery {
        owner: Some(id("ann")),
        scope: Some("finance".into()),
        ..StoreQuery::default()
    };
    let found = service.store().list(&query)?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].description(), "A");
    Ok(())
}

#[test]
fn filtering_ten_thousand_entities_evaluates_once() -> anyhow::Result<()> {
    let pipeline = Pipeline::standard();
    let snapshot = directory()?;
    let eligibility = Eligibility::new(&pipeline, &snapshot);

    let collection: Vec<WorkflowEntity> = (0..10_000)
        .map(|n| {
            let scope = if n % 2 == 0 { "finance" } else { "sales" };
            WorkflowEntity::expense(
                format!("claim_{n:05}").as_str().into(),
                id("owner"),
                scope.into(),
                receipt(&format!("Expense {n}")),
                &pipeline,
            )
        })
        .collect::<Result<_, _>>()?;

    let mut cache = EligibilityCache::new();
    let key = CacheKey {
        collection_version: 1,
        actor: id("boss"),
        directory_version: snapshot.version(),
    };
    let map = cache.map_for(key.clone(), &collection, &eligibility);
    let view = filter_entities(
        &collection,
        &Criteria::new().set_view_mode(ViewMode::Actionable),
        &eligibility,
        &map,
        50,
    );

    // boss acts first only where there is no assistant
    assert_eq!(view.len(), 5_000);
    let mut seen = 0;
    for page in 0..view.page_count() {
        let map_again = cache.map_for(key.clone(), &collection, &eligibility);
        assert!(Arc::ptr_eq(&map, &map_again));
        seen += view.page(&collection, page).len();
    }

    assert_eq!(seen, 5_000);
    assert_eq!(cache.builds(), 1);
    assert_eq!(map.evaluations(), 10_000);
    assert_eq!(view.scanned(), 10_000);
    Ok(())
}
