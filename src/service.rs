//! Service layer API for workflow operations
//!
//! Ties the engine to its two collaborators: a [`DirectoryProvider`] for roles
//! and hierarchy, and an [`EntityStore`] for persistence. Every mutation reads
//! the freshest snapshot, resolves a directory snapshot for the actor, runs
//! the executor and writes back conditionally on the revision it read.
use crate::config::EngineConfig;
use crate::directory::{Directory, DirectoryProvider};
use crate::eligibility::{Action, Command, Eligibility};
use crate::entity::{EntityKind, ExpenseClaim, WorkflowEntity};
use crate::error::{ServiceError, TransitionError};
use crate::executor::{Applied, Executor};
use crate::query::{
    CacheKey, Criteria, EligibilityCache, EligibilityMap, FilteredView, filter_entities,
};
use crate::record::TransitionRecord;
use crate::store::{EntityStore, SledStore, StoreQuery, WriteOutcome};
use crate::ticket::Ticket;
use crate::types::{EntityId, Identity, ScopeId, TimeStamp};
use crate::utils;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

pub struct WorkflowService<P, S = SledStore> {
    store: S,
    directory: P,
    config: EngineConfig,
    cache: Mutex<EligibilityCache>,
}

impl<P: DirectoryProvider> WorkflowService<P, SledStore> {
    pub fn new(
        instance: Arc<sled::Db>,
        directory: P,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self::with_store(SledStore::new(instance)?, directory, config))
    }
}

impl<P: DirectoryProvider, S: EntityStore> WorkflowService<P, S> {
    pub fn with_store(store: S, directory: P, config: EngineConfig) -> Self {
        Self {
            store,
            directory,
            config,
            cache: Mutex::new(EligibilityCache::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Submit a new expense claim. It starts Pending at every stage of the
    /// configured pipeline.
    pub fn submit_claim(
        &self,
        owner: &Identity,
        scope: &ScopeId,
        claim: ExpenseClaim,
    ) -> Result<WorkflowEntity, ServiceError> {
        self.ensure_scope(scope)?;
        let id = utils::new_entity_id(EntityKind::Expense)?;
        let entity =
            WorkflowEntity::expense(id, owner.clone(), scope.clone(), claim, &self.config.expense)?;
        Ok(self.store.create(&entity)?)
    }

    /// Open a new service ticket, unassigned.
    pub fn open_ticket(
        &self,
        owner: &Identity,
        scope: &ScopeId,
        ticket: Ticket,
    ) -> Result<WorkflowEntity, ServiceError> {
        self.ensure_scope(scope)?;
        let id = utils::new_entity_id(EntityKind::Ticket)?;
        let entity = WorkflowEntity::ticket(id, owner.clone(), scope.clone(), ticket)?;
        Ok(self.store.create(&entity)?)
    }

    pub fn get(&self, id: &EntityId) -> Result<WorkflowEntity, ServiceError> {
        self.store
            .get(id)?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }

    pub fn available_actions(
        &self,
        id: &EntityId,
        actor: &Identity,
    ) -> Result<BTreeSet<Action>, ServiceError> {
        let entity = self.get(id)?;
        let directory = self.snapshot(actor, [entity.scope()])?;
        Ok(Eligibility::new(&self.config.expense, &directory).available_actions(&entity, actor))
    }

    /// Apply `command` on behalf of `actor`, who last saw the entity at
    /// `seen_revision`. The returned entity is the stored snapshot.
    pub fn apply(
        &self,
        id: &EntityId,
        seen_revision: u64,
        actor: &Identity,
        command: Command,
        justification: Option<&str>,
    ) -> Result<Applied, ServiceError> {
        let fresh = self.get(id)?;
        let directory = self.snapshot(actor, [fresh.scope()])?;
        let executor = Executor::new(Eligibility::new(&self.config.expense, &directory));
        let applied =
            executor.apply_action(&fresh, seen_revision, actor, command, justification)?;

        match self
            .store
            .update(fresh.revision(), &applied.entity, &applied.record)?
        {
            WriteOutcome::Stored(entity) => {
                tracing::info!(
                    entity_id = %entity.id(),
                    actor = %actor,
                    action = ?applied.record.action,
                    revision = entity.revision(),
                    "transition completed"
                );
                Ok(Applied {
                    entity,
                    record: applied.record,
                })
            }
            WriteOutcome::Conflict { current_revision } => {
                Err(self.lost_race(id, seen_revision, current_revision))
            }
            WriteOutcome::Removed => Err(anyhow::anyhow!("update of {id} removed it").into()),
        }
    }

    /// Delete an entity. Only its owner may, and only before it is locked.
    pub fn delete(
        &self,
        id: &EntityId,
        seen_revision: u64,
        actor: &Identity,
    ) -> Result<TransitionRecord, ServiceError> {
        let fresh = self.get(id)?;
        let directory = self.snapshot(actor, [fresh.scope()])?;
        let eligibility = Eligibility::new(&self.config.expense, &directory);
        Executor::new(eligibility).authorize_delete(&fresh, seen_revision, actor)?;

        let state = eligibility.current_state(&fresh);
        let record = TransitionRecord {
            entity_id: id.clone(),
            revision: fresh.revision() + 1,
            actor: actor.clone(),
            action: Action::Delete,
            prior: state,
            next: state,
            stage: None,
            justification: None,
            at: TimeStamp::new(),
        };

        match self.store.remove(id, fresh.revision(), &record)? {
            WriteOutcome::Removed => {
                tracing::info!(entity_id = %id, actor = %actor, "entity deleted");
                Ok(record)
            }
            WriteOutcome::Conflict { current_revision } => {
                Err(self.lost_race(id, seen_revision, current_revision))
            }
            WriteOutcome::Stored(_) => Err(anyhow::anyhow!("removal of {id} stored it").into()),
        }
    }

    /// Applied transitions of an entity, oldest first. Survives deletion.
    pub fn history(&self, id: &EntityId) -> Result<Vec<TransitionRecord>, ServiceError> {
        Ok(self.store.history(id)?)
    }

    /// Everything `actor` can see that matches `criteria`, paged by the
    /// configured page size.
    pub fn list(&self, actor: &Identity, criteria: &Criteria) -> Result<Listing, ServiceError> {
        // version first: a write landing in between then only costs a rebuild
        let collection_version = self.store.version();
        let entities = self.store.list(&StoreQuery::default())?;
        let directory = self.snapshot(actor, entities.iter().map(WorkflowEntity::scope))?;
        let eligibility = Eligibility::new(&self.config.expense, &directory);

        let key = CacheKey {
            collection_version,
            actor: actor.clone(),
            directory_version: directory.version(),
        };
        let map = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_for(key, &entities, &eligibility);
        let view = filter_entities(
            &entities,
            criteria,
            &eligibility,
            &map,
            self.config.page_size,
        );

        Ok(Listing {
            entities,
            view,
            map,
        })
    }

    /// Drop every cached eligibility map. Needed when the directory changed
    /// without its version moving.
    pub fn invalidate_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate();
    }

    pub fn cache_builds(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .builds()
    }

    /// Eligibility maps currently held by the cache.
    pub fn cached_maps(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn ensure_scope(&self, scope: &ScopeId) -> Result<(), ServiceError> {
        match self.directory.get_org_node(scope)? {
            Some(_) => Ok(()),
            None => Err(ServiceError::UnknownScope(scope.clone())),
        }
    }

    fn snapshot<'a>(
        &self,
        actor: &Identity,
        scopes: impl IntoIterator<Item = &'a ScopeId>,
    ) -> Result<Directory, ServiceError> {
        Ok(Directory::resolve(&self.directory, actor, scopes)?)
    }

    fn lost_race(
        &self,
        id: &EntityId,
        seen_revision: u64,
        current_revision: Option<u64>,
    ) -> ServiceError {
        match current_revision {
            Some(current) => TransitionError::StaleEntityState {
                entity_id: id.clone(),
                seen: seen_revision,
                current,
            }
            .into(),
            None => ServiceError::NotFound(id.clone()),
        }
    }
}

/// Result of [`WorkflowService::list`]. Owns the collection it was filtered
/// from, so pages can be requested without touching the store again.
#[derive(Debug, Clone)]
pub struct Listing {
    entities: Vec<WorkflowEntity>,
    view: FilteredView,
    map: Arc<EligibilityMap>,
}

impl Listing {
    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.view.page_count()
    }

    pub fn page(&self, n: usize) -> Vec<&WorkflowEntity> {
        self.view.page(&self.entities, n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowEntity> {
        self.view.iter(&self.entities)
    }

    pub fn view(&self) -> &FilteredView {
        &self.view
    }

    /// Whether the listing actor had a workflow action on `id` when the
    /// listing was built. Drives per-row controls.
    pub fn is_actionable(&self, id: &EntityId) -> bool {
        self.map.is_actionable(id)
    }
}
