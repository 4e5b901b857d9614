//! Entity store
//!
//! [`EntityStore`] is the seam to whatever persists entities. [`SledStore`] is
//! the embedded implementation: entities and their transition history live in
//! two sled trees, encoded as CBOR.
//!
//! Writes are conditional on the revision the writer read. A write whose
//! expected revision no longer matches comes back as
//! [`WriteOutcome::Conflict`]; nothing is overwritten.
use crate::entity::{EntityKind, WorkflowEntity};
use crate::record::TransitionRecord;
use crate::types::{EntityId, Identity, ScopeId};
use anyhow::Context;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, Transactional, TransactionalTree,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Coarse server-side selection. Fine-grained filtering happens in
/// [`crate::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreQuery {
    pub kind: Option<EntityKind>,
    pub scope: Option<ScopeId>,
    pub owner: Option<Identity>,
}

impl StoreQuery {
    pub fn matches(&self, entity: &WorkflowEntity) -> bool {
        self.kind.is_none_or(|kind| entity.kind() == kind)
            && self.scope.as_ref().is_none_or(|scope| entity.scope() == scope)
            && self.owner.as_ref().is_none_or(|owner| entity.owner() == owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The stored value, which is the new authoritative snapshot.
    Stored(WorkflowEntity),
    Removed,
    /// Somebody else wrote first. `None` when the entity no longer exists.
    Conflict { current_revision: Option<u64> },
}

pub trait EntityStore {
    /// Fails if an entity with the same id already exists.
    fn create(&self, entity: &WorkflowEntity) -> anyhow::Result<WorkflowEntity>;

    fn get(&self, id: &EntityId) -> anyhow::Result<Option<WorkflowEntity>>;

    /// Matching entities ordered by creation time.
    fn list(&self, query: &StoreQuery) -> anyhow::Result<Vec<WorkflowEntity>>;

    /// Replace the entity if the stored revision is still `expected_revision`,
    /// appending `record` to its history in the same write.
    fn update(
        &self,
        expected_revision: u64,
        entity: &WorkflowEntity,
        record: &TransitionRecord,
    ) -> anyhow::Result<WriteOutcome>;

    /// Remove the entity if the stored revision is still `expected_revision`.
    /// The history is kept, with `record` appended.
    fn remove(
        &self,
        id: &EntityId,
        expected_revision: u64,
        record: &TransitionRecord,
    ) -> anyhow::Result<WriteOutcome>;

    fn history(&self, id: &EntityId) -> anyhow::Result<Vec<TransitionRecord>>;

    /// Changes on every successful write. Used as the collection version in
    /// eligibility cache keys.
    fn version(&self) -> u64;
}

#[derive(Debug)]
enum WriteAbort {
    Conflict(Option<u64>),
    Corrupt(String),
}

#[derive(Clone)]
pub struct SledStore {
    entities: sled::Tree,
    history: sled::Tree,
    version: Arc<AtomicU64>,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Ok(Self {
            entities: instance.open_tree("entities")?,
            history: instance.open_tree("history")?,
            version: Arc::new(AtomicU64::new(0)),
        })
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Run a conditional write against the stored entity `id`. `write` receives
    /// both trees once the revision check has passed. Returns the conflict, if
    /// there was one.
    fn conditional<F>(
        &self,
        id: &EntityId,
        expected_revision: u64,
        write: F,
    ) -> anyhow::Result<Option<WriteOutcome>>
    where
        F: Fn(
            &TransactionalTree,
            &TransactionalTree,
        ) -> Result<(), ConflictableTransactionError<WriteAbort>>,
    {
        let result = (&self.entities, &self.history).transaction(|(entities, history)| {
            let Some(current) = entities.get(id.as_str().as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(WriteAbort::Conflict(None)));
            };
            let stored: WorkflowEntity = minicbor::decode(&current).map_err(|err| {
                ConflictableTransactionError::Abort(WriteAbort::Corrupt(err.to_string()))
            })?;
            if stored.revision() != expected_revision {
                return Err(ConflictableTransactionError::Abort(WriteAbort::Conflict(
                    Some(stored.revision()),
                )));
            }
            write(entities, history)
        });

        match result {
            Ok(()) => Ok(None),
            Err(TransactionError::Abort(WriteAbort::Conflict(current_revision))) => {
                tracing::warn!(
                    entity_id = %id,
                    expected = expected_revision,
                    current = ?current_revision,
                    "conditional write lost the race"
                );
                Ok(Some(WriteOutcome::Conflict { current_revision }))
            }
            Err(TransactionError::Abort(WriteAbort::Corrupt(reason))) => {
                Err(anyhow::anyhow!("stored entity {id} failed to decode: {reason}"))
            }
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }
}

impl EntityStore for SledStore {
    fn create(&self, entity: &WorkflowEntity) -> anyhow::Result<WorkflowEntity> {
        let bytes = minicbor::to_vec(entity)?;
        let key = entity.id().as_str().as_bytes();

        if self
            .entities
            .compare_and_swap(key, None as Option<&[u8]>, Some(bytes))?
            .is_err()
        {
            anyhow::bail!("entity {} already exists", entity.id());
        }
        self.bump();

        tracing::info!(
            entity_id = %entity.id(),
            owner = %entity.owner(),
            scope = %entity.scope(),
            "entity created"
        );
        Ok(entity.clone())
    }

    fn get(&self, id: &EntityId) -> anyhow::Result<Option<WorkflowEntity>> {
        let Some(bytes) = self.entities.get(id.as_str().as_bytes())? else {
            return Ok(None);
        };
        let entity = minicbor::decode(&bytes)
            .with_context(|| format!("stored entity {id} failed to decode"))?;
        Ok(Some(entity))
    }

    fn list(&self, query: &StoreQuery) -> anyhow::Result<Vec<WorkflowEntity>> {
        let mut entities = Vec::new();
        for item in self.entities.iter() {
            let (key, bytes) = item?;
            let entity: WorkflowEntity = minicbor::decode(&bytes).with_context(|| {
                format!(
                    "stored entity {} failed to decode",
                    String::from_utf8_lossy(&key)
                )
            })?;
            if query.matches(&entity) {
                entities.push(entity);
            }
        }
        entities.sort_by(|a, b| {
            a.created_at()
                .cmp(b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(entities)
    }

    fn update(
        &self,
        expected_revision: u64,
        entity: &WorkflowEntity,
        record: &TransitionRecord,
    ) -> anyhow::Result<WriteOutcome> {
        let bytes = minicbor::to_vec(entity)?;
        let (_, record_bytes) = record.build()?;
        let record_key = record.storage_key();
        let key = entity.id().as_str().as_bytes();

        let conflict = self.conditional(entity.id(), expected_revision, |entities, history| {
            entities.insert(key, bytes.as_slice())?;
            history.insert(record_key.as_bytes(), record_bytes.as_slice())?;
            Ok(())
        })?;
        if let Some(conflict) = conflict {
            return Ok(conflict);
        }
        self.bump();

        // read back: the store, not the caller's copy, is authoritative
        match self.get(entity.id())? {
            Some(stored) => Ok(WriteOutcome::Stored(stored)),
            None => Ok(WriteOutcome::Conflict {
                current_revision: None,
            }),
        }
    }

    fn remove(
        &self,
        id: &EntityId,
        expected_revision: u64,
        record: &TransitionRecord,
    ) -> anyhow::Result<WriteOutcome> {
        let (_, record_bytes) = record.build()?;
        let record_key = record.storage_key();
        let key = id.as_str().as_bytes();

        let conflict = self.conditional(id, expected_revision, |entities, history| {
            entities.remove(key)?;
            history.insert(record_key.as_bytes(), record_bytes.as_slice())?;
            Ok(())
        })?;
        if let Some(conflict) = conflict {
            return Ok(conflict);
        }
        self.bump();

        tracing::info!(entity_id = %id, "entity removed");
        Ok(WriteOutcome::Removed)
    }

    fn history(&self, id: &EntityId) -> anyhow::Result<Vec<TransitionRecord>> {
        let prefix = TransitionRecord::history_prefix(id);
        let mut records = Vec::new();
        for item in self.history.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let record = minicbor::decode(&bytes)
                .with_context(|| format!("history record of {id} failed to decode"))?;
            records.push(record);
        }
        Ok(records)
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
