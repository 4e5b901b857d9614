//! Query / filter layer
//!
//! Listing a collection for an actor happens in two steps. First an
//! [`EligibilityMap`] is built: one eligibility evaluation per entity, done
//! once for a given `(collection version, actor, directory version)` and
//! reusable through [`EligibilityCache`]. Then [`filter_entities`] makes one
//! pass over the collection and keeps the positions that match the
//! [`Criteria`]. Pages are slices of that result and never filter again.
//!
//! The map only answers "can this actor act". The Resolved and Rejected views
//! derive the aggregate status from the entity during the pass.
use crate::eligibility::Eligibility;
use crate::entity::WorkflowEntity;
use crate::types::{EntityId, Identity, TimeStamp};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ViewMode {
    #[default]
    All,
    /// Entities on which the actor has a workflow action. Creator edit and
    /// delete do not count.
    Actionable,
    /// Fully approved claims and completed tickets.
    Resolved,
    /// Rejected claims and cancelled tickets.
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    from: Option<TimeStamp<Utc>>,
    to: Option<TimeStamp<Utc>>,
    owner: Option<Identity>,
    text: Option<String>,
    view: ViewMode,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inclusive on both ends, applied to the creation time. Either end may be
    /// left open.
    pub fn set_date_range(
        mut self,
        from: Option<TimeStamp<Utc>>,
        to: Option<TimeStamp<Utc>>,
    ) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn set_owner(mut self, owner: Identity) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Case-insensitive. Blank text matches everything.
    pub fn set_free_text(mut self, text: &str) -> Self {
        let text = text.trim();
        self.text = (!text.is_empty()).then(|| text.to_lowercase());
        self
    }

    pub fn set_view_mode(mut self, view: ViewMode) -> Self {
        self.view = view;
        self
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view
    }

    fn matches(
        &self,
        entity: &WorkflowEntity,
        eligibility: &Eligibility<'_>,
        map: &EligibilityMap,
    ) -> bool {
        let created = entity.created_at();
        if self.from.as_ref().is_some_and(|from| created < from)
            || self.to.as_ref().is_some_and(|to| created > to)
        {
            return false;
        }
        if self.owner.as_ref().is_some_and(|owner| entity.owner() != owner) {
            return false;
        }
        if self
            .text
            .as_deref()
            .is_some_and(|needle| !entity.matches_text(needle))
        {
            return false;
        }
        match self.view {
            ViewMode::All => true,
            ViewMode::Actionable => map.is_actionable(entity.id()),
            ViewMode::Resolved => eligibility.current_state(entity).is_resolved(),
            ViewMode::Rejected => eligibility.current_state(entity).is_rejected(),
        }
    }
}

/// Per-entity eligibility of one actor over one collection.
#[derive(Debug, Clone, Default)]
pub struct EligibilityMap {
    entries: HashMap<EntityId, bool>,
}

impl EligibilityMap {
    pub fn build(
        collection: &[WorkflowEntity],
        eligibility: &Eligibility<'_>,
        actor: &Identity,
    ) -> Self {
        let entries = collection
            .iter()
            .map(|entity| (entity.id().clone(), eligibility.is_actionable(entity, actor)))
            .collect();
        Self { entries }
    }

    pub fn is_actionable(&self, id: &EntityId) -> bool {
        self.entries.get(id).copied().unwrap_or(false)
    }

    /// Number of entities evaluated when the map was built.
    pub fn evaluations(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub collection_version: u64,
    pub actor: Identity,
    pub directory_version: u64,
}

/// Eligibility maps by key. Stale entries are never detected here; the caller
/// bumps a version or calls [`invalidate`](Self::invalidate).
///
/// Only maps for the newest collection and directory versions are kept, one
/// per actor. Building a map for a newer key evicts everything older.
#[derive(Debug, Default)]
pub struct EligibilityCache {
    maps: HashMap<CacheKey, Arc<EligibilityMap>>,
    builds: usize,
}

impl EligibilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_for(
        &mut self,
        key: CacheKey,
        collection: &[WorkflowEntity],
        eligibility: &Eligibility<'_>,
    ) -> Arc<EligibilityMap> {
        if let Some(map) = self.maps.get(&key) {
            tracing::debug!(
                actor = %key.actor,
                collection_version = key.collection_version,
                "eligibility map reused"
            );
            return Arc::clone(map);
        }

        let before = self.maps.len();
        self.maps.retain(|cached, _| {
            cached.collection_version == key.collection_version
                && cached.directory_version == key.directory_version
        });
        if self.maps.len() < before {
            tracing::debug!(evicted = before - self.maps.len(), "stale eligibility maps dropped");
        }

        let map = Arc::new(EligibilityMap::build(collection, eligibility, &key.actor));
        self.builds += 1;
        tracing::debug!(
            actor = %key.actor,
            collection_version = key.collection_version,
            directory_version = key.directory_version,
            entities = map.evaluations(),
            "eligibility map built"
        );
        self.maps.insert(key, Arc::clone(&map));
        map
    }

    /// How many maps were built since creation.
    pub fn builds(&self) -> usize {
        self.builds
    }

    /// Maps currently held.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn invalidate(&mut self) {
        self.maps.clear();
    }
}

/// Positions in the source collection that passed the filter, in their
/// original order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredView {
    indices: Vec<usize>,
    page_size: usize,
    scanned: usize,
}

impl FilteredView {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.indices.len().div_ceil(self.page_size)
    }

    /// Entities examined while filtering. Paging does not add to it.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Zero-based page `n` of `collection`, which must be the collection the
    /// view was filtered from. Out of range pages are empty.
    pub fn page<'c>(&self, collection: &'c [WorkflowEntity], n: usize) -> Vec<&'c WorkflowEntity> {
        self.indices
            .iter()
            .skip(n.saturating_mul(self.page_size))
            .take(self.page_size)
            .filter_map(|index| collection.get(*index))
            .collect()
    }

    pub fn iter<'c>(
        &self,
        collection: &'c [WorkflowEntity],
    ) -> impl Iterator<Item = &'c WorkflowEntity> + use<'_, 'c> {
        self.indices.iter().filter_map(|index| collection.get(*index))
    }
}

/// Single pass over `collection`. `map` must have been built for the same
/// collection with `eligibility`. A `page_size` of zero is treated as one.
pub fn filter_entities(
    collection: &[WorkflowEntity],
    criteria: &Criteria,
    eligibility: &Eligibility<'_>,
    map: &EligibilityMap,
    page_size: usize,
) -> FilteredView {
    let indices = collection
        .iter()
        .enumerate()
        .filter(|(_, entity)| criteria.matches(entity, eligibility, map))
        .map(|(index, _)| index)
        .collect();

    FilteredView {
        indices,
        page_size: page_size.max(1),
        scanned: collection.len(),
    }
}

/// Build the map and filter in one go, without caching.
pub fn filter_for_actor<'c>(
    collection: &'c [WorkflowEntity],
    criteria: &Criteria,
    eligibility: &Eligibility<'_>,
    actor: &Identity,
) -> Vec<&'c WorkflowEntity> {
    let map = EligibilityMap::build(collection, eligibility, actor);
    let view = filter_entities(collection, criteria, eligibility, &map, collection.len());
    view.iter(collection).collect()
}
