//! Hierarchy & role directory
//!
//! A [`Directory`] is a read-only snapshot of who holds which role where. The
//! organization is a forest of [`OrgNode`]s: either flat departments or a
//! company -> building -> site chain. A role held at a node covers that node
//! and everything beneath it.
use crate::error::{ConfigError, DirectoryError};
use crate::types::{Identity, ScopeId};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Administrator,
    Assistant,
    Boss,
    Accounting,
    Supervisor,
    Technician,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Department,
    Company,
    Building,
    Site,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgNode {
    pub id: ScopeId,
    pub kind: NodeKind,
    pub parent: Option<ScopeId>,
}

impl OrgNode {
    pub fn new(id: impl Into<ScopeId>, kind: NodeKind, parent: Option<ScopeId>) -> Self {
        Self {
            id: id.into(),
            kind,
            parent,
        }
    }
    pub fn department(id: &str) -> Self {
        Self::new(id, NodeKind::Department, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoleAssignment {
    pub identity: Identity,
    pub role: Role,
    pub scope: ScopeId,
}

impl RoleAssignment {
    pub fn new(identity: impl Into<Identity>, role: Role, scope: impl Into<ScopeId>) -> Self {
        Self {
            identity: identity.into(),
            role,
            scope: scope.into(),
        }
    }
}

/// Remote source of directory data. Implementations do the I/O; the engine only
/// ever sees the [`Directory`] snapshot built from it.
pub trait DirectoryProvider {
    fn get_roles(&self, identity: &Identity) -> Result<Vec<RoleAssignment>, DirectoryError>;

    /// `Ok(None)` means the scope is not part of the organization.
    fn get_org_node(&self, scope: &ScopeId) -> Result<Option<OrgNode>, DirectoryError>;

    /// Assignments held exactly at `scope` (not at its descendants).
    fn get_scope_assignments(&self, scope: &ScopeId)
    -> Result<Vec<RoleAssignment>, DirectoryError>;

    /// Changes whenever the provider's data changes; used as a cache key.
    fn version(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
    version: u64,
    by_identity: BTreeMap<Identity, BTreeSet<(Role, ScopeId)>>,
    by_scope: BTreeMap<ScopeId, BTreeSet<(Role, Identity)>>,
    nodes: BTreeMap<ScopeId, OrgNode>,
}

#[derive(Debug, Default)]
pub struct DirectoryBuilder {
    version: u64,
    nodes: Vec<OrgNode>,
    assignments: Vec<RoleAssignment>,
}

impl DirectoryBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
    pub fn node(mut self, node: OrgNode) -> Self {
        self.nodes.push(node);
        self
    }
    pub fn assign(mut self, identity: &str, role: Role, scope: &str) -> Self {
        self.assignments
            .push(RoleAssignment::new(identity, role, scope));
        self
    }
    pub fn assignment(mut self, assignment: RoleAssignment) -> Self {
        self.assignments.push(assignment);
        self
    }

    /// Validates the hierarchy: unique node ids, known parents, no parent cycles,
    /// and assignments only on known nodes.
    pub fn build(self) -> Result<Directory, ConfigError> {
        let mut directory = Directory {
            version: self.version,
            ..Directory::default()
        };

        for node in self.nodes {
            if directory.nodes.contains_key(&node.id) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "org node {} is declared twice",
                    node.id
                )));
            }
            directory.nodes.insert(node.id.clone(), node);
        }

        for node in directory.nodes.values() {
            if let Some(parent) = &node.parent {
                if !directory.nodes.contains_key(parent) {
                    return Err(ConfigError::InvalidConfiguration(format!(
                        "org node {} has unknown parent {}",
                        node.id, parent
                    )));
                }
            }
            directory.check_acyclic(&node.id)?;
        }

        for assignment in self.assignments {
            if !directory.nodes.contains_key(&assignment.scope) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "{} is assigned {:?} on unknown scope {}",
                    assignment.identity, assignment.role, assignment.scope
                )));
            }
            directory.insert_assignment(assignment);
        }

        Ok(directory)
    }
}

impl Directory {
    pub fn builder() -> DirectoryBuilder {
        DirectoryBuilder::default()
    }

    /// Fetch just enough from `provider` to answer questions about `actor` acting
    /// on entities in `scopes`: the actor's roles, every scope's ancestry chain,
    /// and the assignments held along those chains (for skip predicates).
    pub fn resolve<'a, P>(
        provider: &P,
        actor: &Identity,
        scopes: impl IntoIterator<Item = &'a ScopeId>,
    ) -> Result<Directory, DirectoryError>
    where
        P: DirectoryProvider + ?Sized,
    {
        let mut directory = Directory {
            version: provider.version(),
            ..Directory::default()
        };

        let roles = provider.get_roles(actor).inspect_err(|err| {
            tracing::warn!(actor = %actor, error = %err, "failed to load actor roles");
        })?;

        let mut wanted: BTreeSet<ScopeId> = scopes.into_iter().cloned().collect();
        for assignment in roles {
            wanted.insert(assignment.scope.clone());
            directory.insert_assignment(assignment);
        }

        let mut visited = BTreeSet::new();
        for scope in wanted {
            let mut cursor = Some(scope);
            while let Some(current) = cursor.take() {
                if !visited.insert(current.clone()) {
                    break;
                }
                let node = provider.get_org_node(&current).inspect_err(|err| {
                    tracing::warn!(scope = %current, error = %err, "failed to load org node");
                })?;
                let Some(node) = node else {
                    break;
                };
                let assignments = provider
                    .get_scope_assignments(&current)
                    .inspect_err(|err| {
                        tracing::warn!(
                            scope = %current,
                            error = %err,
                            "failed to load scope assignments"
                        );
                    })?;
                for assignment in assignments {
                    directory.insert_assignment(assignment);
                }
                cursor = node.parent.clone();
                directory.nodes.insert(current, node);
            }
        }

        tracing::debug!(
            actor = %actor,
            nodes = directory.nodes.len(),
            version = directory.version,
            "resolved directory snapshot"
        );
        Ok(directory)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn node(&self, scope: &ScopeId) -> Option<&OrgNode> {
        self.nodes.get(scope)
    }

    pub fn contains_scope(&self, scope: &ScopeId) -> bool {
        self.nodes.contains_key(scope)
    }

    /// All `(role, scope)` pairs held by `identity`; empty when it holds none.
    pub fn roles_of(&self, identity: &Identity) -> BTreeSet<(Role, ScopeId)> {
        self.by_identity.get(identity).cloned().unwrap_or_default()
    }

    pub fn has_role(&self, identity: &Identity, role: Role) -> bool {
        self.by_identity
            .get(identity)
            .is_some_and(|held| held.iter().any(|(r, _)| *r == role))
    }

    /// `identity` holds `role` at `scope` or at one of its ancestors.
    pub fn has_role_in(&self, identity: &Identity, role: Role, scope: &ScopeId) -> bool {
        self.by_identity.get(identity).is_some_and(|held| {
            held.iter()
                .any(|(r, held_scope)| *r == role && self.same_scope(held_scope, scope))
        })
    }

    /// Somebody holds `role` at `scope` or above it.
    pub fn scope_has_role_type(&self, scope: &ScopeId, role: Role) -> bool {
        self.lineage(scope).iter().any(|node| {
            self.by_scope
                .get(node)
                .is_some_and(|held| held.iter().any(|(r, _)| *r == role))
        })
    }

    /// `outer` is `inner` or one of its ancestors. Note the direction: a company
    /// covers its sites, a site does not cover its company.
    pub fn same_scope(&self, outer: &ScopeId, inner: &ScopeId) -> bool {
        outer == inner || self.ancestors(inner).iter().any(|a| a == outer)
    }

    /// Parent chain of `scope`, nearest first. Empty for roots and unknown scopes.
    pub fn ancestors(&self, scope: &ScopeId) -> Vec<ScopeId> {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.get(scope).and_then(|n| n.parent.as_ref());
        while let Some(parent) = cursor {
            // bounded: resolve() and build() never admit cycles, but stay finite anyway
            if chain.len() > self.nodes.len() {
                break;
            }
            chain.push(parent.clone());
            cursor = self.nodes.get(parent).and_then(|n| n.parent.as_ref());
        }
        chain
    }

    fn lineage(&self, scope: &ScopeId) -> Vec<ScopeId> {
        let mut lineage = vec![scope.clone()];
        lineage.extend(self.ancestors(scope));
        lineage
    }

    fn insert_assignment(&mut self, assignment: RoleAssignment) {
        self.by_identity
            .entry(assignment.identity.clone())
            .or_default()
            .insert((assignment.role, assignment.scope.clone()));
        self.by_scope
            .entry(assignment.scope)
            .or_default()
            .insert((assignment.role, assignment.identity));
    }

    fn check_acyclic(&self, start: &ScopeId) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "org hierarchy has a cycle through {start}"
                )));
            }
            cursor = self.nodes.get(id).and_then(|n| n.parent.as_ref());
        }
        Ok(())
    }
}

impl DirectoryProvider for Directory {
    fn get_roles(&self, identity: &Identity) -> Result<Vec<RoleAssignment>, DirectoryError> {
        Ok(self
            .roles_of(identity)
            .into_iter()
            .map(|(role, scope)| RoleAssignment {
                identity: identity.clone(),
                role,
                scope,
            })
            .collect())
    }

    fn get_org_node(&self, scope: &ScopeId) -> Result<Option<OrgNode>, DirectoryError> {
        Ok(self.nodes.get(scope).cloned())
    }

    fn get_scope_assignments(
        &self,
        scope: &ScopeId,
    ) -> Result<Vec<RoleAssignment>, DirectoryError> {
        Ok(self
            .by_scope
            .get(scope)
            .map(|held| {
                held.iter()
                    .map(|(role, identity)| RoleAssignment {
                        identity: identity.clone(),
                        role: *role,
                        scope: scope.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn version(&self) -> u64 {
        self.version
    }
}
