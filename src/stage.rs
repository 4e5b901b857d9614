//! Stage definitions and per-entity stage records
use crate::directory::{Directory, Role};
use crate::error::ConfigError;
use crate::types::{Identity, ScopeId, TimeStamp};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum StageStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

/// When a stage is left out of the pipeline for a given scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipRule {
    #[default]
    Never,
    /// Skip when nobody holds this role at the entity's scope or above it,
    /// e.g. departments without an assistant go straight to the boss.
    WhenScopeLacks(Role),
}

impl SkipRule {
    pub fn applies(&self, scope: &ScopeId, directory: &Directory) -> bool {
        match self {
            SkipRule::Never => false,
            SkipRule::WhenScopeLacks(role) => !directory.scope_has_role_type(scope, *role),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub name: String,
    pub role: Role,
    #[serde(default, rename = "skip_when_scope_lacks", with = "skip_rule")]
    pub skip: SkipRule,
}

impl StageDefinition {
    pub fn new(name: &str, role: Role) -> Self {
        Self {
            name: name.to_string(),
            role,
            skip: SkipRule::Never,
        }
    }
    pub fn skip_when_scope_lacks(mut self, role: Role) -> Self {
        self.skip = SkipRule::WhenScopeLacks(role);
        self
    }
}

// config files spell the skip rule as an optional role name
mod skip_rule {
    use super::{Role, SkipRule};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SkipRule, D::Error> {
        Ok(Option::<Role>::deserialize(d)?
            .map(SkipRule::WhenScopeLacks)
            .unwrap_or_default())
    }
}

/// A validated, ordered list of stages. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<StageDefinition>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "a pipeline needs at least one stage".into(),
            ));
        }
        let mut names = BTreeSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::InvalidConfiguration(
                    "stage names must not be blank".into(),
                ));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "stage {} is declared twice",
                    stage.name
                )));
            }
        }
        Ok(Self { stages })
    }

    /// Assistant -> Boss -> Accounting, the assistant stage skipped in scopes
    /// without an assistant.
    pub fn standard() -> Self {
        Self {
            stages: vec![
                StageDefinition::new("Assistant", Role::Assistant)
                    .skip_when_scope_lacks(Role::Assistant),
                StageDefinition::new("Boss", Role::Boss),
                StageDefinition::new("Accounting", Role::Accounting),
            ],
        }
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StageDefinition> {
        self.stages.get(index)
    }

    pub fn definition(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Evaluate the skip predicate of each recorded stage against `scope`.
    /// Stages are matched to definitions by name; a stage the pipeline no
    /// longer knows is never skipped.
    pub fn skip_flags(
        &self,
        stages: &[Stage],
        scope: &ScopeId,
        directory: &Directory,
    ) -> Vec<bool> {
        stages
            .iter()
            .map(|stage| {
                self.definition(&stage.name)
                    .is_some_and(|def| def.skip.applies(scope, directory))
            })
            .collect()
    }

    /// Fresh stage records for a newly created entity: Pending everywhere.
    pub fn initial_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .map(|stage| Stage::pending(&stage.name))
            .collect()
    }
}

/// One stage as recorded on an entity.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Stage {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub status: StageStatus,
    #[n(2)]
    pub resolved_by: Option<Identity>,
    #[n(3)]
    pub resolved_at: Option<TimeStamp<Utc>>,
}

impl Stage {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            resolved_by: None,
            resolved_at: None,
        }
    }

    pub(crate) fn resolve(&mut self, status: StageStatus, actor: &Identity) {
        self.status = status;
        self.resolved_by = Some(actor.clone());
        self.resolved_at = Some(TimeStamp::new());
    }
}
