//! Engine configuration
//!
//! Loaded from TOML at startup. Anything malformed is reported as
//! [`ConfigError::InvalidConfiguration`] before the engine handles a request.
//!
//! ```toml
//! [[expense.stages]]
//! name = "Assistant"
//! role = "assistant"
//! skip_when_scope_lacks = "assistant"
//!
//! [[expense.stages]]
//! name = "Boss"
//! role = "boss"
//!
//! [query]
//! page_size = 50
//! ```
use crate::error::ConfigError;
use crate::stage::{Pipeline, StageDefinition};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub expense: Pipeline,
    pub page_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    expense: RawPipeline,
    #[serde(default)]
    query: RawQuery,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    #[serde(default)]
    stages: Vec<StageDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQuery {
    #[serde(default = "default_page_size")]
    page_size: usize,
}

impl Default for RawQuery {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(source)
            .map_err(|err| ConfigError::InvalidConfiguration(err.to_string()))?;

        if raw.query.page_size == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "query.page_size must be at least 1".into(),
            ));
        }

        let config = Self {
            expense: Pipeline::new(raw.expense.stages)?,
            page_size: raw.query.page_size,
        };
        tracing::info!(
            stages = config.expense.len(),
            page_size = config.page_size,
            "engine configuration loaded"
        );
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::InvalidConfiguration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expense: Pipeline::standard(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}
