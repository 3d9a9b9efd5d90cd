//! Stage registry for explicit stage construction.
//!
//! The [`StageRegistry`] maps a stage kind (as written in `units[].stages[].kind`)
//! to a builder. Builders receive the stage's configuration and a
//! [`BuildContext`] through which they validate types and register the
//! indexes they will query. Stages are resolved once, at assembly time.
//!
//! ```rust,ignore
//! let mut registry = StageRegistry::with_builtins();
//! registry.register_stage("uppercase-names", build_uppercase);
//! let pipeline = Pipeline::build(&config, &types, &registry, id_start)?;
//! ```

use super::stage::Stage;
use super::stages;
use crate::config::StageConfig;
use crate::core::{TypeDef, TypeDirectory};
use crate::error::{MigrateError, Result};
use crate::index::Indexer;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// What a builder may touch while constructing its stage.
pub struct BuildContext<'a> {
    pub types: &'a dyn TypeDirectory,
    pub indexer: &'a mut Indexer,
    /// Name of the unit the stage belongs to, for error messages.
    pub unit: &'a str,
}

impl BuildContext<'_> {
    /// Look up a type, failing with a configuration error.
    pub fn require_type(&self, name: &str) -> Result<&TypeDef> {
        self.types.lookup(name).ok_or_else(|| {
            MigrateError::Config(format!("unit '{}': unknown type '{}'", self.unit, name))
        })
    }

    /// Check that a type declares an attribute.
    pub fn require_attribute(&self, type_name: &str, attribute: &str) -> Result<()> {
        let def = self.require_type(type_name)?;
        if def.attribute(attribute).is_none() {
            return Err(MigrateError::Config(format!(
                "unit '{}': type '{}' has no attribute '{}'",
                self.unit, type_name, attribute
            )));
        }
        Ok(())
    }
}

/// Builds a stage from its configuration.
pub type StageBuilder = fn(&StageConfig, &mut BuildContext<'_>) -> Result<Box<dyn Stage>>;

/// Registry of stage kinds.
#[derive(Default)]
pub struct StageRegistry {
    builders: BTreeMap<String, StageBuilder>,
}

impl StageRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in stages registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_stage("type-filter", stages::build_type_filter);
        registry.register_stage("attribute-filter", stages::build_attribute_filter);
        registry.register_stage("value-rewrite", stages::build_value_rewrite);
        registry.register_stage("type-move", stages::build_type_move);
        registry.register_stage("association-inline", stages::build_association_inline);
        registry.register_stage("id-remap", stages::build_id_remap);
        registry
    }

    /// Register a stage kind. A later registration replaces an earlier one.
    pub fn register_stage(&mut self, kind: impl Into<String>, builder: StageBuilder) {
        self.builders.insert(kind.into(), builder);
    }

    pub fn has_stage(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// All registered kinds, sorted.
    pub fn stage_kinds(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }

    /// Build a stage, returning an error for unknown kinds.
    pub fn build(
        &self,
        config: &StageConfig,
        ctx: &mut BuildContext<'_>,
    ) -> Result<Box<dyn Stage>> {
        let builder = self.builders.get(&config.kind).ok_or_else(|| {
            MigrateError::Config(format!(
                "unit '{}': unknown stage kind '{}'. Known kinds: {}",
                ctx.unit,
                config.kind,
                self.stage_kinds().join(", ")
            ))
        })?;
        builder(config, ctx)
    }
}

/// Deserialize a stage's kind specific parameters.
pub fn stage_params<T: DeserializeOwned>(config: &StageConfig) -> Result<T> {
    let mapping: serde_yaml::Mapping = config
        .params
        .iter()
        .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
        .collect();
    serde_yaml::from_value(serde_yaml::Value::Mapping(mapping)).map_err(|e| {
        MigrateError::Config(format!("stage '{}': invalid parameters: {}", config.kind, e))
    })
}

/// Fail if a stage that sees every event was given a slot filter.
pub fn reject_slot_filter(config: &StageConfig) -> Result<()> {
    if !config.predicates.is_empty() {
        return Err(MigrateError::Config(format!(
            "stage '{}' does not support predicates",
            config.kind
        )));
    }
    Ok(())
}
