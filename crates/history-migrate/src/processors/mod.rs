//! Schema and post-load processors.
//!
//! Schema processors change the store before the history is replayed; a
//! processor that makes the stored rows unreadable by the new type
//! definitions declares `requires_replay`. Post-load processors run after a
//! successful reload. Each group runs in one store transaction.

mod sql;

pub use sql::SqlProcessor;

use crate::config::ProcessorConfig;
use crate::error::{MigrateError, Result};
use crate::report::ErrorLog;
use crate::target::TargetTransaction;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// A schema change applied before the replay.
#[async_trait]
pub trait SchemaProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the stored history must be replayed after this change.
    fn requires_replay(&self) -> bool;

    async fn apply(&self, tx: &mut dyn TargetTransaction, errors: &mut ErrorLog) -> Result<()>;
}

/// Work done on the reloaded store.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, tx: &mut dyn TargetTransaction, errors: &mut ErrorLog) -> Result<()>;
}

pub type SchemaProcessorBuilder = fn(&ProcessorConfig) -> Result<Box<dyn SchemaProcessor>>;
pub type PostProcessorBuilder = fn(&ProcessorConfig) -> Result<Box<dyn PostProcessor>>;

/// Registry of processor kinds.
#[derive(Default)]
pub struct ProcessorRegistry {
    schema: BTreeMap<String, SchemaProcessorBuilder>,
    post: BTreeMap<String, PostProcessorBuilder>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `sql` kind for both processor groups.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_schema("sql", sql::build_schema);
        registry.register_post("sql", sql::build_post);
        registry
    }

    pub fn register_schema(&mut self, kind: impl Into<String>, builder: SchemaProcessorBuilder) {
        self.schema.insert(kind.into(), builder);
    }

    pub fn register_post(&mut self, kind: impl Into<String>, builder: PostProcessorBuilder) {
        self.post.insert(kind.into(), builder);
    }

    pub fn has_schema(&self, kind: &str) -> bool {
        self.schema.contains_key(kind)
    }

    pub fn has_post(&self, kind: &str) -> bool {
        self.post.contains_key(kind)
    }

    pub fn build_schema(&self, config: &ProcessorConfig) -> Result<Box<dyn SchemaProcessor>> {
        let builder = self
            .schema
            .get(&config.kind)
            .ok_or_else(|| unknown_kind("schema", &config.kind, self.schema.keys()))?;
        builder(config)
    }

    pub fn build_post(&self, config: &ProcessorConfig) -> Result<Box<dyn PostProcessor>> {
        let builder = self
            .post
            .get(&config.kind)
            .ok_or_else(|| unknown_kind("post", &config.kind, self.post.keys()))?;
        builder(config)
    }
}

fn unknown_kind<'a>(
    group: &str,
    kind: &str,
    known: impl Iterator<Item = &'a String>,
) -> MigrateError {
    MigrateError::Config(format!(
        "unknown {} processor kind '{}'. Known kinds: {}",
        group,
        kind,
        known.map(String::as_str).collect::<Vec<_>>().join(", ")
    ))
}

/// Deserialize a processor's kind specific parameters.
pub fn processor_params<T: DeserializeOwned>(config: &ProcessorConfig) -> Result<T> {
    let mapping: serde_yaml::Mapping = config
        .params
        .iter()
        .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
        .collect();
    serde_yaml::from_value(serde_yaml::Value::Mapping(mapping)).map_err(|e| {
        MigrateError::Config(format!(
            "processor '{}': invalid parameters: {}",
            config.kind, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str) -> ProcessorConfig {
        ProcessorConfig {
            kind: kind.to_string(),
            requires_replay: false,
            params: [(
                "statements".to_string(),
                serde_yaml::Value::Sequence(vec!["ANALYZE".into()]),
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_builtins() {
        let registry = ProcessorRegistry::with_builtins();
        assert!(registry.has_schema("sql"));
        assert!(registry.has_post("sql"));
        assert!(registry.build_schema(&config("sql")).is_ok());
        assert_eq!(registry.build_post(&config("sql")).unwrap().name(), "sql");
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ProcessorRegistry::with_builtins();
        let err = registry.build_post(&config("reindex")).err().unwrap();
        assert!(err.to_string().contains("unknown post processor kind 'reindex'"));
        assert!(err.to_string().contains("Known kinds: sql"));
    }
}
