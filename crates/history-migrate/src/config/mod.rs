//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::core::SchemaTypes;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for the run journal.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Build the type directory declared under `schema`.
    pub fn type_directory(&self) -> Result<SchemaTypes> {
        SchemaTypes::new(self.schema.types.clone(), self.schema.tables.clone())
    }

    /// Merge ranges of all units, in unit order.
    pub fn merge_ranges(&self) -> Vec<MergeRange> {
        self.units.iter().filter_map(|u| u.merge).collect()
    }
}

impl TargetConfig {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}
