//! Configuration validation.
//!
//! Checks what can be checked without the stage registry. Stage parameters
//! and type references are validated when the pipeline is assembled.

use super::{Config, PredicateConfig};
use crate::error::{MigrateError, Result};
use crate::target::SslMode;
use regex::Regex;
use std::collections::BTreeSet;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    SslMode::parse(&config.target.ssl_mode)?;
    if config.target.max_connections == 0 {
        return Err(MigrateError::Config(
            "target.max_connections must be at least 1".into(),
        ));
    }

    // Migration settings
    if config.migration.buffer_size == 0 {
        return Err(MigrateError::Config(
            "migration.buffer_size must be at least 1".into(),
        ));
    }
    if config.migration.insert_chunk_size == 0 {
        return Err(MigrateError::Config(
            "migration.insert_chunk_size must be at least 1".into(),
        ));
    }
    if config.migration.read_window < 1 {
        return Err(MigrateError::Config(
            "migration.read_window must be at least 1".into(),
        ));
    }
    if let Some(start) = config.migration.id_start {
        if start < 1 {
            return Err(MigrateError::Config(
                "migration.id_start must be positive".into(),
            ));
        }
    }

    // Schema
    config.type_directory()?;

    // Units
    let mut names = BTreeSet::new();
    for unit in &config.units {
        if unit.name.is_empty() {
            return Err(MigrateError::Config("units[].name is required".into()));
        }
        if !names.insert(unit.name.as_str()) {
            return Err(MigrateError::Config(format!(
                "unit '{}' is declared twice",
                unit.name
            )));
        }
        for stage in &unit.stages {
            if stage.kind.is_empty() {
                return Err(MigrateError::Config(format!(
                    "unit '{}': stage kind is required",
                    unit.name
                )));
            }
            for predicate in &stage.predicates {
                validate_predicate(&unit.name, predicate)?;
            }
        }
        for processor in unit.schema_processors.iter().chain(&unit.post_processors) {
            if processor.kind.is_empty() {
                return Err(MigrateError::Config(format!(
                    "unit '{}': processor kind is required",
                    unit.name
                )));
            }
        }
        if let Some(range) = unit.merge {
            if range.start > range.stop {
                return Err(MigrateError::Config(format!(
                    "unit '{}': merge start {} is after stop {}",
                    unit.name, range.start, range.stop
                )));
            }
        }
    }

    // Merge ranges must not overlap
    let ranges = config.merge_ranges();
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            if a.overlaps(b) {
                return Err(MigrateError::Config(format!(
                    "merge ranges [{}, {}] and [{}, {}] overlap",
                    a.start, a.stop, b.start, b.stop
                )));
            }
        }
    }

    Ok(())
}

fn validate_predicate(unit: &str, predicate: &PredicateConfig) -> Result<()> {
    match predicate {
        PredicateConfig::AttributeMatches { attribute, pattern } => {
            require_attribute(unit, attribute)?;
            Regex::new(pattern).map_err(|e| {
                MigrateError::Config(format!(
                    "unit '{}': invalid pattern '{}': {}",
                    unit, pattern, e
                ))
            })?;
        }
        PredicateConfig::AttributeEquals { attribute, .. }
        | PredicateConfig::HasAttribute { attribute } => require_attribute(unit, attribute)?,
        PredicateConfig::ReferenceTargetType { attribute, types } => {
            require_attribute(unit, attribute)?;
            if types.is_empty() {
                return Err(MigrateError::Config(format!(
                    "unit '{}': reference-target-type on '{}' needs at least one type",
                    unit, attribute
                )));
            }
        }
    }
    Ok(())
}

fn require_attribute(unit: &str, attribute: &str) -> Result<()> {
    if attribute.is_empty() {
        return Err(MigrateError::Config(format!(
            "unit '{}': predicate attribute is required",
            unit
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        MergeRange, MigrationConfig, SchemaConfig, StageConfig, TargetConfig, UnitConfig,
    };

    fn valid_config() -> Config {
        Config {
            target: TargetConfig {
                r#type: "postgres".to_string(),
                host: "localhost".to_string(),
                port: 5432,
                database: "store".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                schema: "public".to_string(),
                ssl_mode: "disable".to_string(),
                max_connections: 4,
            },
            migration: MigrationConfig::default(),
            schema: SchemaConfig::default(),
            units: vec![unit("first")],
        }
    }

    fn unit(name: &str) -> UnitConfig {
        UnitConfig {
            name: name.to_string(),
            stages: vec![],
            merge: None,
            schema_processors: vec![],
            post_processors: vec![],
        }
    }

    fn stage_with(predicate: PredicateConfig) -> StageConfig {
        StageConfig {
            kind: "type-filter".to_string(),
            types: vec![],
            predicates: vec![predicate],
            params: Default::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_unknown_ssl_mode() {
        let mut config = valid_config();
        config.target.ssl_mode = "prefer".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("ssl_mode"));
    }

    #[test]
    fn test_missing_target_host() {
        let mut config = valid_config();
        config.target.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_wrong_target_type() {
        let mut config = valid_config();
        config.target.r#type = "mysql".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_chunk_size() {
        let mut config = valid_config();
        config.migration.insert_chunk_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_read_window() {
        let mut config = valid_config();
        config.migration.read_window = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_unit_name() {
        let mut config = valid_config();
        config.units.push(unit("first"));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_inverted_merge_range() {
        let mut config = valid_config();
        config.units[0].merge = Some(MergeRange { start: 20, stop: 10 });
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_overlapping_merge_ranges() {
        let mut config = valid_config();
        config.units[0].merge = Some(MergeRange { start: 10, stop: 15 });
        let mut second = unit("second");
        second.merge = Some(MergeRange { start: 15, stop: 20 });
        config.units.push(second);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("overlap"));

        config.units[1].merge = Some(MergeRange { start: 16, stop: 20 });
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_predicate_pattern() {
        let mut config = valid_config();
        config.units[0].stages.push(stage_with(PredicateConfig::AttributeMatches {
            attribute: "name".into(),
            pattern: "([".into(),
        }));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_reference_target_type_needs_types() {
        let mut config = valid_config();
        config.units[0]
            .stages
            .push(stage_with(PredicateConfig::ReferenceTargetType {
                attribute: "owner".into(),
                types: vec![],
            }));
        assert!(validate(&config).is_err());
    }
}
