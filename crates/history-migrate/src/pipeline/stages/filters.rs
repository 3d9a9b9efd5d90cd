//! Dropping stages: whole events by type, single attributes by name.

use crate::config::StageConfig;
use crate::core::{ChangeSet, ItemDeletion, ItemUpdate, ObjectCreation};
use crate::error::{MigrateError, Result};
use crate::pipeline::registry::{stage_params, BuildContext};
use crate::pipeline::stage::{Stage, StageContext};
use regex::RegexSet;
use serde::Deserialize;
use tracing::debug;

/// Drops every event the slot filter lets through.
pub struct TypeFilter {
    dropped: u64,
}

pub fn build_type_filter(
    config: &StageConfig,
    ctx: &mut BuildContext<'_>,
) -> Result<Box<dyn Stage>> {
    if config.types.is_empty() {
        return Err(MigrateError::Config(format!(
            "unit '{}': type-filter needs at least one type",
            ctx.unit
        )));
    }
    Ok(Box::new(TypeFilter { dropped: 0 }))
}

impl Stage for TypeFilter {
    fn name(&self) -> &str {
        "type-filter"
    }

    fn creation(
        &mut self,
        _event: ObjectCreation,
        _out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        self.dropped += 1;
        Ok(())
    }

    fn update(
        &mut self,
        _event: ItemUpdate,
        _out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        self.dropped += 1;
        Ok(())
    }

    fn deletion(
        &mut self,
        _event: ItemDeletion,
        _out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        self.dropped += 1;
        Ok(())
    }

    fn finish(&mut self, _ctx: &mut StageContext<'_>) -> Result<Vec<ChangeSet>> {
        debug!("type-filter dropped {} events", self.dropped);
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct AttributeFilterParams {
    /// Attribute name patterns to drop.
    patterns: Vec<String>,
}

/// Removes attributes whose names match any pattern.
pub struct AttributeFilter {
    patterns: RegexSet,
}

pub fn build_attribute_filter(
    config: &StageConfig,
    _ctx: &mut BuildContext<'_>,
) -> Result<Box<dyn Stage>> {
    let params: AttributeFilterParams = stage_params(config)?;
    let patterns = RegexSet::new(&params.patterns)
        .map_err(|e| MigrateError::Config(format!("attribute-filter: invalid pattern: {}", e)))?;
    Ok(Box::new(AttributeFilter { patterns }))
}

impl Stage for AttributeFilter {
    fn name(&self) -> &str {
        "attribute-filter"
    }

    fn creation(
        &mut self,
        mut event: ObjectCreation,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        event.values.retain(|name, _| !self.patterns.is_match(name));
        out.push_creation(event);
        Ok(())
    }

    fn update(
        &mut self,
        mut event: ItemUpdate,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        event.changes.retain(|name, _| !self.patterns.is_match(name));
        if !event.changes.is_empty() {
            out.merge_update(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeChange, Attributes, CommitInfo, ObjectIdentity, Value};
    use crate::index::Indexer;
    use crate::mapping::IdMapper;
    use crate::report::ErrorLog;
    use chrono::Utc;

    fn empty(revision: i64) -> ChangeSet {
        ChangeSet::new(
            revision,
            CommitInfo {
                author: "t".into(),
                date: Utc::now(),
                log: String::new(),
            },
        )
    }

    #[test]
    fn test_attribute_filter() {
        let mut stage = AttributeFilter {
            patterns: RegexSet::new(["^legacy_", "^tmp$"]).unwrap(),
        };
        let mut mapper = IdMapper::new(1);
        let indexer = Indexer::new();
        let mut errors = ErrorLog::new();
        let mut ctx = StageContext {
            mapper: &mut mapper,
            indexer: &indexer,
            errors: &mut errors,
            revision: 1,
        };
        let mut out = empty(1);

        stage
            .creation(
                ObjectCreation {
                    object: ObjectIdentity::new(1, "Person", 1),
                    values: Attributes::from([
                        ("name".to_string(), Value::text("a")),
                        ("legacy_code".to_string(), Value::Int(1)),
                    ]),
                },
                &mut out,
                &mut ctx,
            )
            .unwrap();
        stage
            .update(
                ItemUpdate::new(ObjectIdentity::new(1, "Person", 2))
                    .with_change("tmp", AttributeChange::set(Value::Int(2))),
                &mut out,
                &mut ctx,
            )
            .unwrap();

        assert_eq!(out.creations[0].values.len(), 1);
        assert!(out.creations[0].values.contains_key("name"));
        // An update left without attributes is dropped.
        assert!(out.updates.is_empty());
    }
}
