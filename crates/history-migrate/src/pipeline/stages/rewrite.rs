//! Value and type rewriting stages.

use crate::config::StageConfig;
use crate::core::{
    Attributes, ChangeSet, ItemDeletion, ItemUpdate, ObjectCreation, ObjectIdentity, Value,
};
use crate::error::{MigrateError, Result};
use crate::pipeline::registry::{reject_slot_filter, stage_params, BuildContext};
use crate::pipeline::stage::{Stage, StageContext};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;

#[derive(Debug, Deserialize)]
struct ValueRewriteParams {
    /// Attributes to rewrite (default: every text attribute).
    #[serde(default)]
    attributes: Vec<String>,
    pattern: String,
    replacement: String,
}

/// Regex replacement on text values.
pub struct ValueRewrite {
    attributes: BTreeSet<String>,
    pattern: Regex,
    replacement: String,
}

pub fn build_value_rewrite(
    config: &StageConfig,
    _ctx: &mut BuildContext<'_>,
) -> Result<Box<dyn Stage>> {
    let params: ValueRewriteParams = stage_params(config)?;
    let pattern = Regex::new(&params.pattern).map_err(|e| {
        MigrateError::Config(format!(
            "value-rewrite: invalid pattern '{}': {}",
            params.pattern, e
        ))
    })?;
    Ok(Box::new(ValueRewrite {
        attributes: params.attributes.into_iter().collect(),
        pattern,
        replacement: params.replacement,
    }))
}

impl ValueRewrite {
    fn applies_to(&self, attribute: &str) -> bool {
        self.attributes.is_empty() || self.attributes.contains(attribute)
    }

    fn rewrite(&self, attribute: &str, value: &mut Value) {
        if !self.applies_to(attribute) {
            return;
        }
        if let Value::Text(text) = value {
            let replaced = self.pattern.replace_all(text, self.replacement.as_str());
            if replaced != text.as_str() {
                *text = replaced.into_owned();
            }
        }
    }
}

impl Stage for ValueRewrite {
    fn name(&self) -> &str {
        "value-rewrite"
    }

    fn creation(
        &mut self,
        mut event: ObjectCreation,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        for (name, value) in event.values.iter_mut() {
            self.rewrite(name, value);
        }
        out.push_creation(event);
        Ok(())
    }

    fn update(
        &mut self,
        mut event: ItemUpdate,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        for (name, change) in event.changes.iter_mut() {
            self.rewrite(name, &mut change.new);
        }
        out.merge_update(event);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TypeMoveParams {
    source_types: Vec<String>,
    target_type: String,
}

/// Relocates all instances of some types to another type.
///
/// Every reference to a moved object is retargeted, in every event.
pub struct TypeMove {
    source_types: BTreeSet<String>,
    target_type: String,
}

pub fn build_type_move(config: &StageConfig, ctx: &mut BuildContext<'_>) -> Result<Box<dyn Stage>> {
    reject_slot_filter(config)?;
    if !config.types.is_empty() {
        return Err(MigrateError::Config(
            "type-move takes its types from source_types".into(),
        ));
    }
    let params: TypeMoveParams = stage_params(config)?;
    if params.source_types.is_empty() {
        return Err(MigrateError::Config(
            "type-move needs at least one source type".into(),
        ));
    }

    let target = ctx.require_type(&params.target_type)?;
    for source in &params.source_types {
        if *source == params.target_type {
            return Err(MigrateError::Config(format!(
                "type-move: '{}' is both source and target",
                source
            )));
        }
        for attribute in &ctx.require_type(source)?.attributes {
            match target.attribute(&attribute.name) {
                Some(t) if t.kind == attribute.kind => {}
                _ => {
                    return Err(MigrateError::Config(format!(
                        "type-move: '{}' has no attribute '{}' of kind {:?}",
                        params.target_type, attribute.name, attribute.kind
                    )))
                }
            }
        }
    }

    Ok(Box::new(TypeMove {
        source_types: params.source_types.into_iter().collect(),
        target_type: params.target_type,
    }))
}

impl TypeMove {
    fn relocate(&self, object: ObjectIdentity) -> ObjectIdentity {
        if self.source_types.contains(&object.type_name) {
            object.with_type(self.target_type.as_str())
        } else {
            object
        }
    }

    fn retarget(&self, value: &mut Value) {
        if let Value::Reference(reference) = value {
            if self.source_types.contains(&reference.object.type_name) {
                let moved = reference.object.with_type(self.target_type.as_str());
                *reference = reference.retarget(moved);
            }
        }
    }

    fn retarget_all(&self, values: &mut Attributes) {
        values.values_mut().for_each(|v| self.retarget(v));
    }
}

impl Stage for TypeMove {
    fn name(&self) -> &str {
        "type-move"
    }

    fn filtered(&self) -> bool {
        false
    }

    fn creation(
        &mut self,
        mut event: ObjectCreation,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        event.object = self.relocate(event.object);
        self.retarget_all(&mut event.values);
        out.push_creation(event);
        Ok(())
    }

    fn update(
        &mut self,
        mut event: ItemUpdate,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        event.object = self.relocate(event.object);
        for change in event.changes.values_mut() {
            self.retarget(&mut change.new);
            if let Some(old) = change.old.as_mut() {
                self.retarget(old);
            }
        }
        out.merge_update(event);
        Ok(())
    }

    fn deletion(
        &mut self,
        event: ItemDeletion,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        out.deletions.push(ItemDeletion {
            object: self.relocate(event.object),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        AttributeChange, AttributeDef, AttributeKind, CommitInfo, SchemaTypes, TypeDef,
    };
    use crate::index::Indexer;
    use crate::mapping::IdMapper;
    use crate::report::ErrorLog;
    use chrono::Utc;

    fn out(revision: i64) -> ChangeSet {
        ChangeSet::new(
            revision,
            CommitInfo {
                author: "t".into(),
                date: Utc::now(),
                log: String::new(),
            },
        )
    }

    fn with_ctx<F: FnOnce(&mut StageContext<'_>)>(f: F) {
        let mut mapper = IdMapper::new(1);
        let indexer = Indexer::new();
        let mut errors = ErrorLog::new();
        let mut ctx = StageContext {
            mapper: &mut mapper,
            indexer: &indexer,
            errors: &mut errors,
            revision: 1,
        };
        f(&mut ctx);
    }

    #[test]
    fn test_value_rewrite_creation_and_update() {
        let mut stage = ValueRewrite {
            attributes: BTreeSet::from(["name".to_string()]),
            pattern: Regex::new(r"^Mr\. ").unwrap(),
            replacement: String::new(),
        };
        let object = ObjectIdentity::new(1, "Person", 1);
        with_ctx(|ctx| {
            let mut cs = out(1);
            stage
                .creation(
                    ObjectCreation {
                        object: object.clone(),
                        values: Attributes::from([
                            ("name".to_string(), Value::text("Mr. Smith")),
                            ("title".to_string(), Value::text("Mr. X")),
                        ]),
                    },
                    &mut cs,
                    ctx,
                )
                .unwrap();
            assert_eq!(cs.creations[0].values["name"], Value::text("Smith"));
            assert_eq!(cs.creations[0].values["title"], Value::text("Mr. X"));

            let mut cs = out(2);
            stage
                .update(
                    ItemUpdate::new(object.clone()).with_change(
                        "name",
                        AttributeChange::change(Value::text("Smith"), Value::text("Mr. Jones")),
                    ),
                    &mut cs,
                    ctx,
                )
                .unwrap();
            let change = &cs.updates[0].changes["name"];
            assert_eq!(change.new, Value::text("Jones"));
            assert_eq!(change.old, Some(Value::text("Smith")));
        });
    }

    fn directory() -> SchemaTypes {
        let def = |name: &str, attrs: &[(&str, AttributeKind)]| TypeDef {
            name: name.into(),
            table: None,
            versioned: true,
            attributes: attrs
                .iter()
                .map(|(n, k)| AttributeDef {
                    name: n.to_string(),
                    kind: *k,
                    column: None,
                })
                .collect(),
        };
        SchemaTypes::new(
            vec![
                def("Contact", &[("name", AttributeKind::Text)]),
                def(
                    "Party",
                    &[("name", AttributeKind::Text), ("email", AttributeKind::Text)],
                ),
                def("Order", &[("buyer", AttributeKind::Reference)]),
            ],
            vec![],
        )
        .unwrap()
    }

    fn type_move_config(source: &str, target: &str) -> StageConfig {
        StageConfig {
            kind: "type-move".into(),
            types: vec![],
            predicates: vec![],
            params: [
                (
                    "source_types".to_string(),
                    serde_yaml::Value::Sequence(vec![source.into()]),
                ),
                ("target_type".to_string(), target.into()),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_type_move_validates_attributes() {
        let types = directory();
        let mut indexer = Indexer::new();
        let mut ctx = BuildContext {
            types: &types,
            indexer: &mut indexer,
            unit: "u",
        };
        assert!(build_type_move(&type_move_config("Contact", "Party"), &mut ctx).is_ok());
        // Party.email has no counterpart on Contact.
        assert!(build_type_move(&type_move_config("Party", "Contact"), &mut ctx).is_err());
        assert!(build_type_move(&type_move_config("Contact", "Nowhere"), &mut ctx).is_err());
    }

    #[test]
    fn test_type_move_retargets_references() {
        let mut stage = TypeMove {
            source_types: BTreeSet::from(["Contact".to_string()]),
            target_type: "Party".into(),
        };
        let contact = ObjectIdentity::new(1, "Contact", 4);
        let order = ObjectIdentity::new(1, "Order", 9);
        with_ctx(|ctx| {
            let mut cs = out(1);
            stage
                .creation(
                    ObjectCreation {
                        object: contact.clone(),
                        values: Attributes::new(),
                    },
                    &mut cs,
                    ctx,
                )
                .unwrap();
            stage
                .creation(
                    ObjectCreation {
                        object: order.clone(),
                        values: Attributes::from([(
                            "buyer".to_string(),
                            Value::reference(contact.clone()),
                        )]),
                    },
                    &mut cs,
                    ctx,
                )
                .unwrap();
            stage
                .deletion(ItemDeletion { object: contact.clone() }, &mut cs, ctx)
                .unwrap();

            let party = ObjectIdentity::new(1, "Party", 4);
            assert_eq!(cs.creations[0].object, party);
            assert_eq!(cs.creations[1].object, order);
            assert_eq!(cs.creations[1].values["buyer"], Value::reference(party.clone()));
            assert_eq!(cs.deletions[0].object, party);
        });
    }
}
