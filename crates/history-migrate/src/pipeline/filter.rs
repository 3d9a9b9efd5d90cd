//! Per-slot event filters.
//!
//! A filter restricts a stage to events of some types whose attributes
//! satisfy every predicate. Creations are matched on their values, updates
//! on the attributes they set, deletions on their type only.

use crate::config::PredicateConfig;
use crate::core::{Attributes, ItemDeletion, ItemUpdate, ObjectCreation, TypeDirectory, Value};
use crate::error::{MigrateError, Result};
use regex::Regex;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
enum Predicate {
    Matches { attribute: String, regex: Regex },
    Equals { attribute: String, value: String },
    Has { attribute: String },
    ReferenceTarget {
        attribute: String,
        types: BTreeSet<String>,
    },
}

impl Predicate {
    fn from_config(config: &PredicateConfig) -> Result<Self> {
        Ok(match config {
            PredicateConfig::AttributeMatches { attribute, pattern } => Predicate::Matches {
                attribute: attribute.clone(),
                regex: Regex::new(pattern).map_err(|e| {
                    MigrateError::Config(format!("invalid pattern '{}': {}", pattern, e))
                })?,
            },
            PredicateConfig::AttributeEquals { attribute, value } => Predicate::Equals {
                attribute: attribute.clone(),
                value: value.clone(),
            },
            PredicateConfig::HasAttribute { attribute } => Predicate::Has {
                attribute: attribute.clone(),
            },
            PredicateConfig::ReferenceTargetType { attribute, types } => {
                Predicate::ReferenceTarget {
                    attribute: attribute.clone(),
                    types: types.iter().cloned().collect(),
                }
            }
        })
    }

    fn test<'v>(&self, lookup: &dyn Fn(&str) -> Option<&'v Value>) -> bool {
        match self {
            Predicate::Matches { attribute, regex } => lookup(attribute)
                .filter(|v| !v.is_null())
                .is_some_and(|v| regex.is_match(&v.to_string())),
            Predicate::Equals { attribute, value } => lookup(attribute)
                .filter(|v| !v.is_null())
                .is_some_and(|v| v.to_string() == *value),
            Predicate::Has { attribute } => lookup(attribute).is_some(),
            Predicate::ReferenceTarget { attribute, types } => lookup(attribute)
                .and_then(Value::as_reference)
                .is_some_and(|r| types.contains(&r.object.type_name)),
        }
    }
}

/// Type and predicate filter of one stage slot.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    types: BTreeSet<String>,
    predicates: Vec<Predicate>,
}

impl EventFilter {
    /// Filter accepting every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter, checking that every named type exists.
    pub fn new(
        types: &[String],
        predicates: &[PredicateConfig],
        directory: &dyn TypeDirectory,
    ) -> Result<Self> {
        for name in types {
            if directory.lookup(name).is_none() {
                return Err(MigrateError::Config(format!(
                    "stage filter names unknown type '{}'",
                    name
                )));
            }
        }
        Ok(Self {
            types: types.iter().cloned().collect(),
            predicates: predicates
                .iter()
                .map(Predicate::from_config)
                .collect::<Result<_>>()?,
        })
    }

    pub fn is_all(&self) -> bool {
        self.types.is_empty() && self.predicates.is_empty()
    }

    pub fn accepts_type(&self, type_name: &str) -> bool {
        self.types.is_empty() || self.types.contains(type_name)
    }

    fn accepts_values(&self, values: &Attributes) -> bool {
        self.predicates.iter().all(|p| p.test(&|name| values.get(name)))
    }

    pub fn accepts_creation(&self, event: &ObjectCreation) -> bool {
        self.accepts_type(&event.object.type_name) && self.accepts_values(&event.values)
    }

    pub fn accepts_update(&self, event: &ItemUpdate) -> bool {
        self.accepts_type(&event.object.type_name)
            && self
                .predicates
                .iter()
                .all(|p| p.test(&|name| event.changes.get(name).map(|c| &c.new)))
    }

    pub fn accepts_deletion(&self, event: &ItemDeletion) -> bool {
        self.accepts_type(&event.object.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeChange, ObjectIdentity, SchemaTypes, TypeDef};

    fn directory() -> SchemaTypes {
        let def = |name: &str| TypeDef {
            name: name.into(),
            table: None,
            versioned: true,
            attributes: vec![],
        };
        SchemaTypes::new(vec![def("Person"), def("Group")], vec![]).unwrap()
    }

    fn creation(type_name: &str, values: &[(&str, Value)]) -> ObjectCreation {
        ObjectCreation {
            object: ObjectIdentity::new(1, type_name, 1),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_type_filter() {
        let filter = EventFilter::new(&["Person".into()], &[], &directory()).unwrap();
        assert!(filter.accepts_creation(&creation("Person", &[])));
        assert!(!filter.accepts_creation(&creation("Group", &[])));
        assert!(EventFilter::all().accepts_creation(&creation("Group", &[])));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = EventFilter::new(&["Robot".into()], &[], &directory());
        assert!(matches!(result, Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_predicates_are_a_conjunction() {
        let predicates = vec![
            PredicateConfig::AttributeMatches {
                attribute: "name".into(),
                pattern: "^Dr".into(),
            },
            PredicateConfig::HasAttribute {
                attribute: "title".into(),
            },
        ];
        let filter = EventFilter::new(&[], &predicates, &directory()).unwrap();
        assert!(filter.accepts_creation(&creation(
            "Person",
            &[("name", Value::text("Dr Who")), ("title", Value::Null)]
        )));
        assert!(!filter.accepts_creation(&creation("Person", &[("name", Value::text("Dr Who"))])));
        assert!(!filter.accepts_creation(&creation(
            "Person",
            &[("name", Value::text("Mr X")), ("title", Value::Null)]
        )));
    }

    #[test]
    fn test_update_matches_changed_attributes_only() {
        let predicates = vec![PredicateConfig::AttributeEquals {
            attribute: "age".into(),
            value: "42".into(),
        }];
        let filter = EventFilter::new(&[], &predicates, &directory()).unwrap();
        let object = ObjectIdentity::new(1, "Person", 1);
        let hit = ItemUpdate::new(object.clone())
            .with_change("age", AttributeChange::set(Value::Int(42)));
        let miss = ItemUpdate::new(object.clone())
            .with_change("name", AttributeChange::set(Value::text("x")));
        assert!(filter.accepts_update(&hit));
        assert!(!filter.accepts_update(&miss));
        assert!(filter.accepts_deletion(&ItemDeletion { object }));
    }

    #[test]
    fn test_reference_target_type() {
        let predicates = vec![PredicateConfig::ReferenceTargetType {
            attribute: "owner".into(),
            types: vec!["Group".into()],
        }];
        let filter = EventFilter::new(&[], &predicates, &directory()).unwrap();
        let group = Value::reference(ObjectIdentity::new(1, "Group", 5));
        let person = Value::reference(ObjectIdentity::new(1, "Person", 5));
        assert!(filter.accepts_creation(&creation("Person", &[("owner", group)])));
        assert!(!filter.accepts_creation(&creation("Person", &[("owner", person)])));
    }
}
