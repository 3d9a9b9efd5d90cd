//! Rewriter pipeline.
//!
//! The pipeline drives every change set of the history through an ordered
//! chain of stages:
//!
//! - [`Stage`]: one stateful rewriter with a hook per event kind
//! - [`StageRegistry`]: stage kinds resolved once, at assembly time
//! - [`EventFilter`]: the type and predicate filter of a stage slot
//! - [`RevisionMerger`]: coalesces a revision range, runs after every stage
//!
//! Per revision the driver runs, in order: [`Indexer::begin_revision`],
//! [`Indexer::observe`] on the input, every stage, and
//! [`Indexer::record_pending_deletes`]. A stage may turn one change set into
//! several (or none); each of them is fed to the next stage in order.

mod filter;
mod merge;
mod registry;
mod stage;
pub mod stages;
mod stats;

pub use filter::EventFilter;
pub use merge::RevisionMerger;
pub use registry::{reject_slot_filter, stage_params, BuildContext, StageBuilder, StageRegistry};
pub use stage::{Stage, StageContext};
pub use stats::PipelineStats;

use crate::config::Config;
use crate::core::{ChangeSet, CommitInfo, ObjectCreation, ObjectId, TypeDirectory};
use crate::error::{MigrateError, Result};
use crate::index::Indexer;
use crate::mapping::IdMapper;
use crate::report::ErrorLog;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// A stage and the filter deciding which events it sees.
struct StageSlot {
    stage: Box<dyn Stage>,
    filter: EventFilter,
}

impl StageSlot {
    /// Run one change set through the stage.
    fn run(&mut self, input: ChangeSet, ctx: &mut StageContext<'_>) -> Result<Vec<ChangeSet>> {
        ctx.revision = input.revision;
        self.stage.begin_revision(&input, ctx)?;

        let mut out = input.empty_like();
        let ChangeSet {
            branch_events,
            creations,
            updates,
            deletions,
            ..
        } = input;

        for event in branch_events {
            self.stage.branch(event, &mut out, ctx)?;
        }
        for event in creations {
            if self.filter.accepts_creation(&event) {
                self.stage.creation(event, &mut out, ctx)?;
            } else {
                out.push_creation(event);
            }
        }
        for event in updates {
            if self.filter.accepts_update(&event) {
                self.stage.update(event, &mut out, ctx)?;
            } else {
                out.merge_update(event);
            }
        }
        for event in deletions {
            if self.filter.accepts_deletion(&event) {
                self.stage.deletion(event, &mut out, ctx)?;
            } else {
                out.deletions.push(event);
            }
        }

        self.stage.end_revision(out, ctx)
    }

    fn run_all(
        &mut self,
        batch: Vec<ChangeSet>,
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<ChangeSet>> {
        let mut out = Vec::with_capacity(batch.len());
        for cs in batch {
            out.extend(self.run(cs, ctx)?);
        }
        Ok(out)
    }
}

/// The assembled stage chain with its run-scoped mapper, indexes and error log.
pub struct Pipeline {
    slots: Vec<StageSlot>,
    indexer: Indexer,
    mapper: IdMapper,
    errors: ErrorLog,
    log_size_threshold: usize,
    stats: PipelineStats,
}

impl Pipeline {
    /// Assemble the stages of every unit, in unit order.
    ///
    /// Fails with a configuration error for unknown stage kinds, unknown
    /// types, invalid parameters, and for a stage querying an index placed
    /// after a stage that rewrites identities (indexes hold source
    /// identities).
    pub fn build(
        config: &Config,
        types: &dyn TypeDirectory,
        registry: &StageRegistry,
        id_start: ObjectId,
    ) -> Result<Self> {
        let mut indexer = Indexer::new();
        let mut slots = Vec::new();
        let mut identity_rewriter: Option<String> = None;

        for unit in &config.units {
            for stage_config in &unit.stages {
                let mut ctx = BuildContext {
                    types,
                    indexer: &mut indexer,
                    unit: &unit.name,
                };
                let stage = registry.build(stage_config, &mut ctx)?;

                if stage.queries_index() {
                    if let Some(rewriter) = &identity_rewriter {
                        return Err(MigrateError::Config(format!(
                            "unit '{}': stage '{}' queries an index but follows '{}', \
                             which rewrites identities",
                            unit.name,
                            stage.name(),
                            rewriter
                        )));
                    }
                }
                if stage.rewrites_identity() {
                    identity_rewriter = Some(format!("{}/{}", unit.name, stage.name()));
                }

                let filter = if stage.filtered() {
                    EventFilter::new(&stage_config.types, &stage_config.predicates, types)?
                } else {
                    EventFilter::all()
                };
                debug!("Unit {}: stage {}", unit.name, stage.name());
                slots.push(StageSlot { stage, filter });
            }
        }

        let mut ranges = config.merge_ranges();
        ranges.sort_by_key(|r| r.start);
        for range in ranges {
            slots.push(StageSlot {
                stage: Box::new(RevisionMerger::new(range)),
                filter: EventFilter::all(),
            });
        }

        info!(
            "Pipeline assembled: {} stages, {} indexes, ids allocated from {}",
            slots.len(),
            indexer.len(),
            id_start
        );

        Ok(Self {
            slots,
            indexer,
            mapper: IdMapper::new(id_start),
            errors: ErrorLog::new(),
            log_size_threshold: config.migration.log_size_threshold,
            stats: PipelineStats::new(),
        })
    }

    /// Whether the pipeline passes every change set through unchanged.
    pub fn is_identity(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stage names in chain order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.stage.name()).collect()
    }

    /// Run one revision through the chain.
    ///
    /// Returns the change sets ready for the sink, in revision order.
    pub fn process(&mut self, input: ChangeSet) -> Result<Vec<ChangeSet>> {
        self.stats.revisions_read += 1;
        self.stats.events_read += input.event_count() as u64;
        let revision = input.revision;

        self.indexer.begin_revision();
        self.indexer.observe(&input);

        let mut batch = vec![input];
        let mut ctx = StageContext {
            mapper: &mut self.mapper,
            indexer: &self.indexer,
            errors: &mut self.errors,
            revision,
        };
        for slot in &mut self.slots {
            batch = slot.run_all(batch, &mut ctx)?;
        }

        self.indexer.record_pending_deletes();
        self.emitted(&batch);
        Ok(batch)
    }

    /// Run an unversioned object through the creation hooks.
    ///
    /// Unversioned objects are outside the revision model: they are not
    /// indexed and a stage turning one into anything but creations is a
    /// structural error.
    pub fn process_unversioned(
        &mut self,
        creation: ObjectCreation,
    ) -> Result<Vec<ObjectCreation>> {
        self.stats.unversioned += 1;
        let mut creations = vec![creation];
        let mut ctx = StageContext {
            mapper: &mut self.mapper,
            indexer: &self.indexer,
            errors: &mut self.errors,
            revision: 0,
        };

        for slot in &mut self.slots {
            let mut scratch = ChangeSet::new(0, unversioned_commit());
            for event in creations {
                if slot.filter.accepts_creation(&event) {
                    slot.stage.creation(event, &mut scratch, &mut ctx)?;
                } else {
                    scratch.push_creation(event);
                }
            }
            for update in &scratch.updates {
                ctx.structural_error(format!(
                    "stage {} turned unversioned object {} into an update",
                    slot.stage.name(),
                    update.object
                ));
            }
            creations = scratch.creations;
        }
        Ok(creations)
    }

    /// End of input: flush every stage, upstream first.
    pub fn finish(&mut self) -> Result<Vec<ChangeSet>> {
        let mut ctx = StageContext {
            mapper: &mut self.mapper,
            indexer: &self.indexer,
            errors: &mut self.errors,
            revision: 0,
        };
        let mut batch = Vec::new();
        for slot in &mut self.slots {
            let mut next = slot.run_all(batch, &mut ctx)?;
            next.extend(slot.stage.finish(&mut ctx)?);
            batch = next;
        }
        self.emitted(&batch);
        Ok(batch)
    }

    fn emitted(&mut self, batch: &[ChangeSet]) {
        for cs in batch {
            let events = cs.event_count();
            self.stats.revisions_written += 1;
            self.stats.events_written += events as u64;
            if events > self.log_size_threshold {
                info!("Revision {} carries {} events", cs.revision, events);
            }
        }
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn into_errors(self) -> ErrorLog {
        self.errors
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn mapper(&self) -> &IdMapper {
        &self.mapper
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }
}

fn unversioned_commit() -> CommitInfo {
    CommitInfo {
        author: String::new(),
        date: DateTime::<Utc>::UNIX_EPOCH,
        log: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        AttributeChange, Attributes, ItemDeletion, ItemUpdate, ObjectIdentity, Revision,
        SchemaTypes, Value,
    };
    use crate::report::ErrorKind;
    use chrono::TimeZone;

    const TYPES: &str = r#"
target:
  host: localhost
  database: store
  user: postgres
schema:
  types:
    - name: Person
      attributes:
        - { name: name, kind: text }
        - { name: group, kind: reference }
    - name: Group
      attributes:
        - { name: title, kind: text }
    - name: Membership
      attributes:
        - { name: member, kind: reference }
        - { name: group, kind: reference }
"#;

    fn pipeline(units: &str) -> Result<(Pipeline, SchemaTypes)> {
        let config = Config::from_yaml(&format!("{}{}", TYPES, units))?;
        let types = config.type_directory()?;
        let pipeline = Pipeline::build(&config, &types, &StageRegistry::with_builtins(), 100)?;
        Ok((pipeline, types))
    }

    fn change_set(revision: Revision) -> ChangeSet {
        ChangeSet::new(
            revision,
            CommitInfo {
                author: "admin".into(),
                date: Utc.timestamp_opt(revision * 60, 0).unwrap(),
                log: format!("commit {}", revision),
            },
        )
    }

    fn person(id: i64) -> ObjectIdentity {
        ObjectIdentity::new(1, "Person", id)
    }

    fn group(id: i64) -> ObjectIdentity {
        ObjectIdentity::new(1, "Group", id)
    }

    fn membership(id: i64) -> ObjectIdentity {
        ObjectIdentity::new(1, "Membership", id)
    }

    fn create(object: ObjectIdentity, values: &[(&str, Value)]) -> ObjectCreation {
        ObjectCreation {
            object,
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Attributes>(),
        }
    }

    fn link(id: i64, member: i64, to: i64) -> ObjectCreation {
        create(
            membership(id),
            &[
                ("member", Value::reference(person(member))),
                ("group", Value::reference(group(to))),
            ],
        )
    }

    const INLINE: &str = r#"
units:
  - name: inline
    stages:
      - kind: association-inline
        association_type: Membership
        target_object: member
        reference_name: group
        reference_value: group
"#;

    #[test]
    fn test_empty_pipeline_is_identity() {
        let (mut pipeline, _) = pipeline("").unwrap();
        assert!(pipeline.is_identity());

        let mut cs = change_set(1);
        cs.push_creation(create(person(1), &[("name", Value::text("Ann"))]));
        let out = pipeline.process(cs.clone()).unwrap();
        assert_eq!(out, vec![cs]);
        assert!(pipeline.finish().unwrap().is_empty());
        assert_eq!(pipeline.stats().revisions_read, 1);
        assert_eq!(pipeline.stats().events_written, 1);
    }

    #[test]
    fn test_association_inline_scenario() {
        let (mut pipeline, _) = pipeline(INLINE).unwrap();

        // r1: the link arrives before its endpoint within the revision.
        let mut r1 = change_set(1);
        r1.push_creation(link(20, 1, 10));
        r1.push_creation(create(group(10), &[("title", Value::text("ops"))]));
        r1.push_creation(create(person(1), &[("name", Value::text("Ann"))]));
        let out = pipeline.process(r1).unwrap();
        assert_eq!(out.len(), 1);
        let creations = &out[0].creations;
        assert_eq!(creations.len(), 2);
        let ann = creations.iter().find(|c| c.object == person(1)).unwrap();
        assert_eq!(ann.values["group"], Value::reference(group(10)));
        assert!(out[0].updates.is_empty());

        // r2: deleting the link nulls the reference.
        let mut r2 = change_set(2);
        r2.deletions.push(ItemDeletion {
            object: membership(20),
        });
        let out = pipeline.process(r2).unwrap();
        assert!(out[0].deletions.is_empty());
        let change = &out[0].updates[0].changes["group"];
        assert_eq!(change.new, Value::Null);
        assert_eq!(change.old, Some(Value::reference(group(10))));

        // r3/r4: a link deleted together with its endpoint leaves only the deletion.
        let mut r3 = change_set(3);
        r3.push_creation(link(21, 1, 10));
        let out = pipeline.process(r3).unwrap();
        assert_eq!(out[0].updates.len(), 1);

        let mut r4 = change_set(4);
        r4.deletions.push(ItemDeletion {
            object: membership(21),
        });
        r4.deletions.push(ItemDeletion { object: person(1) });
        let out = pipeline.process(r4).unwrap();
        assert!(out[0].updates.is_empty());
        assert_eq!(out[0].deletions, vec![ItemDeletion { object: person(1) }]);

        assert!(pipeline.errors().is_empty());
    }

    #[test]
    fn test_link_update_is_structural_error() {
        let (mut pipeline, _) = pipeline(INLINE).unwrap();
        let mut r1 = change_set(1);
        r1.push_creation(link(20, 1, 10));
        pipeline.process(r1).unwrap();

        let mut r2 = change_set(2);
        r2.merge_update(ItemUpdate::new(membership(20)).with_change(
            "group",
            AttributeChange::change(Value::reference(group(10)), Value::reference(group(11))),
        ));
        let out = pipeline.process(r2).unwrap();
        assert!(out[0].is_empty());
        assert_eq!(pipeline.errors().count(ErrorKind::Structural), 1);
    }

    #[test]
    fn test_links_outside_filter_stay_objects() {
        let (mut pipeline, _) = pipeline(
            r#"
units:
  - name: inline
    stages:
      - kind: association-inline
        predicates:
          - kind: reference-target-type
            attribute: group
            types: [Person]
        association_type: Membership
        target_object: member
        reference_name: group
        reference_value: group
"#,
        )
        .unwrap();

        let mut r1 = change_set(1);
        r1.push_creation(create(person(1), &[("name", Value::text("Ann"))]));
        r1.push_creation(link(20, 1, 10));
        let out = pipeline.process(r1).unwrap();
        assert_eq!(out[0].creations.len(), 2);
        assert!(out[0].updates.is_empty());

        let mut r2 = change_set(2);
        r2.merge_update(ItemUpdate::new(membership(20)).with_change(
            "group",
            AttributeChange::change(Value::reference(group(10)), Value::reference(person(1))),
        ));
        let out = pipeline.process(r2).unwrap();
        assert_eq!(out[0].updates.len(), 1);
        assert_eq!(out[0].updates[0].object, membership(20));

        let mut r3 = change_set(3);
        r3.deletions.push(ItemDeletion {
            object: membership(20),
        });
        let out = pipeline.process(r3).unwrap();
        assert!(out[0].updates.is_empty());
        assert_eq!(
            out[0].deletions,
            vec![ItemDeletion {
                object: membership(20)
            }]
        );
        assert!(pipeline.errors().is_empty());
    }

    #[test]
    fn test_reference_to_dropped_creation_is_resolution_error() {
        let (mut pipeline, _) = pipeline(
            r#"
units:
  - name: drop-groups
    stages:
      - kind: type-filter
        types: [Group]
      - kind: id-remap
"#,
        )
        .unwrap();

        let mut r1 = change_set(1);
        r1.push_creation(create(group(10), &[("title", Value::text("ops"))]));
        r1.push_creation(create(
            person(1),
            &[
                ("name", Value::text("Ann")),
                ("group", Value::reference(group(10))),
            ],
        ));
        let out = pipeline.process(r1).unwrap();

        assert_eq!(out[0].creations.len(), 1);
        let ann = &out[0].creations[0];
        assert_eq!(ann.object, person(100));
        assert_eq!(ann.values["group"], Value::Null);
        assert_eq!(pipeline.errors().count(ErrorKind::Resolution), 1);
        assert!(pipeline.errors().check("transform").is_err());
    }

    #[test]
    fn test_index_query_after_identity_rewrite_rejected() {
        let result = pipeline(
            r#"
units:
  - name: remap
    stages:
      - kind: id-remap
  - name: inline
    stages:
      - kind: association-inline
        association_type: Membership
        target_object: member
        reference_name: group
        reference_value: group
"#,
        );
        assert!(matches!(result, Err(MigrateError::Config(ref m)) if m.contains("rewrites")));
    }

    #[test]
    fn test_unknown_stage_type_rejected() {
        let result = pipeline(
            r#"
units:
  - name: bad
    stages:
      - kind: attribute-filter
        types: [Nobody]
        patterns: ["x"]
"#,
        );
        assert!(matches!(result, Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_reconcile_folds_duplicate_key() {
        let (mut pipeline, _) = pipeline(
            r#"
units:
  - name: dedupe
    stages:
      - kind: id-remap
        reconcile:
          - { type: Group, keys: [title] }
"#,
        )
        .unwrap();

        let mut r1 = change_set(1);
        r1.push_creation(create(group(10), &[("title", Value::text("ops"))]));
        pipeline.process(r1).unwrap();

        let mut r2 = change_set(2);
        r2.push_creation(create(group(11), &[("title", Value::text("ops"))]));
        r2.push_creation(create(
            person(1),
            &[("group", Value::reference(group(11)))],
        ));
        let out = pipeline.process(r2).unwrap();

        // Group 11 is folded into group 10 and every reference follows.
        assert_eq!(out[0].creations.len(), 1);
        assert_eq!(out[0].creations[0].values["group"], Value::reference(group(100)));

        let mut r3 = change_set(3);
        r3.merge_update(
            ItemUpdate::new(group(11))
                .with_change("title", AttributeChange::set(Value::text("dev"))),
        );
        let out = pipeline.process(r3).unwrap();
        assert!(out[0].is_empty());
        assert!(pipeline.errors().is_empty());
    }

    #[test]
    fn test_remap_shares_ids_across_branches() {
        let (mut pipeline, _) = pipeline(
            r#"
units:
  - name: remap
    stages:
      - kind: id-remap
"#,
        )
        .unwrap();
        let on_branch = |id| ObjectIdentity::new(2, "Group", id);

        let mut r1 = change_set(1);
        r1.push_creation(create(group(10), &[("title", Value::text("ops"))]));
        pipeline.process(r1).unwrap();

        let mut r2 = change_set(2);
        r2.push_creation(create(on_branch(10), &[("title", Value::text("ops"))]));
        r2.push_creation(create(on_branch(11), &[("title", Value::text("dev"))]));
        r2.push_creation(create(
            ObjectIdentity::new(2, "Person", 1),
            &[("group", Value::reference(on_branch(10)))],
        ));
        let out = pipeline.process(r2).unwrap();

        let objects: Vec<_> = out[0].creations.iter().map(|c| c.object.clone()).collect();
        assert!(objects.contains(&on_branch(100)));
        assert!(objects.contains(&on_branch(101)));
        let person = out[0]
            .creations
            .iter()
            .find(|c| c.object.type_name == "Person")
            .unwrap();
        assert_eq!(person.object.id, 102);
        assert_eq!(person.values["group"], Value::reference(on_branch(100)));
        assert_eq!(pipeline.mapper().map(10), Some(100));
        assert!(pipeline.errors().is_empty());
    }

    #[test]
    fn test_reconciled_object_is_dropped_on_every_branch() {
        let (mut pipeline, _) = pipeline(
            r#"
units:
  - name: dedupe
    stages:
      - kind: id-remap
        reconcile:
          - { type: Group, keys: [title] }
"#,
        )
        .unwrap();
        let on_branch = |id| ObjectIdentity::new(2, "Group", id);

        let mut r1 = change_set(1);
        r1.push_creation(create(group(10), &[("title", Value::text("ops"))]));
        pipeline.process(r1).unwrap();

        let mut r2 = change_set(2);
        r2.push_creation(create(group(11), &[("title", Value::text("ops"))]));
        let out = pipeline.process(r2).unwrap();
        assert!(out[0].is_empty());

        let mut r3 = change_set(3);
        r3.push_creation(create(on_branch(11), &[("title", Value::text("ops"))]));
        let out = pipeline.process(r3).unwrap();
        assert!(out[0].is_empty());

        let mut r4 = change_set(4);
        r4.merge_update(
            ItemUpdate::new(on_branch(11))
                .with_change("title", AttributeChange::set(Value::text("dev"))),
        );
        r4.deletions.push(ItemDeletion {
            object: on_branch(11),
        });
        let out = pipeline.process(r4).unwrap();
        assert!(out[0].is_empty());
        assert!(pipeline.errors().is_empty());
    }

    #[test]
    fn test_merge_range_runs_after_stages() {
        let (mut pipeline, _) = pipeline(
            r#"
units:
  - name: squash
    stages:
      - kind: attribute-filter
        patterns: ["^title$"]
    merge: { start: 2, stop: 3 }
"#,
        )
        .unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec!["attribute-filter", "revision-merge[2, 3]"]
        );

        let mut revs = Vec::new();
        for r in 1..=4 {
            let mut cs = change_set(r);
            cs.push_creation(create(group(r), &[("title", Value::text("t"))]));
            revs.extend(pipeline.process(cs).unwrap());
        }
        revs.extend(pipeline.finish().unwrap());

        let numbers: Vec<_> = revs.iter().map(|cs| cs.revision).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(revs[1].is_empty());
        assert_eq!(revs[2].creations.len(), 2);
        assert!(revs[2].creations.iter().all(|c| c.values.is_empty()));
        assert_eq!(revs[2].commit.log, "commit 2\ncommit 3");
    }

    #[test]
    fn test_unversioned_objects_are_remapped() {
        let (mut pipeline, _) = pipeline(
            r#"
units:
  - name: remap
    stages:
      - kind: id-remap
"#,
        )
        .unwrap();
        let out = pipeline
            .process_unversioned(create(group(7), &[("title", Value::text("x"))]))
            .unwrap();
        assert_eq!(out[0].object, group(100));
        assert_eq!(pipeline.mapper().map(7), Some(100));
        assert_eq!(pipeline.stats().unversioned, 1);
    }
}
