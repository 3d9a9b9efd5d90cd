//! Revision merger.
//!
//! Coalesces every revision in a closed range into one synthetic revision
//! numbered `stop`. Revisions inside the range other than `stop` are still
//! emitted, empty, under their own numbers so that revision numbering in the
//! target store stays dense.

use super::stage::{Stage, StageContext};
use crate::config::MergeRange;
use crate::core::{ChangeSet, CommitInfo};
use crate::error::Result;
use tracing::{debug, info};

enum MergeState {
    Idle,
    Collecting { merged: ChangeSet, logs: Vec<String> },
}

/// Stage coalescing `[start, stop]` into a single revision.
pub struct RevisionMerger {
    name: String,
    range: MergeRange,
    state: MergeState,
}

impl RevisionMerger {
    pub fn new(range: MergeRange) -> Self {
        Self {
            name: format!("revision-merge[{}, {}]", range.start, range.stop),
            range,
            state: MergeState::Idle,
        }
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state, MergeState::Collecting { .. })
    }

    /// Emit the merged change set and return to idle.
    fn flush(&mut self) -> Option<ChangeSet> {
        match std::mem::replace(&mut self.state, MergeState::Idle) {
            MergeState::Idle => None,
            MergeState::Collecting { mut merged, logs } => {
                merged.revision = self.range.stop;
                merged.commit.log = logs.join("\n");
                info!(
                    "Merged revisions {}..={} into revision {} ({} events)",
                    self.range.start,
                    self.range.stop,
                    merged.revision,
                    merged.event_count()
                );
                Some(merged)
            }
        }
    }
}

impl Stage for RevisionMerger {
    fn name(&self) -> &str {
        &self.name
    }

    fn filtered(&self) -> bool {
        false
    }

    fn end_revision(
        &mut self,
        out: ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<ChangeSet>> {
        let revision = out.revision;

        if !self.range.contains(revision) {
            if revision > self.range.stop {
                if let Some(merged) = self.flush() {
                    return Ok(vec![merged, out]);
                }
            }
            return Ok(vec![out]);
        }

        let placeholder = ChangeSet::new(
            revision,
            CommitInfo {
                author: out.commit.author.clone(),
                date: out.commit.date,
                log: String::new(),
            },
        );
        let log = out.commit.log.clone();
        match &mut self.state {
            MergeState::Idle => {
                debug!("Revision {} starts merge range", revision);
                self.state = MergeState::Collecting {
                    merged: out,
                    logs: Vec::new(),
                };
            }
            MergeState::Collecting { merged, .. } => {
                merged.commit.author = out.commit.author.clone();
                merged.commit.date = out.commit.date;
                merged.absorb(out);
            }
        }
        if let MergeState::Collecting { logs, .. } = &mut self.state {
            if !log.is_empty() {
                logs.push(log);
            }
        }

        if revision == self.range.stop {
            return Ok(self.flush().into_iter().collect());
        }
        Ok(vec![placeholder])
    }

    fn finish(&mut self, _ctx: &mut StageContext<'_>) -> Result<Vec<ChangeSet>> {
        Ok(self.flush().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        AttributeChange, Attributes, ItemDeletion, ItemUpdate, ObjectCreation, ObjectIdentity,
        Revision, Value,
    };
    use crate::index::Indexer;
    use crate::mapping::IdMapper;
    use crate::report::ErrorLog;
    use chrono::{TimeZone, Utc};

    fn change_set(revision: Revision) -> ChangeSet {
        ChangeSet::new(
            revision,
            CommitInfo {
                author: format!("user{}", revision),
                date: Utc.timestamp_opt(revision * 60, 0).unwrap(),
                log: format!("log {}", revision),
            },
        )
    }

    fn person(id: i64) -> ObjectIdentity {
        ObjectIdentity::new(1, "Person", id)
    }

    fn run(merger: &mut RevisionMerger, inputs: Vec<ChangeSet>) -> Vec<ChangeSet> {
        let mut mapper = IdMapper::new(1);
        let indexer = Indexer::new();
        let mut errors = ErrorLog::new();
        let mut ctx = StageContext {
            mapper: &mut mapper,
            indexer: &indexer,
            errors: &mut errors,
            revision: 0,
        };
        let mut out = Vec::new();
        for cs in inputs {
            ctx.revision = cs.revision;
            out.extend(merger.end_revision(cs, &mut ctx).unwrap());
        }
        out.extend(merger.finish(&mut ctx).unwrap());
        out
    }

    #[test]
    fn test_merge_range_10_to_15() {
        let mut merger = RevisionMerger::new(MergeRange { start: 10, stop: 15 });
        let mut inputs: Vec<ChangeSet> = (8..=17).map(change_set).collect();
        inputs[3].push_creation(ObjectCreation {
            object: person(1),
            values: Attributes::from([("name".to_string(), Value::text("A"))]),
        });
        inputs[5].merge_update(ItemUpdate::new(person(1)).with_change(
            "name",
            AttributeChange::change(Value::text("A"), Value::text("B")),
        ));

        let out = run(&mut merger, inputs);
        let revs: Vec<_> = out.iter().map(|cs| cs.revision).collect();
        assert_eq!(revs, vec![8, 9, 10, 11, 12, 13, 14, 15, 16, 17]);

        for cs in &out[2..7] {
            assert!(cs.is_empty());
            assert!(cs.commit.log.is_empty());
        }
        let merged = &out[7];
        assert_eq!(merged.creations.len(), 1);
        assert_eq!(merged.creations[0].values["name"], Value::text("B"));
        assert_eq!(
            merged.commit.log,
            "log 10\nlog 11\nlog 12\nlog 13\nlog 14\nlog 15"
        );
        assert_eq!(merged.commit.author, "user15");
        assert!(!merger.is_collecting());
    }

    #[test]
    fn test_missing_stop_flushes_before_next_revision() {
        let mut merger = RevisionMerger::new(MergeRange { start: 10, stop: 15 });
        let out = run(&mut merger, vec![change_set(11), change_set(13), change_set(20)]);
        let revs: Vec<_> = out.iter().map(|cs| cs.revision).collect();
        assert_eq!(revs, vec![11, 13, 15, 20]);
        assert_eq!(out[2].commit.log, "log 11\nlog 13");
    }

    #[test]
    fn test_end_of_input_flushes() {
        let mut merger = RevisionMerger::new(MergeRange { start: 10, stop: 15 });
        let out = run(&mut merger, vec![change_set(9), change_set(12)]);
        let revs: Vec<_> = out.iter().map(|cs| cs.revision).collect();
        assert_eq!(revs, vec![9, 12, 15]);
    }

    #[test]
    fn test_creation_then_deletion_vanishes() {
        let mut merger = RevisionMerger::new(MergeRange { start: 1, stop: 2 });
        let mut r1 = change_set(1);
        r1.push_creation(ObjectCreation {
            object: person(3),
            values: Attributes::new(),
        });
        let mut r2 = change_set(2);
        r2.deletions.push(ItemDeletion { object: person(3) });

        let out = run(&mut merger, vec![r1, r2]);
        assert_eq!(out.len(), 2);
        assert!(out[1].is_empty());
    }
}
