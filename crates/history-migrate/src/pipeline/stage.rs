//! Stage trait and per-revision context.

use crate::core::{BranchEvent, ChangeSet, ItemDeletion, ItemUpdate, ObjectCreation, Revision};
use crate::error::Result;
use crate::index::Indexer;
use crate::mapping::IdMapper;
use crate::report::ErrorLog;

/// Run-scoped state handed to every stage hook.
pub struct StageContext<'a> {
    pub mapper: &'a mut IdMapper,
    pub indexer: &'a Indexer,
    pub errors: &'a mut ErrorLog,
    /// Revision of the change set being processed.
    pub revision: Revision,
}

impl StageContext<'_> {
    /// Record a resolution error against the current revision.
    pub fn resolution_error(&mut self, message: impl Into<String>) {
        self.errors.resolution(self.revision, message);
    }

    /// Record a structural error against the current revision.
    pub fn structural_error(&mut self, message: impl Into<String>) {
        self.errors.structural(self.revision, message);
    }
}

/// A stateful rewriter in the pipeline.
///
/// Each hook receives one input event and writes zero or more events into
/// `out`, the stage's output for the revision. Not writing skips the event.
/// The defaults apply the event unchanged.
///
/// Errors that concern a single event are recorded in `ctx.errors` and the
/// stage recovers locally. Returning `Err` aborts the run.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Whether this stage looks objects up in an index.
    fn queries_index(&self) -> bool {
        false
    }

    /// Whether this stage rewrites object identities.
    fn rewrites_identity(&self) -> bool {
        false
    }

    /// Whether the slot's type and predicate filter applies. Stages that
    /// must see every event to keep references consistent return false.
    fn filtered(&self) -> bool {
        true
    }

    /// Called with the stage's full input before any event hook.
    fn begin_revision(&mut self, _input: &ChangeSet, _ctx: &mut StageContext<'_>) -> Result<()> {
        Ok(())
    }

    fn branch(
        &mut self,
        event: BranchEvent,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        out.branch_events.push(event);
        Ok(())
    }

    fn creation(
        &mut self,
        event: ObjectCreation,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        out.push_creation(event);
        Ok(())
    }

    fn update(
        &mut self,
        event: ItemUpdate,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        out.merge_update(event);
        Ok(())
    }

    fn deletion(
        &mut self,
        event: ItemDeletion,
        out: &mut ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        out.deletions.push(event);
        Ok(())
    }

    /// Called with the stage's output once all events were visited.
    /// Returns the change sets to hand downstream, in revision order.
    fn end_revision(
        &mut self,
        out: ChangeSet,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<ChangeSet>> {
        Ok(vec![out])
    }

    /// Called once at end of input.
    fn finish(&mut self, _ctx: &mut StageContext<'_>) -> Result<Vec<ChangeSet>> {
        Ok(Vec::new())
    }
}
