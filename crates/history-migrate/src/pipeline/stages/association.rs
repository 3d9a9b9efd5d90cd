//! Association inlining.
//!
//! A link object `L { target_object: S, reference_value: D }` is folded into
//! its endpoint as `S.reference_name = D`. Link creations become updates of
//! `S`; link deletions null the reference again, unless `S` itself goes away
//! in the same revision. Inlined links are never updated in place: an update
//! of one is a structural error and the event is dropped. Links the slot
//! filter kept out stay objects, so their later events pass through.

use crate::config::StageConfig;
use crate::core::{
    AttributeChange, AttributeKind, ChangeSet, ItemDeletion, ItemUpdate, ObjectCreation,
    ObjectIdentity, Value,
};
use crate::error::{MigrateError, Result};
use crate::index::{IndexHandle, SELF_ATTRIBUTE};
use crate::pipeline::registry::{stage_params, BuildContext};
use crate::pipeline::stage::{Stage, StageContext};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct AssociationParams {
    /// Type of the link objects.
    pub association_type: String,
    /// Link attribute referencing the endpoint that receives the reference.
    pub target_object: String,
    /// Attribute set on the endpoint.
    pub reference_name: String,
    /// Link attribute holding the value to set.
    pub reference_value: String,
}

pub struct AssociationInline {
    params: AssociationParams,
    links: IndexHandle,
    deleted: BTreeSet<ObjectIdentity>,
    inlined: HashSet<ObjectIdentity>,
}

pub fn build_association_inline(
    config: &StageConfig,
    ctx: &mut BuildContext<'_>,
) -> Result<Box<dyn Stage>> {
    let params: AssociationParams = stage_params(config)?;
    let link = ctx.require_type(&params.association_type)?;
    match link.attribute(&params.target_object) {
        Some(a) if a.kind == AttributeKind::Reference => {}
        Some(_) => {
            return Err(MigrateError::Config(format!(
                "association-inline: {}.{} must be a reference",
                params.association_type, params.target_object
            )))
        }
        None => ctx.require_attribute(&params.association_type, &params.target_object)?,
    }
    ctx.require_attribute(&params.association_type, &params.reference_value)?;

    let links = ctx.indexer.register(
        &params.association_type,
        &[SELF_ATTRIBUTE],
        &[&params.target_object, &params.reference_value],
    )?;
    Ok(Box::new(AssociationInline {
        params,
        links,
        deleted: BTreeSet::new(),
        inlined: HashSet::new(),
    }))
}

impl AssociationInline {
    fn is_link(&self, object: &ObjectIdentity) -> bool {
        object.type_name == self.params.association_type
    }
}

impl Stage for AssociationInline {
    fn name(&self) -> &str {
        "association-inline"
    }

    fn queries_index(&self) -> bool {
        true
    }

    fn begin_revision(&mut self, input: &ChangeSet, _ctx: &mut StageContext<'_>) -> Result<()> {
        self.deleted = input.deleted_objects().into_iter().cloned().collect();
        Ok(())
    }

    fn creation(
        &mut self,
        event: ObjectCreation,
        out: &mut ChangeSet,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        if !self.is_link(&event.object) {
            out.push_creation(event);
            return Ok(());
        }
        let Some(endpoint) = event
            .values
            .get(&self.params.target_object)
            .and_then(Value::as_reference)
        else {
            ctx.structural_error(format!(
                "link {} has no {} endpoint, dropped",
                event.object, self.params.target_object
            ));
            return Ok(());
        };

        let value = event
            .values
            .get(&self.params.reference_value)
            .cloned()
            .unwrap_or_default();
        debug!(
            "Inlining link {} as {}.{}",
            event.object, endpoint.object, self.params.reference_name
        );
        self.inlined.insert(event.object);
        out.merge_update(
            ItemUpdate::new(endpoint.object.clone())
                .with_change(self.params.reference_name.clone(), AttributeChange::set(value)),
        );
        Ok(())
    }

    fn update(
        &mut self,
        event: ItemUpdate,
        out: &mut ChangeSet,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        if !self.inlined.contains(&event.object) {
            out.merge_update(event);
            return Ok(());
        }
        ctx.structural_error(format!(
            "link {} is updated in place, cannot inline it",
            event.object
        ));
        Ok(())
    }

    fn deletion(
        &mut self,
        event: ItemDeletion,
        out: &mut ChangeSet,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        if !self.inlined.remove(&event.object) {
            out.deletions.push(event);
            return Ok(());
        }

        let key = [Value::reference(event.object.clone())];
        let endpoint = ctx
            .indexer
            .get(self.links, &key)
            .and_then(|values| match values {
                [Value::Reference(endpoint), value] => {
                    Some((endpoint.object.clone(), value.clone()))
                }
                _ => None,
            });
        let Some((endpoint, old)) = endpoint else {
            ctx.resolution_error(format!("deleted link {} is not indexed", event.object));
            return Ok(());
        };

        if self.deleted.contains(&endpoint) {
            debug!("Link {} goes away with {}", event.object, endpoint);
            return Ok(());
        }
        out.merge_update(ItemUpdate::new(endpoint).with_change(
            self.params.reference_name.clone(),
            AttributeChange::change(old, Value::Null),
        ));
        Ok(())
    }
}
