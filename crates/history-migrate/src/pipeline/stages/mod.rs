//! Built-in stages.

mod association;
mod filters;
mod remap;
mod rewrite;

pub use association::{build_association_inline, AssociationInline, AssociationParams};
pub use filters::{build_attribute_filter, build_type_filter, AttributeFilter, TypeFilter};
pub use remap::{build_id_remap, IdRemap};
pub use rewrite::{build_type_move, build_value_rewrite, TypeMove, ValueRewrite};
