//! Core abstractions for history replay.
//!
//! - [`identity`]: revisions, object identities and references
//! - [`value`]: attribute values, index key parts and row cells
//! - [`event`]: creation, update, deletion and branch events grouped per revision
//! - [`schema`]: type directory and table layout
//! - [`columns`]: attribute values to and from row cells

pub mod columns;
pub mod event;
pub mod identity;
pub mod schema;
pub mod value;

pub use event::{
    AttributeChange, Attributes, BranchEvent, ChangeSet, CommitInfo, ItemDeletion, ItemUpdate,
    ObjectCreation,
};
pub use identity::{
    BranchId, HistoryPosition, ObjectId, ObjectIdentity, ObjectReference, Revision, REVISION_MAX,
    TRUNK,
};
pub use schema::{
    AttributeDef, AttributeKind, ColumnDef, SchemaTypes, SqlType, TableDef, TableRows, TypeDef,
    TypeDirectory,
};
pub use value::{KeyPart, SqlValue, Value};
