//! Row values, table schemas, record buffers and the packed row codec.
//!
//! This crate owns everything the execution operators need in order to treat
//! a row as data: the column type system, the per-query [`Workspace`] of
//! record buffers, and the codec that packs rows spanning several tables
//! into opaque, length-prefixed byte strings (and restores them bit-exactly).

pub mod pack;
pub mod schema;
pub mod value;
pub mod workspace;

pub use pack::{
    TableCollection, load_into_buffers, prepare_for_request_row_id, request_row_id,
    row_size_upper_bound, store_from_buffers, store_into,
};
pub use schema::{ColumnDef, TableSchema, TableSet};
pub use value::{ColumnType, Value};
pub use workspace::{TableBuffer, Workspace};
