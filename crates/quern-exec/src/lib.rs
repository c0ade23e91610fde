//! Query execution operators for quern.
//!
//! The centerpiece is [`HashJoin`], a hybrid hash join that runs in memory
//! when it can, refills in memory when it must stay off disk, and
//! partitions both inputs into chunk files when it may spill. The
//! supporting cast: an arena allocator with overflow semantics, compact
//! immutable string encodings for hash-table keys and duplicate chains,
//! the in-memory hash row buffer, and spill chunk files.

pub mod arena;
pub mod chunk;
pub mod condition;
pub mod hash_join;
pub mod immutable_string;
pub mod row_buffer;
pub mod session;
pub mod source;

pub use arena::{Arena, ArenaPair, ArenaRef};
pub use chunk::{ChunkFile, ChunkPair, PrefixValue, RecordPrefix};
pub use condition::{ColumnRef, ExtraCondition, JoinCondition, Predicate, construct_join_key};
pub use hash_join::{HashJoin, HashJoinConfig, JoinType, MAX_CHUNKS};
pub use row_buffer::{HashJoinRowBuffer, StoreRowResult};
pub use session::Session;
pub use source::{MemScan, ReadState, RowSource};
