//! The in-memory hash row buffer for hash join.
//!
//! Rows from the build input are packed into an arena and indexed by join
//! key. The map itself stores only `(precomputed hash, key offset)` pairs;
//! key bytes live in the arena as length-framed strings and rows as linked
//! strings, so duplicate keys form a chain threaded through the arena with
//! the newest row at the head.
//!
//! Memory accounting happens *after* each insertion: the caller always gets
//! its row stored, and learns from the return value that the buffer is now
//! full. The overflow arena exists to keep that promise when the primary
//! arena's ceiling would otherwise fail the write halfway through.

use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::mem::size_of;

use hashbrown::HashMap;
use hashbrown::hash_map::RawEntryMut;
use quern_error::{QuernError, Result};
use quern_rows::{TableCollection, Workspace, load_into_buffers, row_size_upper_bound, store_into};
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::arena::{ArenaPair, ArenaRef};
use crate::condition::JoinCondition;
use crate::immutable_string::{
    decode_linked_header, decode_with_length, encode_linked_header, encode_with_length,
    required_bytes_for_encode,
};

/// Outcome of a successful [`HashJoinRowBuffer::store_row`] call. Fatal
/// conditions (true out-of-memory, evaluation failures) are reported as
/// errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRowResult {
    /// The row was stored.
    RowStored,
    /// The row was stored, and the buffer is now full.
    BufferFull,
}

/// Smallest buffer size the memory limit can be lowered to. Guarantees that
/// the hash map's initial footprint never fills the buffer on its own, so
/// the first stored row is always admitted.
const MIN_BUFFER_BYTES: usize = 16 * 1024;

const PRIMARY_BLOCK_BYTES: usize = 16 * 1024;
const OVERFLOW_BLOCK_BYTES: usize = 256;

/// A map key: the key's hash, precomputed at insertion, and the arena
/// offset of its length-framed bytes. Equality of the actual key bytes is
/// checked through the arena by the raw-entry match closures; the stored
/// hash keeps table growth from ever needing the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyEntry {
    hash: u64,
    key: ArenaRef,
}

impl Hash for KeyEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Hasher that passes the precomputed hash through unchanged.
#[derive(Default)]
struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | u64::from(b);
        }
    }

    fn write_u64(&mut self, v: u64) {
        self.0 = v;
    }
}

type MapState = BuildHasherDefault<IdentityHasher>;
type Map = HashMap<KeyEntry, Option<ArenaRef>, MapState>;

/// The hash multimap from join key to chain of packed build rows.
pub struct HashJoinRowBuffer {
    join_conditions: SmallVec<[JoinCondition; 4]>,
    tables: TableCollection,
    arenas: ArenaPair,
    map: Map,
    inited: bool,
    /// Scratch for join key construction; never shrinks.
    key_scratch: Vec<u8>,
    /// Ignored and recomputed per row when the tables have a blob column.
    row_size_upper_bound: usize,
    max_mem_available: usize,
    seed: u32,
    last_row_stored: Option<ArenaRef>,
    rows_stored: u64,
    skipped_null_keys: u64,
}

impl HashJoinRowBuffer {
    pub fn new(
        tables: TableCollection,
        join_conditions: Vec<JoinCondition>,
        max_mem_available: usize,
    ) -> Self {
        Self {
            join_conditions: join_conditions.into_iter().collect(),
            tables,
            arenas: ArenaPair::new(PRIMARY_BLOCK_BYTES, OVERFLOW_BLOCK_BYTES),
            map: Map::default(),
            inited: false,
            key_scratch: Vec::new(),
            row_size_upper_bound: 0,
            max_mem_available: max_mem_available.max(MIN_BUFFER_BYTES),
            seed: 0,
            last_row_stored: None,
            rows_stored: 0,
            skipped_null_keys: 0,
        }
    }

    /// Prepare the buffer for storing rows, clearing any previous contents.
    /// The memory limit is lifted until the first row is in, so that row is
    /// always admitted no matter its size.
    pub fn init(&mut self, seed: u32, ws: &Workspace) {
        self.map = Map::default();
        self.arenas.clear();
        self.arenas.primary.set_max_capacity(0);
        self.row_size_upper_bound = row_size_upper_bound(&self.tables, ws);
        self.last_row_stored = None;
        self.rows_stored = 0;
        self.seed = seed;
        self.inited = true;
    }

    pub fn initialized(&self) -> bool {
        self.inited
    }

    /// Number of rows stored in the buffer (duplicates included; skipped
    /// and rejected rows excluded).
    pub fn len(&self) -> usize {
        self.rows_stored as usize
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of distinct keys in the buffer.
    pub fn distinct_keys(&self) -> usize {
        self.map.len()
    }

    pub fn tables(&self) -> &TableCollection {
        &self.tables
    }

    /// The most recently stored row, if any. The build phase restores it
    /// into the record buffers before tearing the map down, because
    /// operators below the join may read those buffers as part of their own
    /// state.
    pub fn last_row_stored(&self) -> Option<ArenaRef> {
        debug_assert!(self.inited);
        self.last_row_stored
    }

    /// Rows skipped because their join key contained SQL NULL.
    pub fn skipped_null_keys(&self) -> u64 {
        self.skipped_null_keys
    }

    /// Store the row currently in the build tables' record buffers, keyed
    /// by the join conditions.
    ///
    /// With `reject_duplicate_keys`, second and later rows with an existing
    /// key are discarded, though still reported as stored. Rows whose key
    /// contains SQL NULL are skipped (they can never match) unless
    /// `store_rows_with_null_in_condition` asks for them.
    pub fn store_row(
        &mut self,
        ws: &Workspace,
        reject_duplicate_keys: bool,
        store_rows_with_null_in_condition: bool,
    ) -> Result<StoreRowResult> {
        debug_assert!(self.inited);
        let mut full = false;

        let mut skip_row = false;
        {
            let Self {
                join_conditions,
                key_scratch,
                tables,
                ..
            } = &mut *self;
            key_scratch.clear();
            let multi_part = join_conditions.len() > 1;
            for condition in join_conditions.iter() {
                let null_in_condition =
                    condition.append_join_key(ws, tables.tables_bitmap(), multi_part, key_scratch)?;
                if null_in_condition && !store_rows_with_null_in_condition {
                    // SQL NULL never matches in an inner join or semijoin.
                    skip_row = true;
                    break;
                }
            }
        }
        if skip_row {
            self.skipped_null_keys += 1;
            return Ok(StoreRowResult::RowStored);
        }

        // Encode the key into the arena. It is only committed if it turns
        // out to be new; a duplicate key's bytes are reclaimed by the next
        // reservation.
        let required_key_bytes = required_bytes_for_encode(self.key_scratch.len());
        let (key_ref, key_bytes_to_commit) = if self.arenas.primary.reserve(required_key_bytes) {
            let offset = self.arenas.primary.window_offset();
            let written = encode_with_length(&self.key_scratch, self.arenas.primary.window());
            (ArenaRef::primary(offset), written)
        } else {
            let (offset, slice) = self
                .arenas
                .overflow
                .alloc(required_key_bytes)?
                .ok_or(QuernError::OutOfMemory {
                    bytes: self.max_mem_available,
                })?;
            encode_with_length(&self.key_scratch, slice);
            (ArenaRef::overflow(offset), 0)
        };

        let hash = xxh3_64_with_seed(&self.key_scratch, u64::from(self.seed));
        let first_row = self.map.is_empty();

        let (inserted, next_ptr) = {
            let Self {
                map,
                arenas,
                key_scratch,
                ..
            } = &mut *self;
            let arenas: &ArenaPair = arenas;
            match map.raw_entry_mut().from_hash(hash, |entry| {
                decode_with_length(arenas.slice(entry.key)).0 == key_scratch.as_slice()
            }) {
                RawEntryMut::Occupied(occupied) => (false, *occupied.get()),
                RawEntryMut::Vacant(vacant) => {
                    vacant.insert_with_hasher(
                        hash,
                        KeyEntry { hash, key: key_ref },
                        None,
                        |entry| entry.hash,
                    );
                    (true, None)
                }
            }
        };

        if inserted {
            // The insertion may have grown the map; re-derive the arena's
            // budget from what the map now occupies. The first row gets the
            // unlimited budget from init until it is stored.
            if !first_row {
                full |= self.apply_memory_budget();
            }
            self.arenas.primary.raw_commit(key_bytes_to_commit)?;
        } else if reject_duplicate_keys {
            return Ok(StoreRowResult::RowStored);
        }

        let row_ref = self.store_linked_row(ws, next_ptr, &mut full)?;

        {
            let Self {
                map,
                arenas,
                key_scratch,
                ..
            } = &mut *self;
            let arenas: &ArenaPair = arenas;
            match map.raw_entry_mut().from_hash(hash, |entry| {
                decode_with_length(arenas.slice(entry.key)).0 == key_scratch.as_slice()
            }) {
                RawEntryMut::Occupied(mut occupied) => *occupied.get_mut() = Some(row_ref),
                RawEntryMut::Vacant(_) => {
                    return Err(QuernError::internal(
                        "hash table entry vanished while storing its row",
                    ));
                }
            }
        }
        self.last_row_stored = Some(row_ref);
        self.rows_stored += 1;

        if first_row {
            // Now that the first row is safely in, apply the ceiling. Any
            // overshoot surfaces on the next store, never on this one.
            self.apply_memory_budget();
            return Ok(StoreRowResult::RowStored);
        }

        if full {
            Ok(StoreRowResult::BufferFull)
        } else {
            Ok(StoreRowResult::RowStored)
        }
    }

    /// Set the primary arena's ceiling to what remains of the budget after
    /// the hash map's own footprint. Returns whether the budget is already
    /// exhausted.
    fn apply_memory_budget(&mut self) -> bool {
        let map_bytes = self.map_footprint();
        if map_bytes >= self.max_mem_available {
            // Zero would mean unlimited, so use the smallest real ceiling.
            self.arenas.primary.set_max_capacity(1);
            true
        } else {
            self.arenas
                .primary
                .set_max_capacity(self.max_mem_available - map_bytes);
            false
        }
    }

    /// Estimated heap footprint of the hash map: one entry plus one control
    /// byte per bucket of usable capacity.
    fn map_footprint(&self) -> usize {
        self.map.capacity() * (size_of::<(KeyEntry, Option<ArenaRef>)>() + 1)
    }

    /// Pack the current build row as a linked string whose successor is
    /// `next`, preferring the primary arena and falling back to overflow
    /// (which marks the buffer full).
    fn store_linked_row(
        &mut self,
        ws: &Workspace,
        next: Option<ArenaRef>,
        full: &mut bool,
    ) -> Result<ArenaRef> {
        let mut upper = self.row_size_upper_bound;
        if self.tables.has_blob_column() {
            upper = row_size_upper_bound(&self.tables, ws);
        }
        let required = required_bytes_for_encode(upper);

        if self.arenas.primary.reserve(required) {
            let this_ref = ArenaRef::primary(self.arenas.primary.window_offset());
            let window = self.arenas.primary.window();
            let header = encode_linked_header(this_ref.raw(), next.map(ArenaRef::raw), window);
            let row_len = store_into(&self.tables, ws, &mut window[header..]);
            // Commit what was actually written, not the upper bound.
            self.arenas.primary.raw_commit(header + row_len)?;
            Ok(this_ref)
        } else {
            let (offset, slice) =
                self.arenas
                    .overflow
                    .alloc(required)?
                    .ok_or(QuernError::OutOfMemory {
                        bytes: self.max_mem_available,
                    })?;
            let this_ref = ArenaRef::overflow(offset);
            let header = encode_linked_header(this_ref.raw(), next.map(ArenaRef::raw), slice);
            store_into(&self.tables, ws, &mut slice[header..]);
            *full = true;
            Ok(this_ref)
        }
    }

    /// Look up the chain head for a join key.
    pub fn find(&self, key: &[u8]) -> Option<ArenaRef> {
        let hash = xxh3_64_with_seed(key, u64::from(self.seed));
        self.map
            .raw_entry()
            .from_hash(hash, |entry| {
                decode_with_length(self.arenas.slice(entry.key)).0 == key
            })
            .and_then(|(_, head)| *head)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// The head of the first chain in the map, in unspecified order. Used
    /// by condition-less lookups, where every row shares the empty key and
    /// the map holds at most one chain.
    pub fn first_chain(&self) -> Option<ArenaRef> {
        self.map.values().next().copied().flatten()
    }

    /// The successor of a stored row in its duplicate chain.
    pub fn chain_next(&self, row: ArenaRef) -> Option<ArenaRef> {
        let (_, next) = decode_linked_header(self.arenas.slice(row), row.raw());
        next.map(ArenaRef::from_raw)
    }

    /// Restore a stored row into the build tables' record buffers.
    pub fn load_row_into_buffers(&self, ws: &mut Workspace, row: ArenaRef) {
        let slice = self.arenas.slice(row);
        let (header, _) = decode_linked_header(slice, row.raw());
        load_into_buffers(&self.tables, ws, &slice[header..]);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quern_rows::{ColumnDef, ColumnType, TableSchema, Value};

    use crate::condition::ColumnRef;

    use super::*;

    const TEST_SEED: u32 = 712_573;

    fn setup(max_mem: usize) -> (Workspace, usize, usize, HashJoinRowBuffer) {
        let schema = Arc::new(TableSchema::new(
            "build",
            vec![
                ColumnDef::new("k", ColumnType::Int64, true),
                ColumnDef::new("payload", ColumnType::VarBytes { max_len: 64 }, false),
            ],
        ));
        let probe_schema = Arc::new(TableSchema::new(
            "probe",
            vec![ColumnDef::new("k", ColumnType::Int64, true)],
        ));
        let mut ws = Workspace::new();
        let build = ws.add_table(schema);
        let probe = ws.add_table(probe_schema);

        let tables = TableCollection::with_all_columns(&ws, &[build]);
        let conditions = vec![JoinCondition::new(
            ColumnRef::new(build, 0),
            ColumnRef::new(probe, 0),
        )];
        let mut buffer = HashJoinRowBuffer::new(tables, conditions, max_mem);
        buffer.init(TEST_SEED, &ws);
        (ws, build, probe, buffer)
    }

    fn set_build_row(ws: &mut Workspace, build: usize, k: i64, payload: &[u8]) {
        ws.table_mut(build)
            .set_row(vec![Value::Int(k), Value::Bytes(payload.to_vec())]);
    }

    fn key_bytes(k: i64) -> Vec<u8> {
        k.to_le_bytes().to_vec()
    }

    #[test]
    fn store_and_find_roundtrip() {
        let (mut ws, build, _probe, mut buffer) = setup(1 << 20);
        set_build_row(&mut ws, build, 42, b"hello");
        assert_eq!(
            buffer.store_row(&ws, false, false).unwrap(),
            StoreRowResult::RowStored
        );

        let head = buffer.find(&key_bytes(42)).expect("stored key");
        // Scribble over the buffers, then restore from the chain.
        set_build_row(&mut ws, build, 0, b"");
        buffer.load_row_into_buffers(&mut ws, head);
        assert_eq!(ws.table(build).value(0), &Value::Int(42));
        assert_eq!(ws.table(build).value(1), &Value::Bytes(b"hello".to_vec()));

        assert!(buffer.find(&key_bytes(7)).is_none());
    }

    #[test]
    fn duplicates_chain_newest_first() {
        let (mut ws, build, _probe, mut buffer) = setup(1 << 20);
        for (i, payload) in [b"first", b"secnd", b"third"].iter().enumerate() {
            set_build_row(&mut ws, build, 1, *payload);
            buffer.store_row(&ws, false, false).unwrap();
            assert_eq!(buffer.distinct_keys(), 1, "all rows share one key ({i})");
        }
        assert_eq!(buffer.len(), 3);

        let mut payloads = Vec::new();
        let mut cursor = buffer.find(&key_bytes(1));
        let mut steps = 0;
        while let Some(row) = cursor {
            buffer.load_row_into_buffers(&mut ws, row);
            if let Value::Bytes(b) = ws.table(build).value(1) {
                payloads.push(b.clone());
            }
            cursor = buffer.chain_next(row);
            steps += 1;
            assert!(steps <= 3, "chain must terminate");
        }
        assert_eq!(payloads, vec![b"third".to_vec(), b"secnd".to_vec(), b"first".to_vec()]);
    }

    #[test]
    fn reject_duplicate_keys_keeps_first_row() {
        let (mut ws, build, _probe, mut buffer) = setup(1 << 20);
        set_build_row(&mut ws, build, 5, b"keep");
        assert_eq!(
            buffer.store_row(&ws, true, false).unwrap(),
            StoreRowResult::RowStored
        );
        set_build_row(&mut ws, build, 5, b"drop");
        assert_eq!(
            buffer.store_row(&ws, true, false).unwrap(),
            StoreRowResult::RowStored
        );

        let head = buffer.find(&key_bytes(5)).unwrap();
        assert!(buffer.chain_next(head).is_none());
        buffer.load_row_into_buffers(&mut ws, head);
        assert_eq!(ws.table(build).value(1), &Value::Bytes(b"keep".to_vec()));
    }

    #[test]
    fn null_keys_are_skipped_and_counted() {
        let (mut ws, build, _probe, mut buffer) = setup(1 << 20);
        ws.table_mut(build)
            .set_row(vec![Value::Null, Value::Bytes(b"x".to_vec())]);
        assert_eq!(
            buffer.store_row(&ws, false, false).unwrap(),
            StoreRowResult::RowStored
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.skipped_null_keys(), 1);

        // Set-operation callers may opt in to storing NULL keys.
        assert_eq!(
            buffer.store_row(&ws, false, true).unwrap(),
            StoreRowResult::RowStored
        );
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn first_row_is_always_admitted() {
        // The limit is clamped to the floor, and the first row exceeds it.
        let (mut ws, build, _probe, mut buffer) = setup(1);
        set_build_row(&mut ws, build, 1, &[b'x'; 64]);
        assert_eq!(
            buffer.store_row(&ws, false, false).unwrap(),
            StoreRowResult::RowStored
        );
    }

    #[test]
    fn buffer_reports_full_and_keeps_the_overflowing_row() {
        let (mut ws, build, _probe, mut buffer) = setup(1);
        let mut stored = 0u64;
        loop {
            set_build_row(&mut ws, build, stored as i64, &[b'p'; 60]);
            let result = buffer.store_row(&ws, false, false).unwrap();
            stored += 1;
            if result == StoreRowResult::BufferFull {
                break;
            }
            assert!(stored < 100_000, "buffer never reported full");
        }
        // The row that triggered fullness is present and findable.
        assert_eq!(buffer.len() as u64, stored);
        assert!(buffer.find(&key_bytes(stored as i64 - 1)).is_some());
    }

    #[test]
    fn init_clears_previous_contents() {
        let (mut ws, build, _probe, mut buffer) = setup(1 << 20);
        set_build_row(&mut ws, build, 9, b"old");
        buffer.store_row(&ws, false, false).unwrap();
        assert!(!buffer.is_empty());

        buffer.init(TEST_SEED, &ws);
        assert!(buffer.is_empty());
        assert!(buffer.find(&key_bytes(9)).is_none());
        assert!(buffer.last_row_stored().is_none());
    }

    #[test]
    fn empty_key_is_storable_and_findable() {
        // A buffer with no join conditions keys every row on the empty
        // string, forming a single chain.
        let schema = Arc::new(TableSchema::new(
            "build",
            vec![ColumnDef::new("v", ColumnType::Int64, false)],
        ));
        let mut ws = Workspace::new();
        let build = ws.add_table(schema);
        let tables = TableCollection::with_all_columns(&ws, &[build]);
        let mut buffer = HashJoinRowBuffer::new(tables, Vec::new(), 1 << 20);
        buffer.init(TEST_SEED, &ws);

        for v in 0..3 {
            ws.table_mut(build).set_row(vec![Value::Int(v)]);
            buffer.store_row(&ws, false, false).unwrap();
        }
        assert_eq!(buffer.distinct_keys(), 1);
        assert_eq!(buffer.len(), 3);

        let mut count = 0;
        let mut cursor = buffer.first_chain();
        while let Some(row) = cursor {
            cursor = buffer.chain_next(row);
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
