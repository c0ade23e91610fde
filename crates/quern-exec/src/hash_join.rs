//! The hybrid hash join operator.
//!
//! The join always starts out in memory: the build input is read into the
//! hash row buffer, then the probe input drives lookups. When the buffer
//! fills up first, one of two degradations kicks in:
//!
//! - **Spill to disk**: the remaining build rows are partitioned into a
//!   power-of-two number of chunk-file pairs by a second hash function.
//!   Probe rows are partitioned the same way while they probe the
//!   in-memory portion, and then each pair is joined in turn, refilling the
//!   hash table from its build chunk.
//! - **In-memory with refill** (spilling forbidden): the probe input is
//!   read once per filling of the hash table. Unmatched probe rows of
//!   non-inner joins are captured in a probe-row-saving file between passes
//!   so that no probe row is matched or NULL-extended twice.
//!
//! The operator is a hand-written state machine: each `read` call resumes
//! at the current state, and state-entry methods either produce a row,
//! transition, or both. Everything is single-threaded and cooperative; the
//! session kill flag is polled between states and between rows.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use quern_error::{QuernError, Result};
use quern_rows::{
    TableCollection, TableSet, Workspace, prepare_for_request_row_id, request_row_id,
    row_size_upper_bound,
};
use smallvec::SmallVec;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::arena::ArenaRef;
use crate::chunk::{ChunkFile, ChunkPair, PrefixValue, RecordPrefix};
use crate::condition::{ExtraCondition, JoinCondition, Predicate, construct_join_key};
use crate::row_buffer::{HashJoinRowBuffer, StoreRowResult};
use crate::session::Session;
use crate::source::{ReadState, RowSource};

/// The join variants this operator implements. Full outer join is not one
/// of them; the planner lowers it differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    /// Left outer join with the probe input as the preserved side.
    Outer,
    Semi,
    Anti,
}

/// Ceiling on the number of chunk-file pairs, so that a single join cannot
/// exhaust the process's file descriptors.
pub const MAX_CHUNKS: usize = 128;

/// Seed for the in-memory hash table's hash function.
pub const HASH_TABLE_SEED: u32 = 712_573;

/// Seed for the chunk-partitioning hash function. Deliberately unrelated to
/// [`HASH_TABLE_SEED`]: reloading a chunk into the hash table with the
/// partitioning seed would collapse the table to a handful of buckets,
/// since every key in a chunk already agrees on the partitioning hash's low
/// bits.
pub const CHUNK_PARTITIONING_SEED: u32 = 338_947;

/// Hash value used for zero-length join keys, instead of running the hash
/// function over an empty slice.
const ZERO_KEY_LENGTH_HASH: u64 = 3_847_103_753;

/// Safety margin on the rows-per-chunk estimate: better one chunk too many
/// than re-reading the probe input because a chunk missed fitting in memory.
const CHUNK_ROW_REDUCTION_FACTOR: f64 = 0.9;

/// Operator configuration, fixed at plan time.
#[derive(Debug, Clone)]
pub struct HashJoinConfig {
    /// Memory available to the hash table and its arena, in bytes
    /// (`join_buffer_size`).
    pub max_mem_available: usize,
    /// Upper bound on chunk pairs; must be a power of two.
    pub max_chunks: usize,
    /// Planner's estimate of the build input's row count.
    pub estimated_build_rows: f64,
    /// When false, the join never touches disk and instead re-reads the
    /// probe input once per hash table refill.
    pub allow_spill_to_disk: bool,
    /// Ask the probe input for batched reads once probing starts.
    pub probe_input_batch_mode: bool,
    /// Ask the build input for batched reads during build phases. The
    /// caller asserts that the build subtree tolerates batch mode (single
    /// table, no condition subquery); the operator does not infer it.
    pub build_input_batch_mode: bool,
    pub hash_table_seed: u32,
    pub chunk_partitioning_seed: u32,
    /// Pack row ids into stored rows, for sibling operators like weedout.
    pub store_rowids: bool,
    pub tables_to_get_rowid_for: TableSet,
}

impl Default for HashJoinConfig {
    fn default() -> Self {
        Self {
            max_mem_available: 256 * 1024,
            max_chunks: MAX_CHUNKS,
            estimated_build_rows: 0.0,
            allow_spill_to_disk: true,
            probe_input_batch_mode: false,
            build_input_batch_mode: false,
            hash_table_seed: HASH_TABLE_SEED,
            chunk_partitioning_seed: CHUNK_PARTITIONING_SEED,
            store_rowids: false,
            tables_to_get_rowid_for: TableSet::EMPTY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading a probe row from the probe iterator.
    ReadingRowFromProbeIterator,
    /// Reading a probe row from the current chunk pair's probe file.
    ReadingRowFromProbeChunkFile,
    /// Reading a probe row from the probe-row-saving file.
    ReadingRowFromProbeRowSavingFile,
    /// Moving to the next chunk pair and loading its build side.
    LoadingNextChunkPair,
    /// Emitting the first match (or miss) for the current probe row.
    ReadingFirstRowFromHashTable,
    /// Emitting further matches for the current probe row.
    ReadingFromHashTable,
    EndOfRows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashJoinMode {
    InMemory,
    InMemoryWithRefill,
    SpillToDisk,
}

enum JoinedRowOutcome {
    Row,
    NoMore,
}

/// The hash join operator. Exposes the standard row-source interface to
/// its parent; both children are owned and driven from here.
pub struct HashJoin {
    session: Arc<Session>,
    state: State,
    mode: HashJoinMode,
    join_type: JoinType,
    config: HashJoinConfig,

    build_input: Box<dyn RowSource>,
    probe_input: Box<dyn RowSource>,
    build_tables: TableCollection,
    probe_tables: TableCollection,

    row_buffer: HashJoinRowBuffer,
    join_conditions: SmallVec<[JoinCondition; 4]>,
    extra_condition: Option<ExtraCondition>,

    chunk_files: Vec<ChunkPair>,
    /// Index of the chunk pair being consumed; -1 before the first.
    current_chunk: i32,
    build_chunk_current_row: u64,
    probe_chunk_current_row: u64,

    probe_row_saving_write_file: Option<ChunkFile>,
    probe_row_saving_read_file: Option<ChunkFile>,
    probe_row_saving_read_file_current_row: u64,
    write_to_probe_row_saving: bool,
    read_from_probe_row_saving: bool,

    /// Whether the current probe row has matched in this or any earlier
    /// pass (carried through chunk and saving-file match flags).
    probe_row_match_flag: bool,
    build_iterator_has_more_rows: bool,

    /// Chain cursor into the hash table for the current probe row.
    current_row: Option<ArenaRef>,
    /// Shared buffer for join keys and for rows in flight to chunk files.
    scratch: Vec<u8>,

    hash_table_generation: Option<Arc<AtomicU64>>,
    last_hash_table_generation: u64,
}

impl HashJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        ws: &Workspace,
        build_input: Box<dyn RowSource>,
        build_projections: &[(usize, Vec<usize>)],
        probe_input: Box<dyn RowSource>,
        probe_projections: &[(usize, Vec<usize>)],
        join_conditions: Vec<JoinCondition>,
        extra_conditions: Vec<Box<dyn Predicate>>,
        join_type: JoinType,
        config: HashJoinConfig,
        hash_table_generation: Option<Arc<AtomicU64>>,
    ) -> Self {
        let build_tables = TableCollection::new(
            ws,
            build_projections,
            config.store_rowids,
            config.tables_to_get_rowid_for,
        );
        let probe_tables = TableCollection::new(
            ws,
            probe_projections,
            config.store_rowids,
            config.tables_to_get_rowid_for,
        );
        let row_buffer = HashJoinRowBuffer::new(
            build_tables.clone(),
            join_conditions.clone(),
            config.max_mem_available,
        );
        Self {
            session,
            state: State::ReadingRowFromProbeIterator,
            mode: HashJoinMode::InMemory,
            join_type,
            config,
            build_input,
            probe_input,
            build_tables,
            probe_tables,
            row_buffer,
            join_conditions: join_conditions.into_iter().collect(),
            extra_condition: ExtraCondition::from_list(extra_conditions),
            chunk_files: Vec::new(),
            current_chunk: -1,
            build_chunk_current_row: 0,
            probe_chunk_current_row: 0,
            probe_row_saving_write_file: None,
            probe_row_saving_read_file: None,
            probe_row_saving_read_file_current_row: 0,
            write_to_probe_row_saving: false,
            read_from_probe_row_saving: false,
            probe_row_match_flag: false,
            build_iterator_has_more_rows: true,
            current_row: None,
            scratch: Vec::new(),
            hash_table_generation,
            last_hash_table_generation: 0,
        }
    }

    /// Whether the join has degraded to on-disk processing.
    pub fn on_disk(&self) -> bool {
        !self.chunk_files.is_empty()
    }

    /// Number of chunk pairs allocated for on-disk processing.
    pub fn chunk_count(&self) -> usize {
        self.chunk_files.len()
    }

    /// Build rows skipped because their join key contained SQL NULL.
    pub fn skipped_null_key_rows(&self) -> u64 {
        self.row_buffer.skipped_null_keys()
    }

    /// No-op: output rows may have traveled through chunk files, so the
    /// children's row locks no longer correspond to the current row.
    pub fn unlock_row(&self) {}

    fn reject_duplicate_keys(&self) -> bool {
        // A semijoin needs only one match per key. With a residual
        // condition attached, duplicates must be kept: the condition may
        // reject some of them.
        self.join_type == JoinType::Semi && self.extra_condition.is_none()
    }

    fn is_degenerate_antijoin(&self) -> bool {
        self.join_type == JoinType::Anti
            && self.join_conditions.is_empty()
            && self.extra_condition.is_none()
            && !self.row_buffer.is_empty()
    }

    fn init_probe_iterator(&mut self, ws: &mut Workspace) -> Result<()> {
        debug_assert_eq!(self.state, State::ReadingRowFromProbeIterator);
        self.probe_input.init(ws)?;
        if self.config.probe_input_batch_mode {
            self.probe_input.start_batch_mode();
        }
        Ok(())
    }

    fn do_init(&mut self, ws: &mut Workspace) -> Result<()> {
        if self.config.hash_table_seed == self.config.chunk_partitioning_seed {
            return Err(QuernError::internal(
                "hash table seed and chunk partitioning seed must differ",
            ));
        }
        if !self.config.max_chunks.is_power_of_two() {
            return Err(QuernError::internal("max_chunks must be a power of two"));
        }

        // If the join stayed fully in memory last time and the build input
        // has not changed since, reuse the hash table instead of
        // rebuilding. This pays off when the join sits on the inner side
        // of a nested loop and is re-initialized once per outer row.
        if self.row_buffer.initialized()
            && (self.mode == HashJoinMode::InMemory
                || (self.mode == HashJoinMode::SpillToDisk && self.chunk_files.is_empty()))
            && self
                .hash_table_generation
                .as_ref()
                .is_some_and(|generation| {
                    generation.load(Ordering::Relaxed) == self.last_hash_table_generation
                })
        {
            // A stale match flag from the previous execution could
            // suppress NULL-extension for the first probe row.
            self.probe_row_match_flag = false;
            self.probe_chunk_current_row = 0;
            self.current_chunk = -1;
            self.mode = HashJoinMode::InMemory;

            if self.is_degenerate_antijoin() {
                warn!("degenerate antijoin with no conditions eliminates every probe row");
                self.state = State::EndOfRows;
                return Ok(());
            }
            self.state = State::ReadingRowFromProbeIterator;
            self.probe_input.end_batch_mode();
            return self.init_probe_iterator(ws);
        }

        prepare_for_request_row_id(&self.build_tables, self.config.tables_to_get_rowid_for, ws);
        self.build_input.init(ws)?;

        // Everything starts out in memory.
        self.mode = HashJoinMode::InMemory;
        self.write_to_probe_row_saving = false;
        self.build_iterator_has_more_rows = true;
        self.probe_input.end_batch_mode();
        self.probe_row_match_flag = false;

        // Size the scratch buffer for the larger of the two inputs' rows.
        // With blob columns in play the bound moves per row, so the buffer
        // grows on demand instead.
        let mut upper_row_size = 0;
        if !self.build_tables.has_blob_column() {
            upper_row_size = row_size_upper_bound(&self.build_tables, ws);
        }
        if !self.probe_tables.has_blob_column() {
            upper_row_size = upper_row_size.max(row_size_upper_bound(&self.probe_tables, ws));
        }
        self.scratch.reserve(upper_row_size);

        // Close any leftover files from previous executions.
        self.chunk_files.clear();
        self.build_chunk_current_row = 0;
        self.probe_chunk_current_row = 0;
        self.current_chunk = -1;

        prepare_for_request_row_id(&self.probe_tables, self.config.tables_to_get_rowid_for, ws);

        self.build_hash_table(ws)?;
        if let Some(generation) = &self.hash_table_generation {
            self.last_hash_table_generation = generation.load(Ordering::Relaxed);
        }

        if self.state == State::EndOfRows {
            // The build input was empty and the join variant cannot
            // produce NULL-extended probe rows.
            return Ok(());
        }

        if self.is_degenerate_antijoin() {
            // Every probe row would be eliminated. The planner puts a
            // LIMIT 1 around degenerate antijoins, so ending here is both
            // correct and cheap.
            warn!("degenerate antijoin with no conditions eliminates every probe row");
            self.state = State::EndOfRows;
            return Ok(());
        }

        self.init_probe_iterator(ws)
    }

    /// Read the build input into the hash table until it is exhausted or
    /// the buffer fills up, degrading per configuration in the latter case.
    fn build_hash_table(&mut self, ws: &mut Workspace) -> Result<()> {
        if !self.build_iterator_has_more_rows {
            self.state = State::EndOfRows;
            return Ok(());
        }

        // Operators below the build input may read the build tables'
        // record buffers as part of their own state, and the last row the
        // probe phase decoded into them is rarely the last row the build
        // iterator produced. Put that row back before tearing the map down.
        if self.row_buffer.initialized() {
            if let Some(last) = self.row_buffer.last_row_stored() {
                self.row_buffer.load_row_into_buffers(ws, last);
            }
        }

        self.row_buffer.init(self.config.hash_table_seed, ws);
        self.current_row = None;

        // A previous execution of this join may have left the NULL-row
        // flag set on the build tables.
        self.build_input.set_null_row_flag(ws, false);

        if self.config.build_input_batch_mode {
            self.build_input.start_batch_mode();
        }
        let result = self.build_hash_table_loop(ws);
        if self.config.build_input_batch_mode {
            self.build_input.end_batch_mode();
        }
        result
    }

    fn build_hash_table_loop(&mut self, ws: &mut Workspace) -> Result<()> {
        let reject_duplicate_keys = self.reject_duplicate_keys();
        loop {
            self.session.check_killed()?;
            match self.build_input.read(ws)? {
                ReadState::Eof => {
                    self.build_iterator_has_more_rows = false;
                    // An empty build input empties inner joins and
                    // semijoins; anti and outer joins still owe the probe
                    // side its NULL-extended rows.
                    if self.row_buffer.is_empty()
                        && self.join_type != JoinType::Anti
                        && self.join_type != JoinType::Outer
                    {
                        self.state = State::EndOfRows;
                        return Ok(());
                    }
                    // This was the last pass over the probe input, so no
                    // probe rows need to be saved for another pass.
                    self.write_to_probe_row_saving = false;
                    self.set_reading_probe_row_state();
                    return Ok(());
                }
                ReadState::Row => {}
            }
            request_row_id(&self.build_tables, self.config.tables_to_get_rowid_for, ws);

            match self.row_buffer.store_row(ws, reject_duplicate_keys, false)? {
                StoreRowResult::RowStored => {}
                StoreRowResult::BufferFull => {
                    // Fullness is reported after the row is stored, so the
                    // buffer always holds at least one row here.
                    debug_assert!(!self.row_buffer.is_empty());

                    if !self.config.allow_spill_to_disk {
                        if self.join_type != JoinType::Inner {
                            // Later passes must only see probe rows that
                            // have not already matched or been emitted.
                            self.init_writing_to_probe_row_saving_file()?;
                        }
                        debug!(
                            rows_in_memory = self.row_buffer.len(),
                            "hash table full, probing before an in-memory refill"
                        );
                        self.set_reading_probe_row_state();
                        return Ok(());
                    }

                    self.initialize_chunk_files()?;
                    debug!(
                        chunks = self.chunk_files.len(),
                        rows_in_memory = self.row_buffer.len(),
                        "hash table full, partitioning remaining build rows to disk"
                    );
                    // The rows already in the hash table stay there; only
                    // the remainder of the build input goes to disk. The
                    // probe input is partitioned later, while it probes the
                    // in-memory portion. Build rows with NULL in the join
                    // key can never match and are not written at all.
                    self.write_remaining_build_rows_to_chunks(ws)?;
                    for pair in &mut self.chunk_files {
                        pair.build_chunk.rewind()?;
                    }
                    self.set_reading_probe_row_state();
                    return Ok(());
                }
            }
        }
    }

    /// Create the chunk-file pairs, estimating how many chunks are needed
    /// for each build chunk to fit back into the hash table, assuming the
    /// rows seen so far are representative.
    fn initialize_chunk_files(&mut self) -> Result<()> {
        debug_assert!(self.chunk_files.is_empty());
        let rows_in_hash_table = self.row_buffer.len() as f64;
        let reduced_rows_per_chunk = (rows_in_hash_table * CHUNK_ROW_REDUCTION_FACTOR).max(1.0);
        let remaining_rows =
            self.config.estimated_build_rows.max(rows_in_hash_table) - rows_in_hash_table;
        let chunks_needed = ((remaining_rows / reduced_rows_per_chunk).ceil() as usize).max(1);
        let num_chunks = chunks_needed.min(self.config.max_chunks).next_power_of_two();

        let include_match_flag_for_probe = self.join_type == JoinType::Outer;
        for _ in 0..num_chunks {
            self.chunk_files.push(ChunkPair {
                build_chunk: ChunkFile::new(self.build_tables.clone(), RecordPrefix::None)?,
                probe_chunk: ChunkFile::new(
                    self.probe_tables.clone(),
                    if include_match_flag_for_probe {
                        RecordPrefix::MatchFlag
                    } else {
                        RecordPrefix::None
                    },
                )?,
            });
        }
        Ok(())
    }

    fn write_remaining_build_rows_to_chunks(&mut self, ws: &mut Workspace) -> Result<()> {
        loop {
            self.session.check_killed()?;
            match self.build_input.read(ws)? {
                ReadState::Eof => return Ok(()),
                ReadState::Row => {}
            }
            request_row_id(&self.build_tables, self.config.tables_to_get_rowid_for, ws);
            self.write_row_to_chunk(
                ws,
                /*write_to_build_chunk=*/ true,
                /*row_has_match=*/ false,
                /*write_rows_with_null_in_join_key=*/ false,
            )?;
        }
    }

    /// Route the current row to its chunk pair by the partitioning hash.
    fn write_row_to_chunk(
        &mut self,
        ws: &Workspace,
        write_to_build_chunk: bool,
        row_has_match: bool,
        write_rows_with_null_in_join_key: bool,
    ) -> Result<()> {
        let tables = if write_to_build_chunk {
            &self.build_tables
        } else {
            &self.probe_tables
        };
        let null_in_key = construct_join_key(
            ws,
            &self.join_conditions,
            tables.tables_bitmap(),
            &mut self.scratch,
        )?;
        if null_in_key && !write_rows_with_null_in_join_key {
            // NULL never matches in inner joins and semijoins; the planner
            // usually filters these rows out earlier, but not always.
            return Ok(());
        }

        let join_key_hash = if self.scratch.is_empty() {
            ZERO_KEY_LENGTH_HASH
        } else {
            xxh3_64_with_seed(
                &self.scratch,
                u64::from(self.config.chunk_partitioning_seed),
            )
        };

        // The chunk count is a power of two, so the modulo is a mask.
        debug_assert!(self.chunk_files.len().is_power_of_two());
        let chunk_index = (join_key_hash & (self.chunk_files.len() as u64 - 1)) as usize;
        let pair = &mut self.chunk_files[chunk_index];
        if write_to_build_chunk {
            pair.build_chunk
                .write_row(ws, &mut self.scratch, PrefixValue::None)
        } else {
            let prefix = match pair.probe_chunk.prefix_kind() {
                RecordPrefix::MatchFlag => PrefixValue::Matched(row_has_match),
                _ => PrefixValue::None,
            };
            pair.probe_chunk.write_row(ws, &mut self.scratch, prefix)
        }
    }

    /// Advance to the next chunk pair if the current one is consumed, and
    /// (re)fill the hash table from the build chunk.
    fn read_next_hash_join_chunk(&mut self, ws: &mut Workspace) -> Result<()> {
        let mut move_to_next_chunk = false;
        if self.current_chunk == -1 {
            move_to_next_chunk = true;
        } else {
            let pair = &self.chunk_files[self.current_chunk as usize];
            if self.build_chunk_current_row >= pair.build_chunk.num_rows() {
                // Every build row of this pair has been through the table.
                move_to_next_chunk = true;
            } else if pair.probe_chunk.num_rows() == 0 {
                // Nothing will ever probe the rest of this build chunk.
                move_to_next_chunk = true;
            }
        }

        if move_to_next_chunk {
            self.current_chunk += 1;
            self.build_chunk_current_row = 0;
            // A fresh pair reads its probe rows from the chunk file, not
            // from the previous pair's saving file.
            self.read_from_probe_row_saving = false;
        }

        if self.current_chunk as usize == self.chunk_files.len() {
            self.state = State::EndOfRows;
            return Ok(());
        }
        debug!(chunk = self.current_chunk, "loading next chunk pair");

        self.row_buffer.init(self.config.hash_table_seed, ws);
        self.current_row = None;

        let reject_duplicate_keys = self.reject_duplicate_keys();
        let num_rows = self.chunk_files[self.current_chunk as usize]
            .build_chunk
            .num_rows();
        while self.build_chunk_current_row < num_rows {
            self.session.check_killed()?;
            let build_chunk = &mut self.chunk_files[self.current_chunk as usize].build_chunk;
            build_chunk.read_row(ws, &mut self.scratch)?;
            match self.row_buffer.store_row(ws, reject_duplicate_keys, false)? {
                StoreRowResult::RowStored => {
                    self.build_chunk_current_row += 1;
                }
                StoreRowResult::BufferFull => {
                    // The row that filled the buffer was stored; probe
                    // against what fits and resume this chunk afterwards.
                    debug_assert!(!self.row_buffer.is_empty());
                    self.build_chunk_current_row += 1;
                    break;
                }
            }
        }

        self.chunk_files[self.current_chunk as usize]
            .probe_chunk
            .rewind()?;
        self.probe_chunk_current_row = 0;
        self.set_reading_probe_row_state();

        if self.build_chunk_current_row < num_rows && self.join_type != JoinType::Inner {
            // The build chunk did not fit, so the probe chunk will be read
            // once per refill. Unmatched probe rows go to the saving file
            // so the next pass cannot match or NULL-extend a row twice.
            self.init_writing_to_probe_row_saving_file()?;
        } else {
            self.write_to_probe_row_saving = false;
        }
        Ok(())
    }

    fn read_row_from_probe_iterator(&mut self, ws: &mut Workspace) -> Result<()> {
        debug_assert_eq!(self.current_chunk, -1);
        match self.probe_input.read(ws)? {
            ReadState::Row => {
                request_row_id(&self.probe_tables, self.config.tables_to_get_rowid_for, ws);
                return self.lookup_probe_row_in_hash_table(ws);
            }
            ReadState::Eof => {}
        }

        self.probe_input.end_batch_mode();

        if self.config.allow_spill_to_disk {
            // Either we have degraded to disk (chunk pairs exist and take
            // over from here), or the whole join ran in memory and the
            // chunk-loading state observes zero pairs and finishes.
            self.mode = HashJoinMode::SpillToDisk;
            self.state = State::LoadingNextChunkPair;
            return Ok(());
        }

        self.mode = HashJoinMode::InMemoryWithRefill;
        if self.write_to_probe_row_saving {
            // Swap the saving file to reading *before* the refill, which
            // would otherwise clear the very rows we are about to read.
            self.init_reading_from_probe_row_saving_file()?;
        }

        self.build_hash_table(ws)?;
        match self.state {
            // The refill found the build input exhausted and the join done.
            State::EndOfRows => Ok(()),
            State::ReadingRowFromProbeIterator => self.init_probe_iterator(ws),
            // The saving file was already positioned for reading above.
            State::ReadingRowFromProbeRowSavingFile => Ok(()),
            _ => Err(QuernError::internal(
                "unexpected state after hash table refill",
            )),
        }
    }

    fn read_row_from_probe_chunk_file(&mut self, ws: &mut Workspace) -> Result<()> {
        debug_assert!(self.on_disk() && self.current_chunk != -1);
        let probe_rows = self.chunk_files[self.current_chunk as usize]
            .probe_chunk
            .num_rows();
        if self.probe_chunk_current_row >= probe_rows {
            if self.write_to_probe_row_saving {
                // The build chunk was loaded partially; the next pass
                // probes the unmatched remainder from the saving file.
                self.init_reading_from_probe_row_saving_file()?;
            } else {
                self.read_from_probe_row_saving = false;
            }
            self.state = State::LoadingNextChunkPair;
            return Ok(());
        }

        let probe_chunk = &mut self.chunk_files[self.current_chunk as usize].probe_chunk;
        if let PrefixValue::Matched(matched) = probe_chunk.read_row(ws, &mut self.scratch)? {
            self.probe_row_match_flag = matched;
        }
        self.probe_chunk_current_row += 1;
        self.lookup_probe_row_in_hash_table(ws)
    }

    fn read_row_from_probe_row_saving_file(&mut self, ws: &mut Workspace) -> Result<()> {
        let saved_rows = self
            .probe_row_saving_read_file
            .as_ref()
            .map_or(0, ChunkFile::num_rows);
        if self.probe_row_saving_read_file_current_row >= saved_rows {
            if self.write_to_probe_row_saving {
                // Another pass produced another generation of unmatched
                // probe rows; swap it in.
                self.init_reading_from_probe_row_saving_file()?;
            } else {
                self.read_from_probe_row_saving = false;
            }

            if self.mode == HashJoinMode::SpillToDisk {
                self.state = State::LoadingNextChunkPair;
                return Ok(());
            }
            debug_assert_eq!(self.mode, HashJoinMode::InMemoryWithRefill);

            self.build_hash_table(ws)?;
            if self.state == State::EndOfRows {
                return Ok(());
            }
            self.set_reading_probe_row_state();
            return Ok(());
        }

        let file = self
            .probe_row_saving_read_file
            .as_mut()
            .ok_or_else(|| QuernError::internal("probe-row-saving file missing while reading"))?;
        if let PrefixValue::Matched(matched) = file.read_row(ws, &mut self.scratch)? {
            self.probe_row_match_flag = matched;
        }
        self.probe_row_saving_read_file_current_row += 1;
        self.lookup_probe_row_in_hash_table(ws)
    }

    /// Position the chain cursor for the probe row now in the record
    /// buffers, dispatching NULL keys per join-type semantics.
    fn lookup_probe_row_in_hash_table(&mut self, ws: &mut Workspace) -> Result<()> {
        if self.join_conditions.is_empty() {
            // No equi-conditions: every stored row shares the empty key,
            // so the lookup degenerates to scanning the one chain.
            self.current_row = self.row_buffer.first_chain();
            self.state = State::ReadingFirstRowFromHashTable;
            return Ok(());
        }

        let null_in_key = construct_join_key(
            ws,
            &self.join_conditions,
            self.probe_tables.tables_bitmap(),
            &mut self.scratch,
        )?;
        if null_in_key {
            match self.join_type {
                JoinType::Anti | JoinType::Outer => {
                    // NULL can never match, which for these variants means
                    // the NULL-extended emission path, not a skip.
                    self.current_row = None;
                    self.state = State::ReadingFirstRowFromHashTable;
                }
                JoinType::Inner | JoinType::Semi => self.set_reading_probe_row_state(),
            }
            return Ok(());
        }

        self.current_row = self.row_buffer.find(&self.scratch);
        self.state = State::ReadingFirstRowFromHashTable;
        Ok(())
    }

    /// Decode the current chain entry into the build tables' buffers.
    /// Returns whether a row was ready.
    fn read_joined_row(&self, ws: &mut Workspace) -> bool {
        match self.current_row {
            Some(row) => {
                self.row_buffer.load_row_into_buffers(ws, row);
                true
            }
            None => false,
        }
    }

    /// Once the first lookup for a probe row has resolved, write the row
    /// onward if this pass cannot finally decide its fate: to its probe
    /// chunk during the partitioning pass, and to the saving file when
    /// later passes will probe it again. Semijoins and antijoins skip rows
    /// that already found their match; inner and outer joins forward every
    /// row (outer joins even with NULL in the join key, since the probe
    /// side is preserved regardless).
    fn write_probe_row_to_disk_if_applicable(&mut self, ws: &Workspace) -> Result<()> {
        // Outer and anti joins preserve probe rows whose join key is SQL
        // NULL, and during the partitioning pass their emission is
        // deferred; dropping them from the chunk files would lose them.
        let write_rows_with_null_in_join_key =
            matches!(self.join_type, JoinType::Outer | JoinType::Anti);
        if self.state != State::ReadingFirstRowFromHashTable {
            return Ok(());
        }
        let found_match = self.current_row.is_some();
        if matches!(self.join_type, JoinType::Inner | JoinType::Outer) || !found_match {
            if self.on_disk() && self.current_chunk == -1 {
                self.write_row_to_chunk(
                    ws,
                    /*write_to_build_chunk=*/ false,
                    found_match,
                    write_rows_with_null_in_join_key,
                )?;
            }

            if self.write_to_probe_row_saving {
                let carried_flag = found_match || self.probe_row_match_flag;
                let file = self.probe_row_saving_write_file.as_mut().ok_or_else(|| {
                    QuernError::internal("probe-row-saving file missing while writing")
                })?;
                let prefix = match file.prefix_kind() {
                    RecordPrefix::MatchFlag => PrefixValue::Matched(carried_flag),
                    _ => PrefixValue::None,
                };
                file.write_row(ws, &mut self.scratch, prefix)?;
            }
        }
        Ok(())
    }

    fn read_next_joined_row_from_hash_table(
        &mut self,
        ws: &mut Workspace,
    ) -> Result<JoinedRowOutcome> {
        let mut row_ready;
        loop {
            self.session.check_killed()?;
            row_ready = self.read_joined_row(ws);
            if !row_ready {
                break;
            }
            let passes = match &self.extra_condition {
                Some(condition) => condition.evaluate(ws)?,
                None => true,
            };
            if passes {
                break;
            }
            // Skip to the next chain entry without leaving the first-row
            // state: the disk bookkeeping below must know whether any row
            // passed both the join condition and the residual condition.
            self.current_row = self
                .current_row
                .and_then(|row| self.row_buffer.chain_next(row));
        }

        self.write_probe_row_to_disk_if_applicable(ws)?;

        if !row_ready {
            // No (further) match. NULL-extension must wait if a later pass
            // could still match this probe row: during the partitioning
            // pass, and whenever the row was saved for another pass.
            let defer_decision = (self.on_disk() && self.current_chunk == -1)
                || self.write_to_probe_row_saving;
            let return_null_complemented_row = if defer_decision {
                false
            } else if self.join_type == JoinType::Anti {
                true
            } else {
                self.join_type == JoinType::Outer
                    && self.state == State::ReadingFirstRowFromHashTable
                    && !self.probe_row_match_flag
            };

            self.set_reading_probe_row_state();
            if return_null_complemented_row {
                self.build_input.set_null_row_flag(ws, true);
                return Ok(JoinedRowOutcome::Row);
            }
            return Ok(JoinedRowOutcome::NoMore);
        }

        match self.join_type {
            JoinType::Semi => {
                // One match suffices; move on to the next probe row.
                self.set_reading_probe_row_state();
            }
            JoinType::Anti => {
                // A match eliminates the probe row; emit nothing.
                self.set_reading_probe_row_state();
                return Ok(JoinedRowOutcome::NoMore);
            }
            JoinType::Inner | JoinType::Outer => {
                self.state = State::ReadingFromHashTable;
            }
        }

        self.current_row = self
            .current_row
            .and_then(|row| self.row_buffer.chain_next(row));
        Ok(JoinedRowOutcome::Row)
    }

    fn init_writing_to_probe_row_saving_file(&mut self) -> Result<()> {
        self.write_to_probe_row_saving = true;
        let prefix = if self.join_type == JoinType::Outer {
            RecordPrefix::MatchFlag
        } else {
            RecordPrefix::None
        };
        self.probe_row_saving_write_file =
            Some(ChunkFile::new(self.probe_tables.clone(), prefix)?);
        Ok(())
    }

    /// The write file becomes the read file for the next pass.
    fn init_reading_from_probe_row_saving_file(&mut self) -> Result<()> {
        let mut file = self
            .probe_row_saving_write_file
            .take()
            .ok_or_else(|| QuernError::internal("probe-row-saving file missing at swap"))?;
        file.rewind()?;
        self.probe_row_saving_read_file = Some(file);
        self.probe_row_saving_read_file_current_row = 0;
        self.read_from_probe_row_saving = true;
        Ok(())
    }

    /// Pick the probe-row source appropriate to the current hash mode.
    fn set_reading_probe_row_state(&mut self) {
        match self.mode {
            HashJoinMode::InMemory => self.state = State::ReadingRowFromProbeIterator,
            HashJoinMode::InMemoryWithRefill => {
                if self.join_type == JoinType::Inner {
                    // Inner joins never activate probe row saving: re-reads
                    // cannot double-emit, since each pass holds disjoint
                    // build rows.
                    self.state = State::ReadingRowFromProbeIterator;
                } else {
                    self.state = State::ReadingRowFromProbeRowSavingFile;
                }
            }
            HashJoinMode::SpillToDisk => {
                if self.read_from_probe_row_saving {
                    self.state = State::ReadingRowFromProbeRowSavingFile;
                } else {
                    self.state = State::ReadingRowFromProbeChunkFile;
                }
            }
        }
    }
}

impl RowSource for HashJoin {
    fn init(&mut self, ws: &mut Workspace) -> Result<()> {
        self.do_init(ws)
    }

    fn read(&mut self, ws: &mut Workspace) -> Result<ReadState> {
        loop {
            self.session.check_killed()?;
            match self.state {
                State::LoadingNextChunkPair => self.read_next_hash_join_chunk(ws)?,
                State::ReadingRowFromProbeIterator => self.read_row_from_probe_iterator(ws)?,
                State::ReadingRowFromProbeChunkFile => self.read_row_from_probe_chunk_file(ws)?,
                State::ReadingRowFromProbeRowSavingFile => {
                    self.read_row_from_probe_row_saving_file(ws)?;
                }
                State::ReadingFirstRowFromHashTable | State::ReadingFromHashTable => {
                    if let JoinedRowOutcome::Row = self.read_next_joined_row_from_hash_table(ws)? {
                        return Ok(ReadState::Row);
                    }
                }
                State::EndOfRows => return Ok(ReadState::Eof),
            }
        }
    }

    fn set_null_row_flag(&mut self, ws: &mut Workspace, is_null_row: bool) {
        self.build_input.set_null_row_flag(ws, is_null_row);
        self.probe_input.set_null_row_flag(ws, is_null_row);
    }

    fn end_batch_mode(&mut self) {
        self.build_input.end_batch_mode();
        self.probe_input.end_batch_mode();
    }
}
