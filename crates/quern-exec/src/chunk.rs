//! Append-only temporary files of packed rows, used when a hash join
//! degrades to disk.
//!
//! A chunk file holds records of the form `[prefix]? ‖ length ‖ bytes`. The
//! optional one-record prefix is fixed when the file is created: probe-side
//! chunks of an outer join carry a match flag, set-operation spill files
//! carry a chunk-group index, and everything else carries nothing. Making
//! the prefix part of the file's construction keeps the two overlay uses
//! from ever meeting in one file.
//!
//! Files live in the system temp directory under a stable name prefix and
//! vanish when the handle drops. Each file owns a private buffered reader
//! or writer; switching direction goes through the saved read/write
//! positions so that interleaved produce/consume cycles (`rewind`,
//! `set_append`, `continue_read`) resume where they left off.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use quern_error::{QuernError, Result};
use quern_rows::{TableCollection, Workspace, load_into_buffers, store_from_buffers};
use tempfile::TempPath;

/// Name prefix for spill files, so a stray survivor is attributable.
const TEMP_FILE_PREFIX: &str = "quern_join_";

/// Which per-record prefix a chunk file carries. Decided at creation; a
/// file never mixes prefix kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPrefix {
    /// Plain rows.
    None,
    /// One flag byte per row: has this probe row matched in any pass so far.
    MatchFlag,
    /// One `u32` per row: which chunk group of a set operation produced it.
    SetIndex,
}

/// The prefix accompanying a single record, matching the file's
/// [`RecordPrefix`] kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixValue {
    None,
    Matched(bool),
    SetIndex(u32),
}

enum ChunkIo {
    Write(BufWriter<File>),
    Read(BufReader<File>),
    /// Transient state while switching direction.
    Detached,
}

/// One spill file of packed rows.
pub struct ChunkFile {
    tables: TableCollection,
    prefix: RecordPrefix,
    io: ChunkIo,
    /// Deletes the file from disk when the chunk is dropped.
    _path: TempPath,
    num_rows: u64,
    last_read_pos: u64,
    last_write_pos: u64,
}

impl ChunkFile {
    /// Create an empty chunk file in the system temp directory, open for
    /// writing. The file is deleted when the handle drops.
    pub fn new(tables: TableCollection, prefix: RecordPrefix) -> Result<Self> {
        let named = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile()
            .map_err(QuernError::TempFileWrite)?;
        let (file, path) = named.into_parts();
        Ok(Self {
            tables,
            prefix,
            io: ChunkIo::Write(BufWriter::new(file)),
            _path: path,
            num_rows: 0,
            last_read_pos: 0,
            last_write_pos: 0,
        })
    }

    pub fn prefix_kind(&self) -> RecordPrefix {
        self.prefix
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Overwrite the row count, so a caller can track "rows written since a
    /// landmark" across append/read cycles.
    pub fn set_num_rows(&mut self, num_rows: u64) {
        self.num_rows = num_rows;
    }

    /// Pack the current row from the record buffers and append it, with a
    /// prefix matching the file's kind. `scratch` is reused between calls
    /// to avoid per-row allocation.
    pub fn write_row(
        &mut self,
        ws: &Workspace,
        scratch: &mut Vec<u8>,
        prefix: PrefixValue,
    ) -> Result<()> {
        store_from_buffers(&self.tables, ws, scratch);

        let ChunkIo::Write(writer) = &mut self.io else {
            return Err(QuernError::internal("chunk file is not in write mode"));
        };
        match (self.prefix, prefix) {
            (RecordPrefix::None, PrefixValue::None) => {}
            (RecordPrefix::MatchFlag, PrefixValue::Matched(matched)) => {
                writer
                    .write_all(&[u8::from(matched)])
                    .map_err(QuernError::TempFileWrite)?;
            }
            (RecordPrefix::SetIndex, PrefixValue::SetIndex(set_no)) => {
                writer
                    .write_all(&set_no.to_le_bytes())
                    .map_err(QuernError::TempFileWrite)?;
            }
            _ => {
                return Err(QuernError::internal(
                    "record prefix does not match the chunk file's prefix kind",
                ));
            }
        }

        writer
            .write_all(&(scratch.len() as u64).to_le_bytes())
            .map_err(QuernError::TempFileWrite)?;
        writer
            .write_all(scratch)
            .map_err(QuernError::TempFileWrite)?;
        self.num_rows += 1;
        Ok(())
    }

    /// Read the next record into the tables' record buffers, returning its
    /// prefix.
    pub fn read_row(&mut self, ws: &mut Workspace, scratch: &mut Vec<u8>) -> Result<PrefixValue> {
        let ChunkIo::Read(reader) = &mut self.io else {
            return Err(QuernError::internal("chunk file is not in read mode"));
        };

        let prefix = match self.prefix {
            RecordPrefix::None => PrefixValue::None,
            RecordPrefix::MatchFlag => {
                let mut flag = [0u8; 1];
                reader
                    .read_exact(&mut flag)
                    .map_err(QuernError::TempFileRead)?;
                PrefixValue::Matched(flag[0] != 0)
            }
            RecordPrefix::SetIndex => {
                let mut raw = [0u8; 4];
                reader
                    .read_exact(&mut raw)
                    .map_err(QuernError::TempFileRead)?;
                PrefixValue::SetIndex(u32::from_le_bytes(raw))
            }
        };

        let mut raw_len = [0u8; 8];
        reader
            .read_exact(&mut raw_len)
            .map_err(QuernError::TempFileRead)?;
        let length = u64::from_le_bytes(raw_len) as usize;

        scratch.clear();
        scratch.resize(length, 0);
        reader
            .read_exact(scratch)
            .map_err(QuernError::TempFileRead)?;

        load_into_buffers(&self.tables, ws, scratch);
        Ok(prefix)
    }

    fn detach(&mut self) -> Result<File> {
        match std::mem::replace(&mut self.io, ChunkIo::Detached) {
            ChunkIo::Write(writer) => writer
                .into_inner()
                .map_err(|e| QuernError::TempFileWrite(e.into_error())),
            ChunkIo::Read(reader) => Ok(reader.into_inner()),
            ChunkIo::Detached => Err(QuernError::internal("chunk file I/O state poisoned")),
        }
    }

    /// Flush any pending writes and position the file at the start for
    /// reading. The position left behind in the previous mode is saved.
    pub fn rewind(&mut self) -> Result<()> {
        match &mut self.io {
            ChunkIo::Write(writer) => {
                writer.flush().map_err(QuernError::TempFileWrite)?;
                self.last_write_pos = writer
                    .get_mut()
                    .stream_position()
                    .map_err(QuernError::TempFileWrite)?;
            }
            ChunkIo::Read(reader) => {
                self.last_read_pos = reader
                    .stream_position()
                    .map_err(QuernError::TempFileWrite)?;
            }
            ChunkIo::Detached => {
                return Err(QuernError::internal("chunk file I/O state poisoned"));
            }
        }
        let mut file = self.detach()?;
        file.seek(SeekFrom::Start(0))
            .map_err(QuernError::TempFileWrite)?;
        self.io = ChunkIo::Read(BufReader::new(file));
        Ok(())
    }

    /// Leave read mode and resume appending at the saved write position.
    pub fn set_append(&mut self) -> Result<()> {
        let ChunkIo::Read(reader) = &mut self.io else {
            return Err(QuernError::internal("set_append requires read mode"));
        };
        self.last_read_pos = reader
            .stream_position()
            .map_err(QuernError::TempFileWrite)?;
        let mut file = self.detach()?;
        file.seek(SeekFrom::Start(self.last_write_pos))
            .map_err(QuernError::TempFileWrite)?;
        self.io = ChunkIo::Write(BufWriter::new(file));
        Ok(())
    }

    /// Leave write mode and resume reading at the saved read position.
    pub fn continue_read(&mut self) -> Result<()> {
        let ChunkIo::Write(writer) = &mut self.io else {
            return Err(QuernError::internal("continue_read requires write mode"));
        };
        writer.flush().map_err(QuernError::TempFileWrite)?;
        self.last_write_pos = writer
            .get_mut()
            .stream_position()
            .map_err(QuernError::TempFileWrite)?;
        let mut file = self.detach()?;
        file.seek(SeekFrom::Start(self.last_read_pos))
            .map_err(QuernError::TempFileWrite)?;
        self.io = ChunkIo::Read(BufReader::new(file));
        Ok(())
    }
}

/// A `(build, probe)` chunk pair for one partitioning bucket.
pub struct ChunkPair {
    pub build_chunk: ChunkFile,
    pub probe_chunk: ChunkFile,
}
