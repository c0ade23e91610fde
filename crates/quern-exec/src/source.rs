//! The pull-based row source abstraction and an in-memory implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use quern_error::Result;
use quern_rows::{Value, Workspace};

/// Outcome of a successful [`RowSource::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// A row is ready in the record buffers.
    Row,
    /// The source is exhausted.
    Eof,
}

/// A pull-based producer of rows into the workspace's record buffers.
///
/// `init` may be called multiple times; each call rewinds the source to its
/// first row. Batch mode is a throughput hint: sources that can prefetch
/// may do so between `start_batch_mode` and `end_batch_mode`, and
/// `end_batch_mode` must be idempotent.
pub trait RowSource {
    fn init(&mut self, ws: &mut Workspace) -> Result<()>;

    fn read(&mut self, ws: &mut Workspace) -> Result<ReadState>;

    /// Set or clear the NULL-row flag on every table this source produces.
    fn set_null_row_flag(&mut self, ws: &mut Workspace, is_null_row: bool);

    fn start_batch_mode(&mut self) {}

    fn end_batch_mode(&mut self) {}
}

/// A scan over rows held in memory, producing into a single table's record
/// buffer. Serves as the storage-level iterator for plan leaves that have
/// already been materialized, and as the workhorse input in tests.
pub struct MemScan {
    table: usize,
    rows: Arc<Vec<Vec<Value>>>,
    cursor: usize,
    /// Number of `init` calls, observable from outside through the shared
    /// counter; multi-pass strategies re-initialize their probe input.
    init_count: Arc<AtomicUsize>,
}

impl MemScan {
    pub fn new(table: usize, rows: Vec<Vec<Value>>) -> Self {
        Self {
            table,
            rows: Arc::new(rows),
            cursor: 0,
            init_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share the init counter, e.g. with a test asserting re-reads.
    pub fn init_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.init_count)
    }
}

impl RowSource for MemScan {
    fn init(&mut self, _ws: &mut Workspace) -> Result<()> {
        self.cursor = 0;
        self.init_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read(&mut self, ws: &mut Workspace) -> Result<ReadState> {
        let Some(row) = self.rows.get(self.cursor) else {
            return Ok(ReadState::Eof);
        };
        let buf = ws.table_mut(self.table);
        buf.set_row(row.clone());
        buf.set_position(self.cursor as u64);
        self.cursor += 1;
        Ok(ReadState::Row)
    }

    fn set_null_row_flag(&mut self, ws: &mut Workspace, is_null_row: bool) {
        ws.table_mut(self.table).set_null_row(is_null_row);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use quern_rows::{ColumnDef, ColumnType, TableSchema};

    use super::*;

    #[test]
    fn scan_produces_rows_then_eof_and_rewinds() {
        let schema = StdArc::new(TableSchema::new(
            "t",
            vec![ColumnDef::new("a", ColumnType::Int64, false)],
        ));
        let mut ws = Workspace::new();
        let t = ws.add_table(schema);
        let mut scan = MemScan::new(t, vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        let inits = scan.init_counter();

        scan.init(&mut ws).unwrap();
        assert_eq!(scan.read(&mut ws).unwrap(), ReadState::Row);
        assert_eq!(ws.table(t).value(0), &Value::Int(1));
        assert_eq!(ws.table(t).position(), Some(0));
        assert_eq!(scan.read(&mut ws).unwrap(), ReadState::Row);
        assert_eq!(scan.read(&mut ws).unwrap(), ReadState::Eof);

        scan.init(&mut ws).unwrap();
        assert_eq!(scan.read(&mut ws).unwrap(), ReadState::Row);
        assert_eq!(ws.table(t).value(0), &Value::Int(1));
        assert_eq!(inits.load(Ordering::Relaxed), 2);
    }
}
