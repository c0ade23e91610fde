//! Record buffers shared between operators.
//!
//! Every table participating in a query has one [`TableBuffer`] holding the
//! row most recently produced for it. Row sources write into these buffers,
//! expression evaluation reads from them, and the join operators save and
//! restore them when rows travel through hash tables or spill files. The
//! [`Workspace`] is just the ordered collection of buffers; table indexes
//! used everywhere else in the engine are positions in this collection.

use std::sync::Arc;

use crate::schema::TableSchema;
use crate::value::Value;

static NULL_VALUE: Value = Value::Null;

/// The record buffer for one table.
#[derive(Debug, Clone)]
pub struct TableBuffer {
    schema: Arc<TableSchema>,
    values: Vec<Value>,
    /// Set when the buffer holds a NULL-complemented row. This overlays the
    /// per-column null state without destroying the underlying values.
    null_row: bool,
    /// Whether a row has ever been produced into this buffer.
    has_row: bool,
    /// Whether this table sits on the nullable (inner) side of an outer
    /// join, meaning a NULL-row flag byte is part of its packed form.
    nullable: bool,
    /// Whether packed NULL-complemented rows should carry the buffer's
    /// actual contents behind the flag byte. Needed by operators that cache
    /// on buffer identity; the join driver itself never sets it.
    store_contents_of_null_rows: bool,
    /// Storage position of the current row, maintained by the row source.
    position: Option<u64>,
    /// Materialized row identifier, filled in on request from `position`.
    row_id: Option<u64>,
    /// Whether row-id generation has been requested for this table.
    row_id_requested: bool,
}

impl TableBuffer {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        let width = schema.columns.len();
        Self {
            schema,
            values: vec![Value::Null; width],
            null_row: false,
            has_row: false,
            nullable: false,
            store_contents_of_null_rows: false,
            position: None,
            row_id: None,
            row_id_requested: false,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// The underlying value of a column, ignoring any NULL-row overlay.
    pub fn raw_value(&self, column: usize) -> &Value {
        &self.values[column]
    }

    /// The effective value of a column: NULL if a NULL-complemented row is
    /// active, the stored value otherwise.
    pub fn value(&self, column: usize) -> &Value {
        if self.null_row {
            &NULL_VALUE
        } else {
            &self.values[column]
        }
    }

    pub fn set_value(&mut self, column: usize, value: Value) {
        self.values[column] = value;
    }

    /// Replace the whole row and clear the NULL-row overlay.
    pub fn set_row(&mut self, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.schema.columns.len());
        self.values = values;
        self.null_row = false;
        self.has_row = true;
    }

    pub fn null_row(&self) -> bool {
        self.null_row
    }

    pub fn set_null_row(&mut self, is_null_row: bool) {
        self.null_row = is_null_row;
    }

    pub fn has_row(&self) -> bool {
        self.has_row
    }

    pub fn mark_has_row(&mut self) {
        self.has_row = true;
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Mark this table as the nullable side of an outer join. Called during
    /// plan construction, before any rows flow.
    pub fn set_nullable(&mut self) {
        self.nullable = true;
    }

    pub fn stores_contents_of_null_rows(&self) -> bool {
        self.store_contents_of_null_rows
    }

    pub fn set_store_contents_of_null_rows(&mut self) {
        self.store_contents_of_null_rows = true;
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = Some(position);
    }

    pub fn row_id(&self) -> Option<u64> {
        self.row_id
    }

    pub fn set_row_id(&mut self, row_id: Option<u64>) {
        self.row_id = row_id;
    }

    pub fn row_id_requested(&self) -> bool {
        self.row_id_requested
    }

    pub fn set_row_id_requested(&mut self) {
        self.row_id_requested = true;
    }
}

/// The ordered collection of table record buffers for one query.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    tables: Vec<TableBuffer>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table and return its workspace index.
    pub fn add_table(&mut self, schema: Arc<TableSchema>) -> usize {
        self.tables.push(TableBuffer::new(schema));
        self.tables.len() - 1
    }

    pub fn table(&self, index: usize) -> &TableBuffer {
        &self.tables[index]
    }

    pub fn table_mut(&mut self, index: usize) -> &mut TableBuffer {
        &mut self.tables[index]
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use crate::value::ColumnType;

    fn two_col_table() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(
            "t",
            vec![
                ColumnDef::new("a", ColumnType::Int64, false),
                ColumnDef::new("b", ColumnType::VarBytes { max_len: 16 }, true),
            ],
        ))
    }

    #[test]
    fn null_row_overlays_without_destroying_values() {
        let mut ws = Workspace::new();
        let t = ws.add_table(two_col_table());
        ws.table_mut(t)
            .set_row(vec![Value::Int(1), Value::Bytes(b"x".to_vec())]);

        ws.table_mut(t).set_null_row(true);
        assert!(ws.table(t).value(0).is_null());
        assert_eq!(ws.table(t).raw_value(0), &Value::Int(1));

        ws.table_mut(t).set_null_row(false);
        assert_eq!(ws.table(t).value(0), &Value::Int(1));
    }

    #[test]
    fn set_row_clears_null_row_flag() {
        let mut ws = Workspace::new();
        let t = ws.add_table(two_col_table());
        ws.table_mut(t).set_null_row(true);
        ws.table_mut(t).set_row(vec![Value::Int(2), Value::Null]);
        assert!(!ws.table(t).null_row());
        assert!(ws.table(t).has_row());
    }
}
