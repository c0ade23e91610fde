//! Packing rows spanning one or more tables into contiguous byte strings,
//! and restoring them again.
//!
//! Used by hash join for hash-table rows, spill-chunk records and the
//! probe-row-saving file; the format is also what sibling operators (e.g.
//! duplicate weedout) consume when row ids are carried along.
//!
//! The packed form of a row is, per table in collection order:
//!
//! 1. A NULL-row flag byte, iff the table sits on the nullable side of an
//!    outer join.
//! 2. The table's null bitmap, iff at least one projected column is
//!    nullable.
//! 3. The packed bytes of every projected, effectively non-NULL column.
//! 4. The table's row id, iff row ids were requested for the collection.
//!
//! Restoring with the identical collection and read sets reconstructs the
//! record buffers bit-exactly; restoring with anything else is a caller bug.

use smallvec::SmallVec;

use crate::schema::TableSet;
use crate::value::{ColumnType, Value};
use crate::workspace::{TableBuffer, Workspace};

/// Width of a packed row id.
const ROW_ID_BYTES: usize = 8;

/// One projected column, with its type cached out of the schema.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column index within the table's schema.
    pub column: usize,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// One table's slice of a [`TableCollection`].
#[derive(Debug, Clone)]
pub struct Table {
    /// Workspace index of the table.
    pub table: usize,
    pub columns: SmallVec<[Column; 8]>,
    /// Whether the null bitmap is part of this table's packed form.
    pub copy_null_flags: bool,
    /// Whether the table is on the nullable side of an outer join, adding
    /// the NULL-row flag byte to its packed form.
    pub is_nullable: bool,
    /// Whether NULL-complemented rows are packed with their buffer contents.
    pub store_contents_of_null_rows: bool,
    /// Null bitmap width in bytes (over all nullable schema columns).
    pub null_bytes: usize,
}

/// Possible values of the NULL-row flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NullRowFlag {
    NotNull = 0,
    NullWithoutData = 1,
    NullWithData = 2,
}

impl NullRowFlag {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::NotNull,
            1 => Self::NullWithoutData,
            _ => Self::NullWithData,
        }
    }
}

/// The set of tables whose rows are packed together, with per-table read
/// sets and precomputed size information.
#[derive(Debug, Clone, Default)]
pub struct TableCollection {
    tables: SmallVec<[Table; 4]>,
    tables_bitmap: TableSet,
    /// Bytes of row ids, NULL-row flags and null bitmaps per packed row.
    /// Row ids are counted unconditionally: a sibling operator may demand
    /// them after this collection was built, and over-reserving a few bytes
    /// per row is harmless.
    ref_and_null_bytes_size: usize,
    has_blob_column: bool,
    store_rowids: bool,
    tables_to_get_rowid_for: TableSet,
}

impl TableCollection {
    /// Build a collection over `(table, read set)` pairs. The read set lists
    /// projected column indexes in schema order.
    pub fn new(
        ws: &Workspace,
        projections: &[(usize, Vec<usize>)],
        store_rowids: bool,
        tables_to_get_rowid_for: TableSet,
    ) -> Self {
        let mut collection = Self {
            store_rowids,
            tables_to_get_rowid_for,
            ..Self::default()
        };
        if !store_rowids {
            debug_assert!(tables_to_get_rowid_for.is_empty());
        }
        for (table_idx, read_set) in projections {
            collection.add_table(ws, *table_idx, read_set);
        }
        collection
    }

    /// Convenience constructor projecting every column of every table.
    pub fn with_all_columns(ws: &Workspace, tables: &[usize]) -> Self {
        let projections: Vec<(usize, Vec<usize>)> = tables
            .iter()
            .map(|&t| (t, (0..ws.table(t).schema().columns.len()).collect()))
            .collect();
        Self::new(ws, &projections, false, TableSet::EMPTY)
    }

    fn add_table(&mut self, ws: &Workspace, table_idx: usize, read_set: &[usize]) {
        let buf = ws.table(table_idx);
        let schema = buf.schema();

        let mut table = Table {
            table: table_idx,
            columns: SmallVec::new(),
            copy_null_flags: false,
            is_nullable: buf.is_nullable(),
            store_contents_of_null_rows: buf.stores_contents_of_null_rows(),
            null_bytes: schema.null_bytes(),
        };

        for &col in read_set {
            let def = &schema.columns[col];
            if def.ty.is_blob_like() {
                self.has_blob_column = true;
            }
            if def.nullable {
                table.copy_null_flags = true;
            }
            table.columns.push(Column {
                column: col,
                ty: def.ty,
                nullable: def.nullable,
            });
        }

        self.ref_and_null_bytes_size += ROW_ID_BYTES;
        if table.is_nullable {
            self.ref_and_null_bytes_size += 1;
        }
        if table.copy_null_flags {
            self.ref_and_null_bytes_size += table.null_bytes;
        }

        self.tables_bitmap = self.tables_bitmap.with(table_idx);
        self.tables.push(table);
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn tables_bitmap(&self) -> TableSet {
        self.tables_bitmap
    }

    pub fn has_blob_column(&self) -> bool {
        self.has_blob_column
    }

    pub fn store_rowids(&self) -> bool {
        self.store_rowids
    }

    pub fn tables_to_get_rowid_for(&self) -> TableSet {
        self.tables_to_get_rowid_for
    }
}

/// It is not safe to carry a row id for a NULL-complemented row; the stored
/// position is undefined.
fn should_copy_row_id(table: &Table, null_row: bool) -> bool {
    !(table.is_nullable && null_row)
}

fn effective_flag(table: &Table, buf: &TableBuffer) -> NullRowFlag {
    if !buf.null_row() {
        NullRowFlag::NotNull
    } else if table.store_contents_of_null_rows && buf.has_row() {
        NullRowFlag::NullWithData
    } else {
        NullRowFlag::NullWithoutData
    }
}

/// Upper bound on the packed size of the current row.
///
/// A pure function of metadata unless the collection has a blob-like
/// column, in which case the bound reads the lengths of the values
/// currently in the record buffers.
pub fn row_size_upper_bound(tables: &TableCollection, ws: &Workspace) -> usize {
    let mut total = tables.ref_and_null_bytes_size;
    for table in tables.tables() {
        let buf = ws.table(table.table);
        for col in &table.columns {
            // NULL columns are counted too; reserving a little extra beats
            // checking is_null for every column of every row.
            total += col.ty.max_packed_len(buf.raw_value(col.column));
        }
    }
    total
}

/// Pack the current row into the front of `dst`, returning the bytes
/// written. `dst` must hold at least [`row_size_upper_bound`] bytes.
pub fn store_into(tables: &TableCollection, ws: &Workspace, dst: &mut [u8]) -> usize {
    let mut pos = 0;
    for table in tables.tables() {
        let buf = ws.table(table.table);
        let flag = effective_flag(table, buf);
        if table.is_nullable {
            dst[pos] = flag as u8;
            pos += 1;
        }
        let all_null = flag == NullRowFlag::NullWithoutData;

        if table.copy_null_flags {
            let start = pos;
            dst[start..start + table.null_bytes].fill(0);
            let mut bit = 0;
            for (col_idx, def) in buf.schema().columns.iter().enumerate() {
                if !def.nullable {
                    continue;
                }
                if all_null || buf.raw_value(col_idx).is_null() {
                    dst[start + bit / 8] |= 1 << (bit % 8);
                }
                bit += 1;
            }
            pos += table.null_bytes;
        }

        if !all_null {
            for col in &table.columns {
                let value = buf.raw_value(col.column);
                if !value.is_null() {
                    pos += col.ty.pack(value, &mut dst[pos..]);
                }
            }
        }

        if tables.store_rowids() && should_copy_row_id(table, buf.null_row()) {
            let row_id = buf.row_id().unwrap_or(0);
            dst[pos..pos + ROW_ID_BYTES].copy_from_slice(&row_id.to_le_bytes());
            pos += ROW_ID_BYTES;
        }
    }
    pos
}

/// Pack the current row into `buf`, replacing its contents.
pub fn store_from_buffers(tables: &TableCollection, ws: &Workspace, buf: &mut Vec<u8>) {
    let upper = row_size_upper_bound(tables, ws);
    buf.clear();
    buf.resize(upper, 0);
    let written = store_into(tables, ws, buf);
    buf.truncate(written);
}

/// Restore a packed row into the tables' record buffers, returning the
/// bytes consumed. `src` must be the output of a prior [`store_into`] with
/// the identical collection and read sets.
pub fn load_into_buffers(tables: &TableCollection, ws: &mut Workspace, src: &[u8]) -> usize {
    let mut pos = 0;
    for table in tables.tables() {
        let buf = ws.table_mut(table.table);
        // The NULL-row flag may override column null state; clear it before
        // restoring so the columns land in the underlying values.
        buf.set_null_row(false);

        let flag = if table.is_nullable {
            let flag = NullRowFlag::from_byte(src[pos]);
            pos += 1;
            flag
        } else {
            NullRowFlag::NotNull
        };
        let all_null = flag == NullRowFlag::NullWithoutData;

        let bitmap_start = pos;
        if table.copy_null_flags {
            pos += table.null_bytes;
        }

        if !all_null {
            // Map each projected column to its bit position among the
            // schema's nullable columns.
            for col in &table.columns {
                let is_null = if col.nullable {
                    let bit = buf
                        .schema()
                        .columns
                        .iter()
                        .take(col.column)
                        .filter(|c| c.nullable)
                        .count();
                    src[bitmap_start + bit / 8] & (1 << (bit % 8)) != 0
                } else {
                    false
                };
                if is_null {
                    buf.set_value(col.column, Value::Null);
                } else {
                    let (value, consumed) = col.ty.unpack(&src[pos..]);
                    buf.set_value(col.column, value);
                    pos += consumed;
                }
            }
            buf.mark_has_row();
        }

        if flag != NullRowFlag::NotNull {
            buf.set_null_row(true);
        }

        if tables.store_rowids() && should_copy_row_id(table, buf.null_row()) {
            let mut raw = [0u8; ROW_ID_BYTES];
            raw.copy_from_slice(&src[pos..pos + ROW_ID_BYTES]);
            buf.set_row_id(Some(u64::from_le_bytes(raw)));
            pos += ROW_ID_BYTES;
        }
    }
    pos
}

/// Ask the tables in `rowid_set` to keep row positions available, so that a
/// later [`request_row_id`] can materialize them.
pub fn prepare_for_request_row_id(
    tables: &TableCollection,
    rowid_set: TableSet,
    ws: &mut Workspace,
) {
    for table in tables.tables() {
        if tables.tables_to_get_rowid_for().contains(table.table) && rowid_set.contains(table.table)
        {
            ws.table_mut(table.table).set_row_id_requested();
        }
    }
}

/// Materialize the row id for every table in `rowid_set`, from the position
/// the row source recorded for the current row.
pub fn request_row_id(tables: &TableCollection, rowid_set: TableSet, ws: &mut Workspace) {
    for table in tables.tables() {
        if !tables.tables_to_get_rowid_for().contains(table.table)
            || !rowid_set.contains(table.table)
        {
            continue;
        }
        let buf = ws.table_mut(table.table);
        if should_copy_row_id(table, buf.null_row()) {
            buf.set_row_id(buf.position());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::schema::{ColumnDef, TableSchema};

    fn mixed_schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(
            "t",
            vec![
                ColumnDef::new("a", ColumnType::Int64, false),
                ColumnDef::new("b", ColumnType::VarBytes { max_len: 32 }, true),
                ColumnDef::new("c", ColumnType::Float64, true),
            ],
        ))
    }

    fn roundtrip_current_row(tables: &TableCollection, ws: &mut Workspace) {
        let mut packed = Vec::new();
        store_from_buffers(tables, ws, &mut packed);
        assert!(packed.len() <= row_size_upper_bound(tables, ws));

        let before: Vec<TableBuffer> = tables
            .tables()
            .iter()
            .map(|t| ws.table(t.table).clone())
            .collect();

        let consumed = load_into_buffers(tables, ws, &packed);
        assert_eq!(consumed, packed.len());

        for (table, before) in tables.tables().iter().zip(&before) {
            let after = ws.table(table.table);
            assert_eq!(after.null_row(), before.null_row());
            for col in &table.columns {
                assert_eq!(after.raw_value(col.column), before.raw_value(col.column));
            }
        }
    }

    #[test]
    fn roundtrip_plain_row() {
        let mut ws = Workspace::new();
        let t = ws.add_table(mixed_schema());
        ws.table_mut(t).set_row(vec![
            Value::Int(7),
            Value::Bytes(b"hello".to_vec()),
            Value::Float(2.5),
        ]);
        let tables = TableCollection::with_all_columns(&ws, &[t]);
        roundtrip_current_row(&tables, &mut ws);
    }

    #[test]
    fn roundtrip_with_nulls() {
        let mut ws = Workspace::new();
        let t = ws.add_table(mixed_schema());
        ws.table_mut(t)
            .set_row(vec![Value::Int(7), Value::Null, Value::Null]);
        let tables = TableCollection::with_all_columns(&ws, &[t]);
        roundtrip_current_row(&tables, &mut ws);
    }

    #[test]
    fn roundtrip_null_complemented_row() {
        let mut ws = Workspace::new();
        let t = ws.add_table(mixed_schema());
        ws.table_mut(t).set_nullable();
        ws.table_mut(t).set_row(vec![
            Value::Int(1),
            Value::Bytes(b"x".to_vec()),
            Value::Float(0.0),
        ]);
        ws.table_mut(t).set_null_row(true);
        let tables = TableCollection::with_all_columns(&ws, &[t]);

        let mut packed = Vec::new();
        store_from_buffers(&tables, &ws, &mut packed);
        // Flag byte plus the (all ones) null bitmap; no column data.
        assert_eq!(packed.len(), 2);

        // Scribble over the buffer, then restore.
        ws.table_mut(t).set_null_row(false);
        ws.table_mut(t)
            .set_row(vec![Value::Int(9), Value::Null, Value::Null]);
        load_into_buffers(&tables, &mut ws, &packed);
        assert!(ws.table(t).null_row());
    }

    #[test]
    fn null_complemented_row_with_contents_keeps_values() {
        let mut ws = Workspace::new();
        let t = ws.add_table(mixed_schema());
        ws.table_mut(t).set_nullable();
        ws.table_mut(t).set_store_contents_of_null_rows();
        ws.table_mut(t).set_row(vec![
            Value::Int(42),
            Value::Bytes(b"kept".to_vec()),
            Value::Null,
        ]);
        ws.table_mut(t).set_null_row(true);
        let tables = TableCollection::with_all_columns(&ws, &[t]);

        let mut packed = Vec::new();
        store_from_buffers(&tables, &ws, &mut packed);

        ws.table_mut(t).set_null_row(false);
        ws.table_mut(t)
            .set_row(vec![Value::Int(0), Value::Null, Value::Null]);
        load_into_buffers(&tables, &mut ws, &packed);

        assert!(ws.table(t).null_row());
        assert_eq!(ws.table(t).raw_value(0), &Value::Int(42));
        assert_eq!(ws.table(t).raw_value(1), &Value::Bytes(b"kept".to_vec()));
    }

    #[test]
    fn roundtrip_two_tables_with_projection() {
        let mut ws = Workspace::new();
        let t1 = ws.add_table(mixed_schema());
        let t2 = ws.add_table(mixed_schema());
        ws.table_mut(t1).set_row(vec![
            Value::Int(1),
            Value::Bytes(b"a".to_vec()),
            Value::Float(1.0),
        ]);
        ws.table_mut(t2).set_row(vec![
            Value::Int(2),
            Value::Bytes(b"b".to_vec()),
            Value::Float(2.0),
        ]);
        // Project only (a, b) from t1 and (a) from t2.
        let tables = TableCollection::new(
            &ws,
            &[(t1, vec![0, 1]), (t2, vec![0])],
            false,
            TableSet::EMPTY,
        );
        roundtrip_current_row(&tables, &mut ws);
    }

    #[test]
    fn row_ids_survive_roundtrip() {
        let mut ws = Workspace::new();
        let t = ws.add_table(mixed_schema());
        ws.table_mut(t)
            .set_row(vec![Value::Int(1), Value::Null, Value::Null]);
        ws.table_mut(t).set_position(1234);

        let tables = TableCollection::new(
            &ws,
            &[(t, vec![0, 1, 2])],
            true,
            TableSet::single(t),
        );
        prepare_for_request_row_id(&tables, TableSet::single(t), &mut ws);
        request_row_id(&tables, TableSet::single(t), &mut ws);
        assert_eq!(ws.table(t).row_id(), Some(1234));

        let mut packed = Vec::new();
        store_from_buffers(&tables, &ws, &mut packed);
        ws.table_mut(t).set_row_id(None);
        load_into_buffers(&tables, &mut ws, &packed);
        assert_eq!(ws.table(t).row_id(), Some(1234));
    }

    #[test]
    fn blob_bound_tracks_current_value() {
        let schema = Arc::new(TableSchema::new(
            "t",
            vec![ColumnDef::new("payload", ColumnType::Blob, false)],
        ));
        let mut ws = Workspace::new();
        let t = ws.add_table(schema);
        let tables = TableCollection::with_all_columns(&ws, &[t]);
        assert!(tables.has_blob_column());

        ws.table_mut(t).set_row(vec![Value::Bytes(vec![0u8; 10])]);
        let small = row_size_upper_bound(&tables, &ws);
        ws.table_mut(t).set_row(vec![Value::Bytes(vec![0u8; 1000])]);
        let large = row_size_upper_bound(&tables, &ws);
        assert_eq!(large - small, 990);
        roundtrip_current_row(&tables, &mut ws);
    }

    proptest! {
        #[test]
        fn prop_roundtrip_is_bit_exact(
            a in any::<i64>(),
            b in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..32)),
            c in proptest::option::of(-1.0e12_f64..1.0e12),
        ) {
            let mut ws = Workspace::new();
            let t = ws.add_table(mixed_schema());
            ws.table_mut(t).set_row(vec![
                Value::Int(a),
                b.map_or(Value::Null, Value::Bytes),
                c.map_or(Value::Null, Value::Float),
            ]);
            let tables = TableCollection::with_all_columns(&ws, &[t]);
            roundtrip_current_row(&tables, &mut ws);
        }
    }
}
