//! Join conditions and residual predicates.

use quern_error::{QuernError, Result};
use quern_rows::{TableSet, Workspace};
use smallvec::SmallVec;

/// A column reference: workspace table index plus column index.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRef {
    pub table: usize,
    pub column: usize,
}

impl ColumnRef {
    pub fn new(table: usize, column: usize) -> Self {
        Self { table, column }
    }
}

/// One equi-condition `build_expr = probe_expr`.
///
/// The two sides are encoded into a canonical comparison form whose byte
/// equality coincides with SQL equality, so the hash table can hash and
/// compare keys without consulting the type system again.
#[derive(Debug, Clone, Copy)]
pub struct JoinCondition {
    build: ColumnRef,
    probe: ColumnRef,
}

impl JoinCondition {
    pub fn new(build: ColumnRef, probe: ColumnRef) -> Self {
        Self { build, probe }
    }

    /// The side of this condition whose table belongs to `side`.
    fn expr_for_side(&self, side: TableSet) -> ColumnRef {
        if side.contains(self.build.table) {
            self.build
        } else {
            debug_assert!(side.contains(self.probe.table));
            self.probe
        }
    }

    /// Evaluate this condition for the given side and append the encoded
    /// key part to `buf`. Returns `true` if the value was SQL NULL (in
    /// which case nothing is appended).
    pub fn append_join_key(
        &self,
        ws: &Workspace,
        side: TableSet,
        multi_part: bool,
        buf: &mut Vec<u8>,
    ) -> Result<bool> {
        let expr = self.expr_for_side(side);
        let value = ws.table(expr.table).value(expr.column);
        Ok(value.append_comparable(multi_part, buf))
    }
}

/// Concatenate the encoded key parts for every condition into `buf`,
/// evaluating the side of each condition that belongs to `side`.
///
/// Returns `true` as soon as any condition evaluates to SQL NULL; `buf`
/// then holds only the parts appended so far.
pub fn construct_join_key(
    ws: &Workspace,
    conditions: &[JoinCondition],
    side: TableSet,
    buf: &mut Vec<u8>,
) -> Result<bool> {
    buf.clear();
    let multi_part = conditions.len() > 1;
    for condition in conditions {
        if condition.append_join_key(ws, side, multi_part, buf)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A residual (non-equi) predicate evaluated over joined record buffers.
pub trait Predicate {
    fn evaluate(&self, ws: &Workspace) -> Result<bool>;
}

impl<F> Predicate for F
where
    F: Fn(&Workspace) -> Result<bool>,
{
    fn evaluate(&self, ws: &Workspace) -> Result<bool> {
        self(ws)
    }
}

/// Zero or more residual predicates, AND-reduced into one so the driver
/// evaluates a single condition per candidate row.
pub struct ExtraCondition {
    predicates: SmallVec<[Box<dyn Predicate>; 2]>,
}

impl ExtraCondition {
    /// Merge a list of predicates; returns `None` for an empty list so the
    /// driver can skip evaluation entirely.
    pub fn from_list(predicates: Vec<Box<dyn Predicate>>) -> Option<Self> {
        if predicates.is_empty() {
            None
        } else {
            Some(Self {
                predicates: predicates.into_iter().collect(),
            })
        }
    }

    pub fn evaluate(&self, ws: &Workspace) -> Result<bool> {
        for predicate in &self.predicates {
            if !predicate.evaluate(ws)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for ExtraCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtraCondition")
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// Helper for building evaluation errors in predicates.
pub fn evaluation_error(msg: impl Into<String>) -> QuernError {
    QuernError::Evaluation(msg.into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quern_rows::{ColumnDef, ColumnType, TableSchema, Value};

    use super::*;

    fn two_table_workspace() -> Workspace {
        let schema = Arc::new(TableSchema::new(
            "t",
            vec![
                ColumnDef::new("a", ColumnType::Int64, true),
                ColumnDef::new("b", ColumnType::VarBytes { max_len: 8 }, true),
            ],
        ));
        let mut ws = Workspace::new();
        ws.add_table(Arc::clone(&schema));
        ws.add_table(schema);
        ws
    }

    #[test]
    fn key_built_from_the_requested_side() {
        let mut ws = two_table_workspace();
        ws.table_mut(0).set_row(vec![Value::Int(1), Value::Null]);
        ws.table_mut(1).set_row(vec![Value::Int(2), Value::Null]);

        let cond = JoinCondition::new(ColumnRef::new(0, 0), ColumnRef::new(1, 0));
        let mut build_key = Vec::new();
        let mut probe_key = Vec::new();
        assert!(
            !construct_join_key(&ws, &[cond], TableSet::single(0), &mut build_key).unwrap()
        );
        assert!(
            !construct_join_key(&ws, &[cond], TableSet::single(1), &mut probe_key).unwrap()
        );
        assert_eq!(build_key, 1i64.to_le_bytes());
        assert_eq!(probe_key, 2i64.to_le_bytes());
    }

    #[test]
    fn null_short_circuits_key_construction() {
        let mut ws = two_table_workspace();
        ws.table_mut(0).set_row(vec![Value::Null, Value::Bytes(b"x".to_vec())]);

        let conds = [
            JoinCondition::new(ColumnRef::new(0, 0), ColumnRef::new(1, 0)),
            JoinCondition::new(ColumnRef::new(0, 1), ColumnRef::new(1, 1)),
        ];
        let mut key = Vec::new();
        assert!(construct_join_key(&ws, &conds, TableSet::single(0), &mut key).unwrap());
        assert!(key.is_empty());
    }

    #[test]
    fn null_row_overlay_yields_null_key() {
        let mut ws = two_table_workspace();
        ws.table_mut(0).set_row(vec![Value::Int(5), Value::Null]);
        ws.table_mut(0).set_null_row(true);

        let cond = JoinCondition::new(ColumnRef::new(0, 0), ColumnRef::new(1, 0));
        let mut key = Vec::new();
        assert!(construct_join_key(&ws, &[cond], TableSet::single(0), &mut key).unwrap());
    }

    #[test]
    fn extra_condition_and_reduces() {
        let ws = two_table_workspace();
        let always: Box<dyn Predicate> = Box::new(|_: &Workspace| Ok(true));
        let never: Box<dyn Predicate> = Box::new(|_: &Workspace| Ok(false));
        let cond = ExtraCondition::from_list(vec![always, never]).unwrap();
        assert!(!cond.evaluate(&ws).unwrap());

        assert!(ExtraCondition::from_list(Vec::new()).is_none());
    }

    #[test]
    fn predicate_errors_propagate() {
        let ws = two_table_workspace();
        let failing: Box<dyn Predicate> =
            Box::new(|_: &Workspace| Err(evaluation_error("division by zero")));
        let cond = ExtraCondition::from_list(vec![failing]).unwrap();
        assert!(matches!(
            cond.evaluate(&ws),
            Err(QuernError::Evaluation(_))
        ));
    }
}
