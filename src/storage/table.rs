//! Tables
//!
//! A table is an ordered list of rows plus its column metadata. The planning
//! methods turn parsed INSERT/UPDATE statements into change-set rows (values
//! computed against the planning transaction's view); the apply methods
//! execute change-set rows, which may have been produced locally, replicated
//! through consensus, or replayed from the WAL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::changeset::{InsertRow, UpdateRow};
use crate::error::{BasaltError, Result};
use crate::executor::ExprEvaluator;
use crate::parser::ast::{ArithOp, Expr, InsertStmt, UpdateStmt};
use crate::server::ServerContext;
use crate::txn::Transaction;
use crate::types::{ColumnType, RowId, RowMeta, PRIMARY_KEY};

use super::row::Row;

/// Index stub: survives snapshots, consulted by nothing yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub tree: BTreeMap<String, i64>,
}

pub struct Table {
    name: String,
    row_metas: Vec<RowMeta>,
    rows: Vec<Arc<Row>>,
    indexes: HashMap<String, Index>,
}

impl Table {
    pub fn new(name: &str, row_metas: Vec<RowMeta>) -> Table {
        Table {
            name: name.to_string(),
            row_metas,
            rows: Vec::new(),
            indexes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_metas(&self) -> &[RowMeta] {
        &self.row_metas
    }

    pub fn rows(&self) -> &[Arc<Row>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn indexes(&self) -> &HashMap<String, Index> {
        &self.indexes
    }

    pub(crate) fn set_indexes(&mut self, indexes: HashMap<String, Index>) {
        self.indexes = indexes;
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.row_metas.iter().any(|m| m.name == name)
    }

    fn meta(&self, name: &str) -> Option<&RowMeta> {
        self.row_metas.iter().find(|m| m.name == name)
    }

    pub(crate) fn push_row(&mut self, row: Arc<Row>) {
        self.rows.push(row);
    }

    pub(crate) fn remove_row(&mut self, id: RowId) {
        self.rows.retain(|r| r.id() != id);
    }

    /// Column names of the table, in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.row_metas.iter().map(|m| m.name.clone()).collect()
    }

    //=========================================================================
    // INSERT
    //=========================================================================

    /// Build the change-set rows for an INSERT: validate the column list and
    /// fill omitted auto-increment columns with max(existing) + 1, tracking
    /// values already generated inside this statement.
    pub fn plan_insert(
        &self,
        txn: &Arc<Transaction>,
        stmt: &InsertStmt,
    ) -> Result<Vec<InsertRow>> {
        for column in &stmt.columns {
            if !self.contains_column(column) {
                return Err(BasaltError::unknown_column(column));
            }
        }

        let mut rows = Vec::with_capacity(stmt.rows.len());
        let mut generated: HashMap<String, i64> = HashMap::new();

        for values in &stmt.rows {
            let mut columns: HashMap<String, String> = stmt
                .columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect();

            for meta in &self.row_metas {
                if columns.contains_key(&meta.name) {
                    continue;
                }
                if meta.column_type == ColumnType::AutoIncrementInt {
                    let next = match generated.get(&meta.name) {
                        Some(last) => last + 1,
                        None => self.max_int_value(txn, &meta.name) + 1,
                    };
                    columns.insert(meta.name.clone(), next.to_string());
                    generated.insert(meta.name.clone(), next);
                }
            }

            rows.push(InsertRow { columns });
        }

        Ok(rows)
    }

    /// Largest transaction-visible value of an integer column, 0 when the
    /// table has none. Peeks without registering reads so an insert does not
    /// observe the whole table.
    fn max_int_value(&self, txn: &Arc<Transaction>, column: &str) -> i64 {
        self.rows
            .iter()
            .filter_map(|row| txn.peek(row, column).parse::<i64>().ok())
            .max()
            .unwrap_or(0)
    }

    /// Execute insert change-set rows. Immediate-transaction rows become
    /// committed rows at once; rows of an explicit transaction enter the
    /// table empty with the values held in the transaction's shadow.
    pub fn apply_insert(
        &mut self,
        ctx: &ServerContext,
        txn: &Arc<Transaction>,
        rows: &[InsertRow],
        database: &str,
    ) -> Result<()> {
        for insert in rows {
            let id = ctx.next_row_id();
            let row = if txn.is_immediate() {
                Row::new(id, insert.columns.clone())
            } else {
                let row = Row::new_pending(id);
                txn.attach_insert_shadow(&row, insert.columns.clone(), database, &self.name);
                row
            };
            self.rows.push(row);
        }
        Ok(())
    }

    //=========================================================================
    // UPDATE
    //=========================================================================

    /// Build the change-set rows for an UPDATE: select target rows with the
    /// WHERE clause, then compute each assigned value against the planning
    /// transaction's view of the row.
    pub fn plan_update(
        &self,
        txn: &Arc<Transaction>,
        stmt: &UpdateStmt,
    ) -> Result<Vec<UpdateRow>> {
        let evaluator = ExprEvaluator;
        let mut targets: Vec<&Arc<Row>> = Vec::new();
        for row in &self.rows {
            let matches = match &stmt.where_clause {
                Some(expr) => evaluator.matches_row(txn, "", expr, row)?,
                None => true,
            };
            if matches {
                targets.push(row);
            }
        }

        let mut update_rows = Vec::with_capacity(targets.len());
        for row in targets {
            let mut columns = HashMap::new();
            for assignment in &stmt.assignments {
                if assignment.column == PRIMARY_KEY {
                    return Err(BasaltError::Semantic(format!(
                        "primary key is immutable: {}",
                        PRIMARY_KEY
                    )));
                }
                if !self.contains_column(&assignment.column) {
                    return Err(BasaltError::unknown_column(&assignment.column));
                }

                let value = match &assignment.expr {
                    Expr::Literal(v) => v.clone(),
                    Expr::Column { name, .. } => txn.read(row, name),
                    Expr::Binary { left, op, right } => {
                        self.calc_binary_update(txn, &assignment.column, row, left, *op, right)?
                    }
                    other => {
                        return Err(BasaltError::Semantic(format!(
                            "not supported expression in SET: {:?}",
                            other
                        )))
                    }
                };
                columns.insert(assignment.column.clone(), value);
            }

            update_rows.push(UpdateRow {
                primary_key: txn.primary_key_of(row),
                columns,
            });
        }

        Ok(update_rows)
    }

    /// `left op right` typed by the assigned column: integer arithmetic for
    /// INT columns, concatenation for VARCHAR `+`.
    fn calc_binary_update(
        &self,
        txn: &Arc<Transaction>,
        target: &str,
        row: &Arc<Row>,
        left: &Expr,
        op: ArithOp,
        right: &Expr,
    ) -> Result<String> {
        let left_val = self.operand_value(txn, row, left)?;
        let right_val = self.operand_value(txn, row, right)?;

        let meta = self
            .meta(target)
            .ok_or_else(|| BasaltError::unknown_column(target))?;

        match meta.column_type {
            ColumnType::Int | ColumnType::AutoIncrementInt => {
                let l: i64 = left_val
                    .parse()
                    .map_err(|_| BasaltError::Semantic(format!("not an integer: {}", left_val)))?;
                let r: i64 = right_val
                    .parse()
                    .map_err(|_| BasaltError::Semantic(format!("not an integer: {}", right_val)))?;
                Ok(match op {
                    ArithOp::Add => (l + r).to_string(),
                    ArithOp::Sub => (l - r).to_string(),
                })
            }
            ColumnType::VarChar => match op {
                ArithOp::Add => Ok(format!("{}{}", left_val, right_val)),
                ArithOp::Sub => Err(BasaltError::Semantic(
                    "not supported expression: varchar subtraction".into(),
                )),
            },
        }
    }

    fn operand_value(&self, txn: &Arc<Transaction>, row: &Arc<Row>, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Column { name, .. } => Ok(txn.read(row, name)),
            Expr::Literal(v) => Ok(v.clone()),
            other => Err(BasaltError::Semantic(format!(
                "not supported expression: {:?}",
                other
            ))),
        }
    }

    /// Execute update change-set rows, addressing targets by primary key.
    pub fn apply_update(
        &self,
        txn: &Arc<Transaction>,
        rows: &[UpdateRow],
        database: &str,
    ) -> Result<()> {
        for update in rows {
            let target = self
                .rows
                .iter()
                .find(|row| txn.primary_key_of(row) == update.primary_key);
            match target {
                Some(row) => txn.write(row, &update.columns, database, &self.name)?,
                None => {
                    return Err(BasaltError::Semantic(format!(
                        "no row found for UPDATE: {}.{} (PK: {})",
                        database, self.name, update.primary_key
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn inspect(&self) -> String {
        let metas: Vec<String> = self.row_metas.iter().map(|m| m.describe()).collect();
        let mut out = format!("\tTable: {}({})\n", self.name, metas.join(", "));
        for row in &self.rows {
            let cells: Vec<String> = self
                .row_metas
                .iter()
                .map(|m| format!("{}: {}", m.name, row.committed_value(&m.name)))
                .collect();
            out.push_str(&format!("\t\t{}\n", cells.join("\t")));
        }
        out
    }
}
