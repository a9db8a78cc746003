//! WHERE / ON expression evaluation
//!
//! Comparisons work on the storage encoding: every operand evaluates to a
//! string and `=` / `!=` compare byte-wise. When a single-table filter meets
//! a condition qualified with a different alias, the condition does not bind
//! this table and passes; the joined-row filter evaluates it for real later.

use std::sync::Arc;

use crate::error::{BasaltError, Result};
use crate::join::JoinRow;
use crate::parser::ast::{CompareOp, Expr};
use crate::storage::Row;
use crate::txn::Transaction;

pub struct ExprEvaluator;

impl ExprEvaluator {
    /// Filter for a single table's rows. `alias` is the name the table is
    /// addressed by; an empty alias binds only unqualified columns.
    pub fn matches_row(
        &self,
        txn: &Arc<Transaction>,
        alias: &str,
        expr: &Expr,
        row: &Arc<Row>,
    ) -> Result<bool> {
        match expr {
            Expr::And(left, right) => {
                if !self.matches_row(txn, alias, left, row)? {
                    return Ok(false);
                }
                self.matches_row(txn, alias, right, row)
            }
            Expr::Comparison { left, op, right } => {
                let l = self.row_operand(txn, alias, left, row)?;
                let r = self.row_operand(txn, alias, right, row)?;
                match (l, r) {
                    (Some(l), Some(r)) => Ok(compare(*op, &l, &r)),
                    // a side bound to another table: not this filter's call
                    _ => Ok(true),
                }
            }
            other => Err(BasaltError::Semantic(format!(
                "not supported expression: {:?}",
                other
            ))),
        }
    }

    fn row_operand(
        &self,
        txn: &Arc<Transaction>,
        alias: &str,
        expr: &Expr,
        row: &Arc<Row>,
    ) -> Result<Option<String>> {
        match expr {
            Expr::Column { table, name } => {
                if let Some(qualifier) = table {
                    if qualifier != alias {
                        return Ok(None);
                    }
                }
                Ok(Some(txn.read(row, name)))
            }
            Expr::Literal(v) => Ok(Some(v.clone())),
            other => Err(BasaltError::Semantic(format!(
                "not supported expression: {:?}",
                other
            ))),
        }
    }

    /// Filter fully joined rows; every column reference must bind.
    pub fn matches_join_row(
        &self,
        txn: &Arc<Transaction>,
        expr: &Expr,
        row: &JoinRow,
    ) -> Result<bool> {
        match expr {
            Expr::And(left, right) => {
                if !self.matches_join_row(txn, left, row)? {
                    return Ok(false);
                }
                self.matches_join_row(txn, right, row)
            }
            Expr::Comparison { left, op, right } => {
                let l = self.join_operand(txn, left, row)?;
                let r = self.join_operand(txn, right, row)?;
                Ok(compare(*op, &l, &r))
            }
            other => Err(BasaltError::Semantic(format!(
                "not supported expression: {:?}",
                other
            ))),
        }
    }

    fn join_operand(
        &self,
        txn: &Arc<Transaction>,
        expr: &Expr,
        row: &JoinRow,
    ) -> Result<String> {
        match expr {
            Expr::Column { table, name } => row.get(txn, table.as_deref().unwrap_or(""), name),
            Expr::Literal(v) => Ok(v.clone()),
            other => Err(BasaltError::Semantic(format!(
                "not supported expression: {:?}",
                other
            ))),
        }
    }

    pub fn filter_join_rows(
        &self,
        txn: &Arc<Transaction>,
        expr: &Expr,
        rows: Vec<JoinRow>,
    ) -> Result<Vec<JoinRow>> {
        let mut out = Vec::new();
        for row in rows {
            if self.matches_join_row(txn, expr, &row)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Evaluate an ON condition for a join candidate: a built left row plus
    /// one prospective right row under `right_alias`.
    pub fn matches_join_candidate(
        &self,
        txn: &Arc<Transaction>,
        expr: &Expr,
        left: &JoinRow,
        right_alias: &str,
        right_row: &Arc<Row>,
    ) -> Result<bool> {
        match expr {
            Expr::And(l, r) => {
                if !self.matches_join_candidate(txn, l, left, right_alias, right_row)? {
                    return Ok(false);
                }
                self.matches_join_candidate(txn, r, left, right_alias, right_row)
            }
            Expr::Comparison { left: l, op, right: r } => {
                let lv = self.candidate_operand(txn, l, left, right_alias, right_row)?;
                let rv = self.candidate_operand(txn, r, left, right_alias, right_row)?;
                Ok(compare(*op, &lv, &rv))
            }
            other => Err(BasaltError::Semantic(format!(
                "not supported expression: {:?}",
                other
            ))),
        }
    }

    fn candidate_operand(
        &self,
        txn: &Arc<Transaction>,
        expr: &Expr,
        left: &JoinRow,
        right_alias: &str,
        right_row: &Arc<Row>,
    ) -> Result<String> {
        match expr {
            Expr::Column { table, name } => {
                let qualifier = table.as_deref().unwrap_or("");
                if qualifier == right_alias {
                    Ok(txn.read(right_row, name))
                } else {
                    left.get(txn, qualifier, name)
                }
            }
            Expr::Literal(v) => Ok(v.clone()),
            other => Err(BasaltError::Semantic(format!(
                "not supported expression: {:?}",
                other
            ))),
        }
    }
}

fn compare(op: CompareOp, left: &str, right: &str) -> bool {
    match op {
        CompareOp::Eq => left == right,
        CompareOp::NotEq => left != right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Locker;
    use std::collections::HashMap;

    fn row(id: u64, message: &str) -> Arc<Row> {
        let mut columns = HashMap::new();
        columns.insert("id".to_string(), id.to_string());
        columns.insert("message".to_string(), message.to_string());
        Row::new(id, columns)
    }

    fn txn() -> Arc<Transaction> {
        Transaction::immediate(Arc::new(Locker::new()))
    }

    fn col(table: Option<&str>, name: &str) -> Expr {
        Expr::Column {
            table: table.map(|t| t.to_string()),
            name: name.to_string(),
        }
    }

    fn cmp(left: Expr, op: CompareOp, right: Expr) -> Expr {
        Expr::Comparison {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    #[test]
    fn test_matches_row_equality() {
        let ev = ExprEvaluator;
        let txn = txn();
        let r = row(1, "foo");

        let expr = cmp(col(None, "id"), CompareOp::Eq, Expr::Literal("1".into()));
        assert!(ev.matches_row(&txn, "world", &expr, &r).unwrap());

        let expr = cmp(col(None, "id"), CompareOp::Eq, Expr::Literal("2".into()));
        assert!(!ev.matches_row(&txn, "world", &expr, &r).unwrap());
    }

    #[test]
    fn test_matches_row_and_short_circuit() {
        let ev = ExprEvaluator;
        let txn = txn();
        let r = row(1, "foo");

        let expr = Expr::And(
            Box::new(cmp(col(None, "id"), CompareOp::NotEq, Expr::Literal("1".into()))),
            Box::new(cmp(col(None, "message"), CompareOp::Eq, Expr::Literal("foo".into()))),
        );
        assert!(!ev.matches_row(&txn, "world", &expr, &r).unwrap());
    }

    #[test]
    fn test_foreign_alias_condition_passes() {
        let ev = ExprEvaluator;
        let txn = txn();
        let r = row(1, "foo");

        // w2 is someone else's alias: the condition does not bind here
        let expr = cmp(col(Some("w2"), "id"), CompareOp::NotEq, Expr::Literal("1".into()));
        assert!(ev.matches_row(&txn, "w1", &expr, &r).unwrap());

        // but w1 binds
        let expr = cmp(col(Some("w1"), "id"), CompareOp::NotEq, Expr::Literal("1".into()));
        assert!(!ev.matches_row(&txn, "w1", &expr, &r).unwrap());
    }

    #[test]
    fn test_join_candidate_on_condition() {
        let ev = ExprEvaluator;
        let txn = txn();
        let cols = vec!["id".to_string(), "message".to_string()];
        let left = JoinRow::new("w1", row(2, "bar"), cols);

        let on = cmp(
            col(Some("w1"), "message"),
            CompareOp::NotEq,
            col(Some("w2"), "message"),
        );
        assert!(ev
            .matches_join_candidate(&txn, &on, &left, "w2", &row(1, "foo"))
            .unwrap());
        assert!(!ev
            .matches_join_candidate(&txn, &on, &left, "w2", &row(9, "bar"))
            .unwrap());
    }
}
