//! Query evaluation
//!
//! Trivial select pipeline: build the FROM rows (with an alias-aware
//! pre-filter), extend them through naive nested-loop inner joins, run the
//! WHERE filter over the fully joined rows, project. All reads go through
//! the transaction so a session observes its own uncommitted shadows.

pub mod evaluator;

pub use evaluator::ExprEvaluator;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BasaltError, Result};
use crate::join::JoinRow;
use crate::parser::ast::{SelectColumn, SelectStmt, TableRef};
use crate::storage::Database;
use crate::txn::Transaction;
use crate::types::ResultSet;

pub struct SelectEvaluator;

impl SelectEvaluator {
    pub fn select(
        &self,
        txn: &Arc<Transaction>,
        stmt: &SelectStmt,
        databases: &HashMap<String, Database>,
    ) -> Result<ResultSet> {
        let rows = self.base_rows(txn, stmt, databases)?;

        let rows = match &stmt.join {
            Some(join) => {
                let table = lookup(databases, &join.table)?;
                let alias = join.table.alias_or_name();
                let columns = table.column_names();
                let evaluator = ExprEvaluator;

                let mut joined = Vec::new();
                for left in &rows {
                    for right in table.rows() {
                        if evaluator.matches_join_candidate(txn, &join.on, left, alias, right)? {
                            joined.push(left.add(alias, Arc::clone(right), columns.clone())?);
                        }
                    }
                }

                match &stmt.where_clause {
                    Some(expr) => evaluator.filter_join_rows(txn, expr, joined)?,
                    None => joined,
                }
            }
            None => rows,
        };

        self.project(txn, stmt, &rows, databases)
    }

    fn base_rows(
        &self,
        txn: &Arc<Transaction>,
        stmt: &SelectStmt,
        databases: &HashMap<String, Database>,
    ) -> Result<Vec<JoinRow>> {
        let table = lookup(databases, &stmt.from)?;
        let alias = stmt.from.alias_or_name();
        let columns = table.column_names();
        let evaluator = ExprEvaluator;

        let mut rows = Vec::new();
        for row in table.rows() {
            if let Some(expr) = &stmt.where_clause {
                if !evaluator.matches_row(txn, alias, expr, row)? {
                    continue;
                }
            }
            rows.push(JoinRow::new(alias, Arc::clone(row), columns.clone()));
        }
        Ok(rows)
    }

    fn project(
        &self,
        txn: &Arc<Transaction>,
        stmt: &SelectStmt,
        rows: &[JoinRow],
        databases: &HashMap<String, Database>,
    ) -> Result<ResultSet> {
        // (alias-or-empty, column) selection list
        let selection: Vec<(String, String)> = if let Some(first) = rows.first() {
            let mut sel = Vec::new();
            for column in &stmt.columns {
                match column {
                    SelectColumn::Star => sel.extend(first.all_columns()),
                    SelectColumn::Column { table, name } => {
                        sel.push((table.clone().unwrap_or_default(), name.clone()))
                    }
                }
            }
            sel
        } else {
            // no rows: derive the header from table metadata
            let mut sel = Vec::new();
            for column in &stmt.columns {
                match column {
                    SelectColumn::Star => {
                        let from = lookup(databases, &stmt.from)?;
                        let from_alias = stmt.from.alias_or_name().to_string();
                        sel.extend(
                            from.column_names()
                                .into_iter()
                                .map(|c| (from_alias.clone(), c)),
                        );
                        if let Some(join) = &stmt.join {
                            let right = lookup(databases, &join.table)?;
                            let right_alias = join.table.alias_or_name().to_string();
                            sel.extend(
                                right
                                    .column_names()
                                    .into_iter()
                                    .map(|c| (right_alias.clone(), c)),
                            );
                        }
                    }
                    SelectColumn::Column { table, name } => {
                        sel.push((table.clone().unwrap_or_default(), name.clone()))
                    }
                }
            }
            sel
        };

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let mut line = Vec::with_capacity(selection.len());
            for (alias, column) in &selection {
                line.push(row.get(txn, alias, column)?);
            }
            values.push(line);
        }

        let columns = selection.into_iter().map(|(_, c)| c).collect();
        Ok(ResultSet::new(columns, values))
    }
}

fn lookup<'a>(
    databases: &'a HashMap<String, Database>,
    table: &TableRef,
) -> Result<&'a crate::storage::Table> {
    let db = databases
        .get(&table.database)
        .ok_or_else(|| BasaltError::database_not_found(&table.database))?;
    db.table(&table.table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::parser::ast::Statement;
    use crate::server::ServerContext;
    use crate::storage::Table;
    use crate::txn::Locker;
    use crate::types::{ColumnType, RowMeta};

    fn world_metas() -> Vec<RowMeta> {
        vec![
            RowMeta {
                name: "id".into(),
                column_type: ColumnType::AutoIncrementInt,
                length: 0,
                allows_null: true,
            },
            RowMeta {
                name: "message".into(),
                column_type: ColumnType::VarChar,
                length: 10,
                allows_null: true,
            },
        ]
    }

    fn setup(messages: &[&str]) -> (HashMap<String, Database>, Arc<Transaction>) {
        let ctx = ServerContext::new();
        let txn = Transaction::immediate(Arc::new(Locker::new()));
        let mut table = Table::new("world", world_metas());
        let stmt = crate::parser::ast::InsertStmt {
            database: "hello".into(),
            table: "world".into(),
            columns: vec!["message".into()],
            rows: messages.iter().map(|m| vec![m.to_string()]).collect(),
        };
        let rows = table.plan_insert(&txn, &stmt).unwrap();
        table.apply_insert(&ctx, &txn, &rows, "hello").unwrap();

        let mut db = Database::new("hello");
        db.add_table(table);
        let mut databases = HashMap::new();
        databases.insert("hello".to_string(), db);
        (databases, txn)
    }

    fn select(sql: &str) -> SelectStmt {
        match Parser::parse(sql).unwrap() {
            Statement::Select(s) => s,
            other => panic!("not a select: {:?}", other),
        }
    }

    #[test]
    fn test_select_star() {
        let (databases, txn) = setup(&["foo", "bar"]);
        let stmt = select("SELECT * FROM hello.world");
        let result = SelectEvaluator.select(&txn, &stmt, &databases).unwrap();
        assert_eq!(result.columns, vec!["id", "message"]);
        assert_eq!(
            result.values,
            vec![
                vec!["1".to_string(), "foo".to_string()],
                vec!["2".to_string(), "bar".to_string()],
            ]
        );
    }

    #[test]
    fn test_select_projection_and_where() {
        let (databases, txn) = setup(&["foo", "bar"]);
        let stmt = select("SELECT message FROM hello.world WHERE id = 2");
        let result = SelectEvaluator.select(&txn, &stmt, &databases).unwrap();
        assert_eq!(result.columns, vec!["message"]);
        assert_eq!(result.values, vec![vec!["bar".to_string()]]);
    }

    #[test]
    fn test_select_empty_keeps_header() {
        let (databases, txn) = setup(&["foo"]);
        let stmt = select("SELECT * FROM hello.world WHERE id = 99");
        let result = SelectEvaluator.select(&txn, &stmt, &databases).unwrap();
        assert_eq!(result.columns, vec!["id", "message"]);
        assert!(result.is_empty());
    }

    #[test]
    fn test_select_unknown_table() {
        let (databases, txn) = setup(&["foo"]);
        let stmt = select("SELECT * FROM hello.nothing");
        assert!(SelectEvaluator.select(&txn, &stmt, &databases).is_err());
    }

    #[test]
    fn test_self_join() {
        let (databases, txn) = setup(&["foo", "bar", "baz", "qux"]);
        let stmt = select(
            "SELECT * FROM hello.world AS w1 \
             INNER JOIN hello.world AS w2 ON w1.message != w2.message \
             WHERE w1.id != 1 AND w2.id != 2 AND w1.id != 1",
        );
        let result = SelectEvaluator.select(&txn, &stmt, &databases).unwrap();
        assert_eq!(result.columns, vec!["id", "message", "id", "message"]);

        let expected: Vec<Vec<String>> = vec![
            vec!["2", "bar", "1", "foo"],
            vec!["2", "bar", "3", "baz"],
            vec!["2", "bar", "4", "qux"],
            vec!["3", "baz", "1", "foo"],
            vec!["3", "baz", "4", "qux"],
            vec!["4", "qux", "1", "foo"],
            vec!["4", "qux", "3", "baz"],
        ]
        .into_iter()
        .map(|r| r.into_iter().map(String::from).collect())
        .collect();
        assert_eq!(result.values, expected);
    }
}
