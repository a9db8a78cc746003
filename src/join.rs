//! Joined rows
//!
//! A `JoinRow` is one output row of the FROM clause: an ordered list of
//! (alias, row) pairs plus a map resolving unqualified column names to the
//! alias that owns them. A column appearing under more than one alias
//! becomes ambiguous and must be qualified.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BasaltError, Result};
use crate::storage::Row;
use crate::txn::Transaction;

#[derive(Clone)]
pub struct JoinRow {
    entries: Vec<JoinEntry>,
    /// column name → owning alias; `None` marks an ambiguous column
    col_map: HashMap<String, Option<String>>,
}

#[derive(Clone)]
struct JoinEntry {
    alias: String,
    row: Arc<Row>,
    columns: Vec<String>,
}

impl JoinRow {
    pub fn new(alias: &str, row: Arc<Row>, columns: Vec<String>) -> JoinRow {
        let col_map = columns
            .iter()
            .map(|c| (c.clone(), Some(alias.to_string())))
            .collect();
        JoinRow {
            entries: vec![JoinEntry {
                alias: alias.to_string(),
                row,
                columns,
            }],
            col_map,
        }
    }

    /// Extend with one more table's row; columns clashing with an existing
    /// alias become ambiguous.
    pub fn add(&self, alias: &str, row: Arc<Row>, columns: Vec<String>) -> Result<JoinRow> {
        if self.entries.iter().any(|e| e.alias == alias) {
            return Err(BasaltError::Semantic(format!(
                "not unique table/alias: {}",
                alias
            )));
        }

        let mut joined = self.clone();
        for column in &columns {
            match joined.col_map.get(column) {
                Some(_) => {
                    joined.col_map.insert(column.clone(), None);
                }
                None => {
                    joined
                        .col_map
                        .insert(column.clone(), Some(alias.to_string()));
                }
            }
        }
        joined.entries.push(JoinEntry {
            alias: alias.to_string(),
            row,
            columns,
        });
        Ok(joined)
    }

    /// Value of a column, qualified by alias or resolved through the column
    /// map when the qualifier is empty.
    pub fn get(&self, txn: &Arc<Transaction>, alias: &str, column: &str) -> Result<String> {
        if !alias.is_empty() {
            let entry = self
                .entries
                .iter()
                .find(|e| e.alias == alias)
                .ok_or_else(|| {
                    BasaltError::Semantic(format!("unknown table in field list: {}", alias))
                })?;
            return Ok(txn.read(&entry.row, column));
        }

        match self.col_map.get(column) {
            Some(Some(owner)) => {
                let entry = self
                    .entries
                    .iter()
                    .find(|e| e.alias == *owner)
                    .expect("column map points at a missing alias");
                Ok(txn.read(&entry.row, column))
            }
            Some(None) => Err(BasaltError::Semantic(format!(
                "column is ambiguous: {}",
                column
            ))),
            None => Err(BasaltError::unknown_column(column)),
        }
    }

    /// (alias, column) pairs in entry order; the star expansion.
    pub fn all_columns(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .flat_map(|e| {
                e.columns
                    .iter()
                    .map(move |c| (e.alias.clone(), c.clone()))
            })
            .collect()
    }
}
