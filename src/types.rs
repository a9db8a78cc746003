//! Core types for basalt
//!
//! Column metadata, result sets and the scalar id aliases shared by the
//! storage, transaction and replication layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log sequence number: 0-based position of a record in the WAL since the
/// most recent snapshot.
pub type Lsn = u64;

/// Transaction number. `-1` denotes the immediate (auto-commit) transaction.
pub type TxnId = i64;

/// Stable row handle, unique per server instance. Replaces pointer identity:
/// shadow registries, read-sets and the locker all key on it, and sorting by
/// it gives the deadlock-free lock order at commit.
pub type RowId = u64;

/// Number of the immediate transaction shared by every auto-commit statement.
pub const IMMEDIATE_TXN: TxnId = -1;

/// Name of the primary key column. Inserts may supply it explicitly; updates
/// must never assign it.
pub const PRIMARY_KEY: &str = "id";

/// Column types supported by basalt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// 64-bit signed integer
    Int,
    /// Integer filled from the table's auto-increment sequence when omitted
    AutoIncrementInt,
    /// Variable-length string with a declared maximum length
    VarChar,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int => write!(f, "INT"),
            ColumnType::AutoIncrementInt => write!(f, "INT AUTO_INCREMENT"),
            ColumnType::VarChar => write!(f, "VARCHAR"),
        }
    }
}

/// Per-column schema entry of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMeta {
    pub name: String,
    pub column_type: ColumnType,
    pub length: u32,
    pub allows_null: bool,
}

impl RowMeta {
    pub fn describe(&self) -> String {
        let mut txt = format!("{} {}", self.name, self.column_type);
        if self.column_type == ColumnType::VarChar {
            txt = format!("{} {}({})", self.name, self.column_type, self.length);
        }
        if !self.allows_null {
            txt.push_str(" NOT NULL");
        }
        txt
    }
}

/// Result of a query. Values are carried as strings, matching the storage
/// encoding; numeric columns hold the decimal representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub values: Vec<Vec<String>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, values: Vec<Vec<String>>) -> Self {
        Self { columns, values }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Human-readable dump of the result, one block per row.
    pub fn inspect(&self) -> String {
        let mut out = String::from("<==========Inspect\n");
        for (i, row) in self.values.iter().enumerate() {
            out.push_str(&format!("==== {} ====\n", i));
            for (name, value) in self.columns.iter().zip(row.iter()) {
                out.push_str(&format!("{}\t: {}\n", name, value));
            }
        }
        out
    }

    /// Rows as name→value maps, in result order. Test helper shape.
    pub fn row_maps(&self) -> Vec<std::collections::HashMap<String, String>> {
        self.values
            .iter()
            .map(|vals| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(vals.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_meta_describe() {
        let m = RowMeta {
            name: "message".into(),
            column_type: ColumnType::VarChar,
            length: 10,
            allows_null: true,
        };
        assert_eq!(m.describe(), "message VARCHAR(10)");

        let m = RowMeta {
            name: "num".into(),
            column_type: ColumnType::Int,
            length: 0,
            allows_null: false,
        };
        assert_eq!(m.describe(), "num INT NOT NULL");
    }

    #[test]
    fn test_result_set_row_maps() {
        let rs = ResultSet::new(
            vec!["id".into(), "message".into()],
            vec![vec!["1".into(), "foo".into()]],
        );
        let maps = rs.row_maps();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0]["id"], "1");
        assert_eq!(maps[0]["message"], "foo");
    }
}
