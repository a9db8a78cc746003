//! In-memory data model: databases, tables, rows and snapshots.

pub mod row;
pub mod snapshot;
pub mod table;

pub use row::Row;
pub use snapshot::Snapshot;
pub use table::{Index, Table};

use std::collections::HashMap;

use crate::error::{BasaltError, Result};

/// A named collection of tables. Created by a CreateDatabase change-set,
/// never destroyed.
pub struct Database {
    name: String,
    tables: HashMap<String, Table>,
}

impl Database {
    pub fn new(name: &str) -> Database {
        Database {
            name: name.to_string(),
            tables: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name().to_string(), table);
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| BasaltError::table_not_found(&self.name, name))
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn inspect(&self) -> String {
        let mut out = format!("Database: {}\n", self.name);
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        for name in names {
            out.push_str(&self.tables[name].inspect());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnType, RowMeta};

    fn world_table() -> Table {
        Table::new(
            "world",
            vec![RowMeta {
                name: "id".into(),
                column_type: ColumnType::Int,
                length: 0,
                allows_null: true,
            }],
        )
    }

    #[test]
    fn test_table_lookup() {
        let mut db = Database::new("hello");
        assert!(!db.has_table("world"));
        db.add_table(world_table());
        assert!(db.has_table("world"));
        assert_eq!(db.table("world").unwrap().name(), "world");
        assert!(db.table("missing").is_err());
    }

    #[test]
    fn test_inspect_mentions_tables() {
        let mut db = Database::new("hello");
        db.add_table(world_table());
        let dump = db.inspect();
        assert!(dump.contains("Database: hello"));
        assert!(dump.contains("Table: world"));
    }
}
