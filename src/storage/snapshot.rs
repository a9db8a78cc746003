//! Snapshots
//!
//! A point-in-time serialized image of every database, table and committed
//! row, together with the WAL LSN at which it was taken. Recovery loads the
//! image, rewinds the WAL cursor to that LSN and replays the suffix.
//!
//! The image is one JSON file, `snapshot.log`, written atomically through a
//! temporary file in the same directory.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::server::ServerContext;
use crate::types::{Lsn, RowMeta};

use super::table::Index;
use super::{Database, Row, Table};

pub const SNAPSHOT_FILE: &str = "snapshot.log";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    lsn: Lsn,
    databases: Vec<DatabaseImage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatabaseImage {
    name: String,
    tables: Vec<TableImage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableImage {
    name: String,
    row_metas: Vec<RowMeta>,
    rows: Vec<RowImage>,
    indexes: Vec<IndexImage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RowImage {
    columns: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexImage {
    name: String,
    tree: BTreeMap<String, i64>,
}

pub struct Snapshot {
    data: SnapshotData,
}

impl Snapshot {
    /// Capture the committed state of every database at the given LSN.
    pub fn take(lsn: Lsn, databases: &HashMap<String, Database>) -> Snapshot {
        let mut names: Vec<&String> = databases.keys().collect();
        names.sort();

        let images = names
            .into_iter()
            .map(|name| {
                let db = &databases[name];
                let mut table_names: Vec<String> =
                    db.tables().map(|t| t.name().to_string()).collect();
                table_names.sort();

                let tables = table_names
                    .into_iter()
                    .map(|tname| {
                        let table = db.table(&tname).expect("table listed but missing");
                        let rows = table
                            .rows()
                            .iter()
                            .map(|r| RowImage {
                                columns: r.committed_columns(),
                            })
                            .collect();
                        let mut indexes: Vec<IndexImage> = table
                            .indexes()
                            .iter()
                            .map(|(iname, idx)| IndexImage {
                                name: iname.clone(),
                                tree: idx.tree.clone(),
                            })
                            .collect();
                        indexes.sort_by(|a, b| a.name.cmp(&b.name));
                        TableImage {
                            name: table.name().to_string(),
                            row_metas: table.row_metas().to_vec(),
                            rows,
                            indexes,
                        }
                    })
                    .collect();

                DatabaseImage {
                    name: db.name().to_string(),
                    tables,
                }
            })
            .collect();

        Snapshot {
            data: SnapshotData {
                lsn,
                databases: images,
            },
        }
    }

    pub fn lsn(&self) -> Lsn {
        self.data.lsn
    }

    /// Write the image as `snapshot.log` in `dir`, atomically.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let bytes = serde_json::to_vec(&self.data)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.flush()?;
        file.persist(dir.join(SNAPSHOT_FILE))
            .map_err(|e| e.error)?;

        log::info!("snapshot saved at lsn {}", self.data.lsn);
        Ok(())
    }

    /// Load a previously saved image. Fails when none exists.
    pub fn load(dir: impl AsRef<Path>) -> Result<Snapshot> {
        let bytes = std::fs::read(dir.as_ref().join(SNAPSHOT_FILE))?;
        let data: SnapshotData = serde_json::from_slice(&bytes)?;
        Ok(Snapshot { data })
    }

    pub fn exists(dir: impl AsRef<Path>) -> bool {
        dir.as_ref().join(SNAPSHOT_FILE).exists()
    }

    /// Rebuild the in-memory graph: every row committed, version 0, no
    /// shadows, with fresh row handles drawn from the server context.
    pub fn to_databases(&self, ctx: &ServerContext) -> HashMap<String, Database> {
        let mut databases = HashMap::new();
        for image in &self.data.databases {
            let mut db = Database::new(&image.name);
            for timage in &image.tables {
                let mut table = Table::new(&timage.name, timage.row_metas.clone());
                for rimage in &timage.rows {
                    table.push_row(Row::new(ctx.next_row_id(), rimage.columns.clone()));
                }
                let indexes: HashMap<String, Index> = timage
                    .indexes
                    .iter()
                    .map(|i| {
                        (
                            i.name.clone(),
                            Index {
                                tree: i.tree.clone(),
                            },
                        )
                    })
                    .collect();
                table.set_indexes(indexes);
                db.add_table(table);
            }
            databases.insert(image.name.clone(), db);
        }
        databases
    }
}
