//! The server: databases, WAL, transaction registry and the change-set
//! funnel
//!
//! `apply_change_set` is the single path every mutation takes, whether it
//! originated on a local connection, arrived through consensus, or is being
//! replayed from the WAL during recovery. `submit_change_set` sits in front
//! of it: with a consensus handle attached it proposes the record and the
//! apply happens on the delivery thread of every node; without one it
//! applies locally with the WAL enabled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::changeset::ChangeSet;
use crate::connection::Connection;
use crate::error::{BasaltError, Result};
use crate::raft_server::RaftHandle;
use crate::storage::{Database, Snapshot, Table};
use crate::txn::{Locker, Transaction, TransactionHolder};
use crate::types::{RowId, TxnId, IMMEDIATE_TXN};
use crate::wal::{Wal, WAL_PREFIX, WAL_TMP_PREFIX};
use crate::Config;

/// The explicit bundle replacing process-wide globals: the row locker and
/// the monotonic counters for row handles and transaction numbers. One per
/// server, so tests run fully independent instances.
pub struct ServerContext {
    locker: Arc<Locker>,
    row_ids: AtomicU64,
    txn_numbers: AtomicI64,
}

impl ServerContext {
    pub fn new() -> ServerContext {
        ServerContext {
            locker: Arc::new(Locker::new()),
            row_ids: AtomicU64::new(1),
            txn_numbers: AtomicI64::new(1),
        }
    }

    pub fn locker(&self) -> Arc<Locker> {
        Arc::clone(&self.locker)
    }

    pub fn next_row_id(&self) -> RowId {
        self.row_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_txn_number(&self) -> TxnId {
        self.txn_numbers.fetch_add(1, Ordering::SeqCst)
    }

    /// Keep the local counter ahead of numbers installed by replicated or
    /// replayed Begin records.
    pub fn observe_txn_number(&self, number: TxnId) {
        self.txn_numbers.fetch_max(number + 1, Ordering::SeqCst);
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct ServerShared {
    pub(crate) databases: RwLock<HashMap<String, Database>>,
    pub(crate) wal: Mutex<Wal>,
    pub(crate) holder: TransactionHolder,
    pub(crate) ctx: ServerContext,
    pub(crate) raft: RwLock<Option<RaftHandle>>,
    dir: PathBuf,
}

impl ServerShared {
    /// Propose through consensus when attached, otherwise apply locally.
    pub(crate) fn submit_change_set(
        &self,
        cs: ChangeSet,
        session: Option<&Arc<Transaction>>,
    ) -> Result<()> {
        let raft = self.raft.read().expect("raft lock poisoned");
        match raft.as_ref() {
            Some(handle) => handle.propose(&cs),
            None => {
                drop(raft);
                self.apply_change_set(cs, true, session)
            }
        }
    }

    /// The single funnel. `writes_wal` is true on the leader-local path and
    /// on consensus delivery (the WAL is written on every node at commit),
    /// false during WAL recovery. `session` carries the caller's immediate
    /// transaction so an auto-commit write validates the read-set observed
    /// at plan time; replicated and replayed records apply without one.
    pub(crate) fn apply_change_set(
        &self,
        cs: ChangeSet,
        writes_wal: bool,
        session: Option<&Arc<Transaction>>,
    ) -> Result<()> {
        if !writes_wal {
            let wal = self.wal.lock().expect("wal lock poisoned");
            if cs.lsn() < wal.current_lsn() {
                log::debug!(
                    "skipping record below wal cursor: {} lsn={} cursor={}",
                    cs.kind(),
                    cs.lsn(),
                    wal.current_lsn()
                );
                return Ok(());
            }
        }

        // Commit is logged inside the transaction's commit, while the row
        // locks are held, so durable order matches lock order.
        if let ChangeSet::Commit { txn: number, .. } = cs {
            let txn = self.resolve_txn(number, session)?;
            let mut record = cs;
            let result = if writes_wal {
                txn.commit(|| {
                    let mut wal = self.wal.lock().expect("wal lock poisoned");
                    wal.write(&mut record)
                })
            } else {
                txn.commit(|| Ok(()))
            };
            result?;
            self.holder.remove(number);
            if !writes_wal {
                self.wal.lock().expect("wal lock poisoned").advance_lsn(1);
            }
            return Ok(());
        }

        let mut cs = cs;
        if writes_wal {
            self.wal
                .lock()
                .expect("wal lock poisoned")
                .write(&mut cs)?;
        }

        match cs {
            ChangeSet::CreateDatabase { ref name, .. } => {
                let mut databases = self.databases.write().expect("databases lock poisoned");
                databases.insert(name.clone(), Database::new(name));
            }
            ChangeSet::CreateTable {
                ref database,
                ref name,
                ref row_metas,
                ..
            } => {
                let mut databases = self.databases.write().expect("databases lock poisoned");
                let db = databases
                    .get_mut(database)
                    .ok_or_else(|| BasaltError::database_not_found(database))?;
                db.add_table(Table::new(name, row_metas.clone()));
            }
            ChangeSet::Insert {
                ref database,
                ref table,
                txn,
                ref rows,
                ..
            } => {
                let txn = self.resolve_txn(txn, session)?;
                let mut databases = self.databases.write().expect("databases lock poisoned");
                let db = databases
                    .get_mut(database)
                    .ok_or_else(|| BasaltError::database_not_found(database))?;
                let tb = db
                    .table_mut(table)
                    .ok_or_else(|| BasaltError::table_not_found(database, table))?;
                tb.apply_insert(&self.ctx, &txn, rows, database)?;
            }
            ChangeSet::Update {
                ref database,
                ref table,
                txn,
                ref rows,
                ..
            } => {
                let txn = self.resolve_txn(txn, session)?;
                let databases = self.databases.read().expect("databases lock poisoned");
                let db = databases
                    .get(database)
                    .ok_or_else(|| BasaltError::database_not_found(database))?;
                db.table(table)?.apply_update(&txn, rows, database)?;
            }
            ChangeSet::Begin { txn: number, .. } => {
                self.ctx.observe_txn_number(number);
                let txn = Transaction::new(number, self.ctx.locker());
                if !self.holder.add(txn) {
                    log::debug!("transaction {} already registered", number);
                }
            }
            ChangeSet::Rollback { txn: number, .. } => {
                let txn = self
                    .holder
                    .get(number)
                    .ok_or_else(|| BasaltError::unknown_transaction(number))?;
                let mut databases = self.databases.write().expect("databases lock poisoned");
                txn.rollback(&mut databases);
                drop(databases);
                self.holder.remove(number);
            }
            // A marker in the durable timeline; the transaction's shadows
            // are discarded and the number retired so the retry's replay
            // starts clean on every node.
            ChangeSet::Abort { txn: number, .. } => {
                let txn = self
                    .holder
                    .get(number)
                    .ok_or_else(|| BasaltError::unknown_transaction(number))?;
                let mut databases = self.databases.write().expect("databases lock poisoned");
                txn.rollback(&mut databases);
                drop(databases);
                self.holder.remove(number);
            }
            ChangeSet::Commit { .. } => unreachable!("commit handled above"),
        }

        if !writes_wal {
            self.wal.lock().expect("wal lock poisoned").advance_lsn(1);
        }
        Ok(())
    }

    fn resolve_txn(
        &self,
        number: TxnId,
        session: Option<&Arc<Transaction>>,
    ) -> Result<Arc<Transaction>> {
        if number == IMMEDIATE_TXN {
            return Ok(match session {
                Some(txn) if txn.is_immediate() => Arc::clone(txn),
                _ => Transaction::immediate(self.ctx.locker()),
            });
        }
        self.holder
            .get(number)
            .ok_or_else(|| BasaltError::unknown_transaction(number))
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(config: Config) -> Result<Server> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal = Wal::new(&config.data_dir, WAL_PREFIX)?;

        Ok(Server {
            shared: Arc::new(ServerShared {
                databases: RwLock::new(HashMap::new()),
                wal: Mutex::new(wal),
                holder: TransactionHolder::new(),
                ctx: ServerContext::new(),
                raft: RwLock::new(None),
                dir: config.data_dir,
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }

    pub fn start_connection(&self) -> Connection {
        Connection::new(Arc::clone(&self.shared))
    }

    pub fn wal_exists(&self) -> bool {
        self.shared.wal.lock().expect("wal lock poisoned").exists()
    }

    /// Switch to a fresh temporary WAL, deleting any leftover file. Test
    /// servers call this so durable state never leaks between runs.
    pub fn use_temporary_wal(&self) -> Result<()> {
        let mut wal = self.shared.wal.lock().expect("wal lock poisoned");
        let tmp = Wal::new(&self.shared.dir, WAL_TMP_PREFIX)?;
        tmp.remove()?;
        *wal = tmp;
        Ok(())
    }

    /// Capture the current state as `snapshot.log` at the current LSN.
    pub fn take_snapshot(&self) -> Result<()> {
        let databases = self.shared.databases.read().expect("databases lock poisoned");
        let lsn = self
            .shared
            .wal
            .lock()
            .expect("wal lock poisoned")
            .current_lsn();
        Snapshot::take(lsn, &databases).save(&self.shared.dir)
    }

    pub fn snapshot_exists(&self) -> bool {
        Snapshot::exists(&self.shared.dir)
    }

    /// Replace in-memory state with the snapshot image and rewind the WAL
    /// cursor to the snapshot's LSN.
    pub fn recover_snapshot(&self) -> Result<()> {
        let snapshot = Snapshot::load(&self.shared.dir)?;
        let rebuilt = snapshot.to_databases(&self.shared.ctx);
        *self.shared.databases.write().expect("databases lock poisoned") = rebuilt;
        self.shared
            .wal
            .lock()
            .expect("wal lock poisoned")
            .set_lsn(snapshot.lsn());
        log::info!("snapshot recovered at lsn {}", snapshot.lsn());
        Ok(())
    }

    /// Replay the WAL through the funnel. Records below the cursor (already
    /// covered by the snapshot) are skipped; each replayed record advances
    /// the cursor by one.
    pub fn recover_from_wal(&self) -> Result<()> {
        let records = self.shared.wal.lock().expect("wal lock poisoned").read()?;
        let start = self
            .shared
            .wal
            .lock()
            .expect("wal lock poisoned")
            .current_lsn();
        let total = records.len();

        for cs in records {
            self.shared.apply_change_set(cs, false, None)?;
        }

        log::info!(
            "wal recovery complete: {} records read, cursor {} -> {}",
            total,
            start,
            self.shared
                .wal
                .lock()
                .expect("wal lock poisoned")
                .current_lsn()
        );
        Ok(())
    }

    /// Full recovery: snapshot (when present) then the WAL suffix.
    pub fn recover(&self) -> Result<()> {
        if self.snapshot_exists() {
            self.recover_snapshot()?;
        }
        self.recover_from_wal()
    }

    /// Human-readable dump of every database, table and committed row.
    pub fn inspect(&self) -> String {
        let databases = self.shared.databases.read().expect("databases lock poisoned");
        let mut names: Vec<&String> = databases.keys().collect();
        names.sort();

        let mut out = String::from("<==========Server inspection\n");
        for name in names {
            out.push_str(&databases[name].inspect());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnType, RowMeta};

    fn test_server() -> Server {
        let tmp = tempfile::tempdir().unwrap();
        let server = Server::new(Config {
            data_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        server.use_temporary_wal().unwrap();
        // keep the directory alive for the duration of the test
        std::mem::forget(tmp);
        server
    }

    fn create_db(server: &Server) {
        server
            .shared()
            .apply_change_set(
                ChangeSet::CreateDatabase {
                    lsn: 0,
                    name: "hello".into(),
                },
                true,
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_create_database_change_set() {
        let server = test_server();
        create_db(&server);
        let databases = server.shared().databases.read().unwrap();
        assert!(databases.contains_key("hello"));
    }

    #[test]
    fn test_create_table_requires_database() {
        let server = test_server();
        let err = server
            .shared()
            .apply_change_set(
                ChangeSet::CreateTable {
                    lsn: 0,
                    database: "nope".into(),
                    name: "world".into(),
                    row_metas: vec![],
                },
                true,
                None,
            )
            .unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn test_begin_registers_and_observes_number() {
        let server = test_server();
        server
            .shared()
            .apply_change_set(ChangeSet::Begin { lsn: 0, txn: 40 }, true, None)
            .unwrap();
        assert!(server.shared().holder.get(40).is_some());
        // the local counter moved past the installed number
        assert!(server.shared().ctx.next_txn_number() > 40);
    }

    #[test]
    fn test_commit_unknown_transaction_is_invariant() {
        let server = test_server();
        let err = server
            .shared()
            .apply_change_set(ChangeSet::Commit { lsn: 0, txn: 999 }, true, None)
            .unwrap_err();
        assert!(matches!(err, BasaltError::Invariant(_)));
    }

    #[test]
    fn test_recovery_skips_applied_records() {
        let server = test_server();
        create_db(&server);
        server
            .shared()
            .apply_change_set(
                ChangeSet::CreateTable {
                    lsn: 0,
                    database: "hello".into(),
                    name: "world".into(),
                    row_metas: vec![RowMeta {
                        name: "id".into(),
                        column_type: ColumnType::Int,
                        length: 0,
                        allows_null: true,
                    }],
                },
                true,
                None,
            )
            .unwrap();

        // replaying the full wal against the live cursor must change nothing
        let before = server.inspect();
        server.recover_from_wal().unwrap();
        assert_eq!(server.inspect(), before);
    }
}
