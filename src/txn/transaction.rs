//! Transactions
//!
//! A transaction tracks what it read (row → observed version), what it wrote
//! (row → shadow columns), and the statement texts that produced the writes,
//! so the connection can replay them after a conflict.
//!
//! Reads record the row version on first touch. Writes inside an explicit
//! transaction go to a private shadow; the row itself is untouched until
//! commit. Commit acquires the locker mutex of every read row in `RowId`
//! order, re-checks the observed versions under the locks, runs the caller's
//! WAL callback, installs the shadows and bumps versions, then releases.
//! A version mismatch releases everything and fails with `Conflict`.
//!
//! The immediate transaction (number -1) is the auto-commit fast path: its
//! write acquires the same locks, validates, mutates the row in place and
//! releases, all within one call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{BasaltError, Result};
use crate::storage::{Database, Row};
use crate::types::{RowId, TxnId, IMMEDIATE_TXN, PRIMARY_KEY};

use super::locker::Locker;

struct ReadEntry {
    row: Arc<Row>,
    version: u64,
}

struct WriteEntry {
    row: Arc<Row>,
    shadow: HashMap<String, String>,
    database: String,
    table: String,
}

#[derive(Default)]
struct TxnState {
    read_set: HashMap<RowId, ReadEntry>,
    /// BTreeMap so commit applies shadows in row order.
    write_set: BTreeMap<RowId, WriteEntry>,
    history: Vec<String>,
    locking: bool,
    /// Rows locked by the last expand, released by the next shrink.
    locked: Vec<RowId>,
}

pub struct Transaction {
    number: TxnId,
    locker: Arc<Locker>,
    state: Mutex<TxnState>,
}

impl Transaction {
    pub fn new(number: TxnId, locker: Arc<Locker>) -> Arc<Transaction> {
        Arc::new(Transaction {
            number,
            locker,
            state: Mutex::new(TxnState::default()),
        })
    }

    /// The auto-commit context of a connection.
    pub fn immediate(locker: Arc<Locker>) -> Arc<Transaction> {
        Transaction::new(IMMEDIATE_TXN, locker)
    }

    pub fn number(&self) -> TxnId {
        self.number
    }

    pub fn is_immediate(&self) -> bool {
        self.number == IMMEDIATE_TXN
    }

    pub fn add_history(&self, sql: &str) {
        self.state
            .lock()
            .expect("txn lock poisoned")
            .history
            .push(sql.to_string());
    }

    pub fn history(&self) -> Vec<String> {
        self.state.lock().expect("txn lock poisoned").history.clone()
    }

    /// Read a column through this transaction: records the row version on
    /// first touch (outside the locked commit window) and prefers the
    /// transaction's own shadow over the committed state.
    pub fn read(&self, row: &Arc<Row>, column: &str) -> String {
        let mut state = self.state.lock().expect("txn lock poisoned");
        if !state.locking {
            state.read_set.entry(row.id()).or_insert_with(|| ReadEntry {
                row: Arc::clone(row),
                version: row.version(),
            });
        }
        match state.write_set.get(&row.id()) {
            Some(entry) => entry.shadow.get(column).cloned().unwrap_or_default(),
            None => row.committed_value(column),
        }
    }

    /// Like `read`, but without registering the observation. Used where a
    /// plan needs a value without tying its fate to the row (auto-increment
    /// scans).
    pub fn peek(&self, row: &Arc<Row>, column: &str) -> String {
        let state = self.state.lock().expect("txn lock poisoned");
        match state.write_set.get(&row.id()) {
            Some(entry) => entry.shadow.get(column).cloned().unwrap_or_default(),
            None => row.committed_value(column),
        }
    }

    /// Primary key of a row as this transaction sees it.
    pub fn primary_key_of(&self, row: &Arc<Row>) -> i64 {
        self.read(row, PRIMARY_KEY).parse().unwrap_or(0)
    }

    /// Write values into a row.
    ///
    /// Immediate transaction: lock the read-set, re-validate versions,
    /// mutate in place, release. Explicit transaction: merge into the shadow
    /// and mark the row as changed by this transaction.
    pub fn write(
        &self,
        row: &Arc<Row>,
        values: &HashMap<String, String>,
        database: &str,
        table: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("txn lock poisoned");

        if self.is_immediate() {
            state.read_set.entry(row.id()).or_insert_with(|| ReadEntry {
                row: Arc::clone(row),
                version: row.version(),
            });
            self.expand_lock(&mut state)?;
            row.mutate(values);
            self.shrink_lock(&mut state);
            return Ok(());
        }

        let entry = state
            .write_set
            .entry(row.id())
            .or_insert_with(|| WriteEntry {
                row: Arc::clone(row),
                shadow: row.committed_columns(),
                database: database.to_string(),
                table: table.to_string(),
            });
        for (name, value) in values {
            entry.shadow.insert(name.clone(), value.clone());
        }
        row.mark_changed(self.number);
        Ok(())
    }

    /// Register the shadow of a row inserted by this transaction. The row
    /// sits in its table with empty committed columns until commit.
    pub fn attach_insert_shadow(
        &self,
        row: &Arc<Row>,
        columns: HashMap<String, String>,
        database: &str,
        table: &str,
    ) {
        let mut state = self.state.lock().expect("txn lock poisoned");
        state.write_set.insert(
            row.id(),
            WriteEntry {
                row: Arc::clone(row),
                shadow: columns,
                database: database.to_string(),
                table: table.to_string(),
            },
        );
        row.mark_changed(self.number);
    }

    /// Acquire the locker mutex of every read row in `RowId` order, then
    /// re-check each observed version under the lock. On mismatch, release
    /// everything acquired and fail with `Conflict`.
    fn expand_lock(&self, state: &mut TxnState) -> Result<()> {
        let mut entries: Vec<(RowId, Arc<Row>, u64)> = state
            .read_set
            .values()
            .map(|e| (e.row.id(), Arc::clone(&e.row), e.version))
            .collect();
        entries.sort_by_key(|(id, _, _)| *id);

        let mut locked = Vec::with_capacity(entries.len());
        for (id, row, observed) in entries {
            self.locker.lock(id, self.number);
            locked.push(id);
            if row.version() != observed {
                for id in locked {
                    self.locker.unlock(id, self.number);
                }
                return Err(BasaltError::Conflict(format!(
                    "row {} changed since read (observed version {}, now {})",
                    id,
                    observed,
                    row.version()
                )));
            }
        }

        state.locked = locked;
        state.locking = true;
        Ok(())
    }

    /// Release every lock taken by the last expand and reset read tracking.
    fn shrink_lock(&self, state: &mut TxnState) {
        for id in std::mem::take(&mut state.locked) {
            self.locker.unlock(id, self.number);
        }
        state.read_set.clear();
        state.locking = false;
    }

    /// Commit: expand the lock over the read-set, run `after_lock` (the
    /// WAL write of the commit record, so durable order matches lock order),
    /// install every shadow and release.
    pub fn commit<F>(&self, after_lock: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock().expect("txn lock poisoned");
        self.expand_lock(&mut state)?;

        if let Err(e) = after_lock() {
            self.shrink_lock(&mut state);
            return Err(e);
        }

        for entry in state.write_set.values() {
            entry.row.install(entry.shadow.clone());
            entry.row.clear_changed(self.number);
        }
        state.write_set.clear();
        state.history.clear();
        self.shrink_lock(&mut state);
        Ok(())
    }

    /// Discard every shadow. Rows that were inserted by this transaction and
    /// never committed are removed from their tables.
    pub fn rollback(&self, databases: &mut HashMap<String, Database>) {
        let entries: Vec<WriteEntry> = {
            let mut state = self.state.lock().expect("txn lock poisoned");
            let entries = std::mem::take(&mut state.write_set);
            state.read_set.clear();
            state.history.clear();
            entries.into_values().collect()
        };

        for entry in entries {
            entry.row.clear_changed(self.number);
            if entry.row.is_orphaned() {
                if let Some(db) = databases.get_mut(&entry.database) {
                    if let Some(table) = db.table_mut(&entry.table) {
                        table.remove_row(entry.row.id());
                    }
                }
            }
        }
    }

    /// Forget recorded reads. The connection calls this at each statement
    /// boundary of the immediate transaction, which is statement-scoped.
    pub fn clear_reads(&self) {
        self.state
            .lock()
            .expect("txn lock poisoned")
            .read_set
            .clear();
    }

    pub fn has_shadow(&self, row: &Arc<Row>) -> bool {
        self.state
            .lock()
            .expect("txn lock poisoned")
            .write_set
            .contains_key(&row.id())
    }

    #[cfg(test)]
    pub(crate) fn read_set_len(&self) -> usize {
        self.state.lock().expect("txn lock poisoned").read_set.len()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("number", &self.number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn columns(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn setup() -> (Arc<Locker>, Arc<Row>) {
        let locker = Arc::new(Locker::new());
        let row = Row::new(1, columns(&[("id", "1"), ("message", "foo")]));
        (locker, row)
    }

    #[test]
    fn test_read_records_version_once() {
        let (locker, row) = setup();
        let txn = Transaction::new(10, locker);
        assert_eq!(txn.read(&row, "message"), "foo");
        assert_eq!(txn.read(&row, "id"), "1");
        assert_eq!(txn.read_set_len(), 1);
    }

    #[test]
    fn test_write_in_transaction_shadows() {
        let (locker, row) = setup();
        let txn = Transaction::new(10, locker);

        txn.write(&row, &columns(&[("message", "bar")]), "hello", "world")
            .unwrap();
        // shadow visible to the writer, committed state untouched
        assert_eq!(txn.read(&row, "message"), "bar");
        assert_eq!(row.committed_value("message"), "foo");
        assert_eq!(row.version(), 0);
        assert!(row.changed_by(10));
    }

    #[test]
    fn test_immediate_write_mutates_in_place() {
        let (locker, row) = setup();
        let txn = Transaction::immediate(locker);
        txn.read(&row, "message");

        txn.write(&row, &columns(&[("message", "bar")]), "hello", "world")
            .unwrap();
        assert_eq!(row.committed_value("message"), "bar");
        assert_eq!(row.version(), 1);
        // statement released its locks and reads
        assert_eq!(txn.read_set_len(), 0);
    }

    #[test]
    fn test_immediate_write_conflicts_on_stale_read() {
        let (locker, row) = setup();
        let txn = Transaction::immediate(Arc::clone(&locker));
        txn.read(&row, "message");

        // another writer bumps the version between plan and apply
        row.mutate(&columns(&[("message", "sneaky")]));

        let err = txn
            .write(&row, &columns(&[("message", "bar")]), "hello", "world")
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(row.committed_value("message"), "sneaky");
    }

    #[test]
    fn test_commit_applies_shadows() {
        let (locker, row) = setup();
        let txn = Transaction::new(10, locker);
        txn.read(&row, "message");
        txn.write(&row, &columns(&[("message", "bar")]), "hello", "world")
            .unwrap();

        let mut callback_ran = false;
        txn.commit(|| {
            callback_ran = true;
            Ok(())
        })
        .unwrap();

        assert!(callback_ran);
        assert_eq!(row.committed_value("message"), "bar");
        assert_eq!(row.version(), 1);
        assert!(!row.changed_by(10));
    }

    #[test]
    fn test_commit_conflict_on_version_mismatch() {
        let (locker, row) = setup();
        let txn = Transaction::new(10, Arc::clone(&locker));
        txn.read(&row, "message");
        txn.write(&row, &columns(&[("message", "bar")]), "hello", "world")
            .unwrap();

        // concurrent committed write invalidates the observation
        row.install(columns(&[("id", "1"), ("message", "other")]));

        let err = txn.commit(|| Ok(())).unwrap_err();
        assert!(err.is_conflict());
        // nothing applied, locks released
        assert_eq!(row.committed_value("message"), "other");
        assert!(!locker.has_lock(row.id(), 10));
    }

    #[test]
    fn test_commit_callback_failure_releases_locks() {
        let (locker, row) = setup();
        let txn = Transaction::new(10, Arc::clone(&locker));
        txn.read(&row, "message");
        txn.write(&row, &columns(&[("message", "bar")]), "hello", "world")
            .unwrap();

        let err = txn
            .commit(|| Err(BasaltError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk gone",
            ))))
            .unwrap_err();
        assert!(!err.is_conflict());
        assert_eq!(row.committed_value("message"), "foo");
        assert!(!locker.has_lock(row.id(), 10));
    }

    #[test]
    fn test_rollback_discards_shadow_and_orphans() {
        let locker = Arc::new(Locker::new());
        let txn = Transaction::new(10, locker);

        let mut databases = HashMap::new();
        let mut db = Database::new("hello");
        db.add_table(crate::storage::Table::new(
            "world",
            vec![crate::types::RowMeta {
                name: "id".into(),
                column_type: crate::types::ColumnType::Int,
                length: 0,
                allows_null: true,
            }],
        ));
        databases.insert("hello".to_string(), db);

        // a row inserted inside the transaction
        let row = Row::new_pending(7);
        databases
            .get_mut("hello")
            .unwrap()
            .table_mut("world")
            .unwrap()
            .push_row(Arc::clone(&row));
        txn.attach_insert_shadow(&row, columns(&[("id", "7")]), "hello", "world");

        txn.rollback(&mut databases);
        assert!(!row.changed_by(10));
        let remaining = databases["hello"].table("world").unwrap().row_count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_serialized_commits_block_each_other() {
        let locker = Arc::new(Locker::new());
        let row = Row::new(1, HashMap::new());

        let t1 = Transaction::new(21, Arc::clone(&locker));
        let t2 = Transaction::new(22, Arc::clone(&locker));
        t1.read(&row, "id");
        t2.read(&row, "id");

        let row2 = Arc::clone(&row);
        let locker2 = Arc::clone(&locker);
        let handle = thread::spawn(move || {
            // wait until t1 holds the commit lock, then commit t2: it must
            // block, then conflict because t1 bumped the version
            while !locker2.has_lock(row2.id(), 21) {
                thread::sleep(Duration::from_millis(1));
            }
            t2.write(&row2, &HashMap::new(), "hello", "world").unwrap();
            t2.commit(|| Ok(()))
        });

        t1.write(&row, &HashMap::new(), "hello", "world").unwrap();
        let res1 = t1.commit(|| {
            thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        assert!(res1.is_ok());

        let res2 = handle.join().unwrap();
        assert!(res2.unwrap_err().is_conflict());
    }
}
