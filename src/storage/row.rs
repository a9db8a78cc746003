//! Rows
//!
//! A row carries its last committed state, a version counter bumped on every
//! committed mutation, and the set of transactions currently holding an
//! uncommitted shadow of it. Rows are shared as `Arc<Row>` between their
//! table, transaction read/write-sets and the locker; identity is the
//! server-scoped `RowId`, which also gives the total order used for
//! deadlock-free lock acquisition at commit.
//!
//! Uncommitted per-transaction state (the shadow columns) lives in the owning
//! transaction's write-set, not here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::types::{RowId, TxnId, PRIMARY_KEY};

pub struct Row {
    id: RowId,
    inner: RwLock<RowInner>,
}

struct RowInner {
    columns: HashMap<String, String>,
    version: u64,
    changed: HashSet<TxnId>,
}

impl Row {
    /// A committed row with the given columns, version 0.
    pub fn new(id: RowId, columns: HashMap<String, String>) -> Arc<Row> {
        Arc::new(Row {
            id,
            inner: RwLock::new(RowInner {
                columns,
                version: 0,
                changed: HashSet::new(),
            }),
        })
    }

    /// A row inserted inside a transaction: committed columns stay empty
    /// until the transaction's shadow is applied at commit.
    pub fn new_pending(id: RowId) -> Arc<Row> {
        Row::new(id, HashMap::new())
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.inner.read().expect("row lock poisoned").version
    }

    /// Last committed value of a column; empty string when absent.
    pub fn committed_value(&self, column: &str) -> String {
        self.inner
            .read()
            .expect("row lock poisoned")
            .columns
            .get(column)
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed_columns(&self) -> HashMap<String, String> {
        self.inner.read().expect("row lock poisoned").columns.clone()
    }

    /// Committed primary key, if the row has one yet.
    pub fn committed_primary_key(&self) -> Option<i64> {
        self.inner
            .read()
            .expect("row lock poisoned")
            .columns
            .get(PRIMARY_KEY)
            .and_then(|v| v.parse().ok())
    }

    /// Replace the committed columns with a transaction's shadow and bump the
    /// version. Called under the commit lock.
    pub(crate) fn install(&self, columns: HashMap<String, String>) {
        let mut inner = self.inner.write().expect("row lock poisoned");
        inner.columns = columns;
        inner.version += 1;
    }

    /// Merge values into the committed columns and bump the version. The
    /// immediate-transaction write path; called under the commit lock.
    pub(crate) fn mutate(&self, values: &HashMap<String, String>) {
        let mut inner = self.inner.write().expect("row lock poisoned");
        for (name, value) in values {
            inner.columns.insert(name.clone(), value.clone());
        }
        inner.version += 1;
    }

    pub(crate) fn mark_changed(&self, txn: TxnId) {
        self.inner
            .write()
            .expect("row lock poisoned")
            .changed
            .insert(txn);
    }

    pub(crate) fn clear_changed(&self, txn: TxnId) {
        self.inner
            .write()
            .expect("row lock poisoned")
            .changed
            .remove(&txn);
    }

    pub fn changed_by(&self, txn: TxnId) -> bool {
        self.inner
            .read()
            .expect("row lock poisoned")
            .changed
            .contains(&txn)
    }

    /// True when the row was inserted inside a now-dead transaction: nothing
    /// ever committed and no live transaction references it. Such rows are
    /// removed from their table on rollback.
    pub fn is_orphaned(&self) -> bool {
        let inner = self.inner.read().expect("row lock poisoned");
        inner.columns.is_empty() && inner.changed.is_empty()
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("row lock poisoned");
        f.debug_struct("Row")
            .field("id", &self.id)
            .field("version", &inner.version)
            .field("columns", &inner.columns)
            .finish()
    }
}
