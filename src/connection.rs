//! Connections
//!
//! A connection is a session: it owns the immediate (auto-commit)
//! transaction and the current transaction, translates parsed statements
//! into change-sets, and drives the commit retry loop. On a conflict it
//! aborts, replays the transaction's statement history on a fresh
//! transaction and commits again, until the commit lands or a non-conflict
//! error surfaces.

use std::sync::Arc;
use std::time::Duration;

use crate::changeset::ChangeSet;
use crate::error::{BasaltError, Result};
use crate::executor::SelectEvaluator;
use crate::parser::ast::{
    CreateDatabaseStmt, CreateTableStmt, InsertStmt, SelectStmt, Statement, UpdateStmt,
};
use crate::parser::Parser;
use crate::server::ServerShared;
use crate::txn::Transaction;
use crate::types::{ResultSet, PRIMARY_KEY};

const BEGIN_WAIT: Duration = Duration::from_secs(1);

pub struct Connection {
    shared: Arc<ServerShared>,
    immediate: Arc<Transaction>,
    current: Arc<Transaction>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<ServerShared>) -> Connection {
        let immediate = Transaction::immediate(shared.ctx.locker());
        Connection {
            shared,
            current: Arc::clone(&immediate),
            immediate,
        }
    }

    pub fn in_transaction(&self) -> bool {
        !self.current.is_immediate()
    }

    /// Execute one statement. Parse errors are logged and return an empty
    /// result without touching state; every other error goes to the caller.
    pub fn query(&mut self, sql: &str) -> Result<ResultSet> {
        let stmt = match Parser::parse(sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                log::error!("invalid sql: {} ({})", e, sql);
                return Ok(ResultSet::empty());
            }
        };
        log::debug!("sql: {}", sql);

        // the immediate transaction is statement-scoped
        if self.current.is_immediate() {
            self.current.clear_reads();
        }

        let result = match stmt {
            Statement::Begin => self.begin().map(|_| ResultSet::empty()),
            Statement::Rollback => self.rollback().map(|_| ResultSet::empty()),
            Statement::Commit => self.commit_with_retry().map(|_| ResultSet::empty()),
            Statement::Select(s) => self.select(&s),
            Statement::Insert(s) => {
                if !self.current.is_immediate() {
                    self.current.add_history(sql);
                }
                self.insert(&s).map(|_| ResultSet::empty())
            }
            Statement::Update(s) => {
                if !self.current.is_immediate() {
                    self.current.add_history(sql);
                }
                self.update(&s).map(|_| ResultSet::empty())
            }
            Statement::CreateDatabase(s) => self.create_database(&s).map(|_| ResultSet::empty()),
            Statement::CreateTable(s) => self.create_table(&s).map(|_| ResultSet::empty()),
        };

        if let Err(e) = &result {
            log::error!("invalid query: {} ({})", e, sql);
        }
        result
    }

    fn begin(&mut self) -> Result<()> {
        let number = self.shared.ctx.next_txn_number();
        self.shared
            .submit_change_set(ChangeSet::Begin { lsn: 0, txn: number }, None)?;

        // registration happens on the apply path, which is remote under
        // consensus; rejoin the registered instance
        self.current = self
            .shared
            .holder
            .wait(number, BEGIN_WAIT)
            .ok_or_else(|| {
                BasaltError::Replication(format!("transaction {} was not registered", number))
            })?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.current.is_immediate() {
            self.shared.submit_change_set(
                ChangeSet::Rollback {
                    lsn: 0,
                    txn: self.current.number(),
                },
                None,
            )?;
        }
        self.current = Arc::clone(&self.immediate);
        Ok(())
    }

    fn commit_with_retry(&mut self) -> Result<()> {
        let mut result = self.commit();
        loop {
            if !matches!(&result, Err(e) if e.is_conflict()) {
                return result;
            }
            // the conflicted transaction is still current; take its history
            // before the abort discards it
            let history = self.current.history();
            log::debug!(
                "commit conflict on transaction {}, retrying {} statements",
                self.current.number(),
                history.len()
            );
            self.abort()?;
            result = self.retry(&history);
        }
    }

    fn commit(&mut self) -> Result<()> {
        if !self.current.is_immediate() {
            self.shared.submit_change_set(
                ChangeSet::Commit {
                    lsn: 0,
                    txn: self.current.number(),
                },
                None,
            )?;
        }
        self.current = Arc::clone(&self.immediate);
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.shared.submit_change_set(
            ChangeSet::Abort {
                lsn: 0,
                txn: self.current.number(),
            },
            None,
        )
    }

    /// Start over: new transaction, replay the recorded statements, commit.
    fn retry(&mut self, history: &[String]) -> Result<()> {
        self.begin()?;
        for sql in history {
            self.query(sql)?;
        }
        self.commit()
    }

    fn select(&self, stmt: &SelectStmt) -> Result<ResultSet> {
        let databases = self.shared.databases.read().expect("databases lock poisoned");
        SelectEvaluator.select(&self.current, stmt, &databases)
    }

    fn insert(&mut self, stmt: &InsertStmt) -> Result<()> {
        let rows = {
            let databases = self.shared.databases.read().expect("databases lock poisoned");
            let db = databases
                .get(&stmt.database)
                .ok_or_else(|| BasaltError::database_not_found(&stmt.database))?;
            db.table(&stmt.table)?.plan_insert(&self.current, stmt)?
        };
        if rows.is_empty() {
            return Ok(());
        }

        self.shared.submit_change_set(
            ChangeSet::Insert {
                lsn: 0,
                database: stmt.database.clone(),
                table: stmt.table.clone(),
                txn: self.current.number(),
                rows,
            },
            Some(&self.current),
        )
    }

    fn update(&mut self, stmt: &UpdateStmt) -> Result<()> {
        let rows = {
            let databases = self.shared.databases.read().expect("databases lock poisoned");
            let db = databases
                .get(&stmt.database)
                .ok_or_else(|| BasaltError::database_not_found(&stmt.database))?;
            db.table(&stmt.table)?.plan_update(&self.current, stmt)?
        };
        if rows.is_empty() {
            return Ok(());
        }

        self.shared.submit_change_set(
            ChangeSet::Update {
                lsn: 0,
                database: stmt.database.clone(),
                table: stmt.table.clone(),
                txn: self.current.number(),
                rows,
            },
            Some(&self.current),
        )
    }

    fn create_database(&self, stmt: &CreateDatabaseStmt) -> Result<()> {
        {
            let databases = self.shared.databases.read().expect("databases lock poisoned");
            if databases.contains_key(&stmt.name) {
                return Err(BasaltError::Semantic(format!(
                    "database already exists: {}",
                    stmt.name
                )));
            }
        }
        self.shared.submit_change_set(
            ChangeSet::CreateDatabase {
                lsn: 0,
                name: stmt.name.clone(),
            },
            None,
        )
    }

    fn create_table(&self, stmt: &CreateTableStmt) -> Result<()> {
        if let Some(pk) = &stmt.primary_key {
            if pk != PRIMARY_KEY {
                return Err(BasaltError::Semantic(format!(
                    "only '{}' can be the primary key",
                    PRIMARY_KEY
                )));
            }
        }

        {
            let databases = self.shared.databases.read().expect("databases lock poisoned");
            let db = databases
                .get(&stmt.database)
                .ok_or_else(|| BasaltError::database_not_found(&stmt.database))?;
            if db.has_table(&stmt.table) {
                return Err(BasaltError::Semantic(format!(
                    "table already exists: {}.{}",
                    stmt.database, stmt.table
                )));
            }
        }

        self.shared.submit_change_set(
            ChangeSet::CreateTable {
                lsn: 0,
                database: stmt.database.clone(),
                name: stmt.table.clone(),
                row_metas: stmt.columns.iter().map(|c| c.to_row_meta()).collect(),
            },
            None,
        )
    }
}
