//! Error types for basalt
//!
//! Defines a unified error type that can represent errors from all components.
//! The variants follow the failure taxonomy of the pipeline: parse failures
//! never mutate state, conflicts are retried by the connection, invariant
//! violations indicate a corrupted log or a bug.

use std::fmt;
use std::io;

/// Unified error type for basalt operations
#[derive(Debug)]
pub enum BasaltError {
    /// I/O error (WAL or snapshot file operations)
    Io(io::Error),
    /// SQL syntax error
    Parse(String),
    /// Unknown database/table/column or unsupported expression
    Semantic(String),
    /// Optimistic concurrency conflict detected at lock time
    Conflict(String),
    /// Malformed WAL record or change-set payload
    Format(String),
    /// Consensus-layer failure (propose timeout, decode failure)
    Replication(String),
    /// Broken internal invariant; the node must not continue from this state
    Invariant(String),
}

impl BasaltError {
    /// True for the conflicts the connection resolves by history replay.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BasaltError::Conflict(_))
    }

    pub fn database_not_found(name: &str) -> Self {
        BasaltError::Semantic(format!("database doesn't exist: {}", name))
    }

    pub fn table_not_found(db: &str, table: &str) -> Self {
        BasaltError::Semantic(format!("table doesn't exist: {}.{}", db, table))
    }

    pub fn unknown_column(name: &str) -> Self {
        BasaltError::Semantic(format!("unknown column: {}", name))
    }

    pub fn unknown_transaction(number: i64) -> Self {
        BasaltError::Invariant(format!("found not started transaction: {}", number))
    }
}

impl fmt::Display for BasaltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasaltError::Io(e) => write!(f, "{}", e),
            BasaltError::Parse(msg) => write!(f, "{}", msg),
            BasaltError::Semantic(msg) => write!(f, "{}", msg),
            BasaltError::Conflict(msg) => write!(f, "transaction conflict: {}", msg),
            BasaltError::Format(msg) => write!(f, "{}", msg),
            BasaltError::Replication(msg) => write!(f, "{}", msg),
            BasaltError::Invariant(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BasaltError {}

impl From<io::Error> for BasaltError {
    fn from(e: io::Error) -> Self {
        BasaltError::Io(e)
    }
}

impl From<serde_json::Error> for BasaltError {
    fn from(e: serde_json::Error) -> Self {
        BasaltError::Format(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for BasaltError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        BasaltError::Format(e.to_string())
    }
}

/// Result type alias for basalt operations
pub type Result<T> = std::result::Result<T, BasaltError>;
