//! basalt - a minimal replicated SQL database
//!
//! A single-node relational store with write-ahead logging, point-in-time
//! snapshots, optimistic multi-statement transactions, and a consensus layer
//! that replicates every state-changing operation across peer nodes.
//!
//! Everything that mutates state flows through one record type and one
//! apply function:
//!
//! ```text
//! statement ──> Connection ──> ChangeSet ──> Server::submit_change_set
//!                                                │
//!                               ┌────────────────┴───────────────┐
//!                               ▼                                ▼
//!                        local apply + WAL              Raft propose ──>
//!                                                       committed entry ──>
//!                                                       same apply + WAL
//!                                                       on every node
//! ```
//!
//! Recovery replays the snapshot image and then the WAL suffix through the
//! same apply function, so a node's state is always reconstructable from
//! `snapshot + WAL`.

use std::path::PathBuf;

pub mod changeset;
pub mod connection;
pub mod error;
pub mod executor;
pub mod join;
pub mod lexer;
pub mod parser;
pub mod raft_server;
pub mod server;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use connection::Connection;
pub use error::{BasaltError, Result};
pub use raft_server::{NodeRegistry, RaftServer};
pub use server::Server;
pub use types::ResultSet;

/// Server configuration
#[derive(Clone)]
pub struct Config {
    /// Directory for WAL and snapshot files
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./log"),
        }
    }
}
