//! Change-sets: the unit of state transition
//!
//! Every mutation of server state is described by exactly one `ChangeSet`
//! variant. The same serialized form is appended to the WAL and handed to the
//! consensus layer as a proposal, so local execution, durability and
//! replication all flow through one record type and one apply function.
//!
//! Wire format: a 4-byte little-endian length prefix followed by the bincode
//! encoding of the enum. The serialized variant index is the leading kind
//! tag, so a reader identifies the record kind before decoding the payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

use crate::error::{BasaltError, Result};
use crate::types::{Lsn, TxnId};
use crate::types::RowMeta;

/// One row of an Insert change-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRow {
    pub columns: HashMap<String, String>,
}

/// One row of an Update change-set, addressed by primary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRow {
    pub primary_key: i64,
    pub columns: HashMap<String, String>,
}

/// Description of one atomic state transition.
///
/// `lsn` is 0 while a change-set is being proposed; the WAL stamps it on
/// write. Insert/Update batch every row produced by one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeSet {
    CreateDatabase {
        lsn: Lsn,
        name: String,
    },
    CreateTable {
        lsn: Lsn,
        database: String,
        name: String,
        row_metas: Vec<RowMeta>,
    },
    Insert {
        lsn: Lsn,
        database: String,
        table: String,
        txn: TxnId,
        rows: Vec<InsertRow>,
    },
    Update {
        lsn: Lsn,
        database: String,
        table: String,
        txn: TxnId,
        rows: Vec<UpdateRow>,
    },
    Begin {
        lsn: Lsn,
        txn: TxnId,
    },
    Commit {
        lsn: Lsn,
        txn: TxnId,
    },
    Rollback {
        lsn: Lsn,
        txn: TxnId,
    },
    Abort {
        lsn: Lsn,
        txn: TxnId,
    },
}

impl ChangeSet {
    pub fn lsn(&self) -> Lsn {
        match self {
            ChangeSet::CreateDatabase { lsn, .. }
            | ChangeSet::CreateTable { lsn, .. }
            | ChangeSet::Insert { lsn, .. }
            | ChangeSet::Update { lsn, .. }
            | ChangeSet::Begin { lsn, .. }
            | ChangeSet::Commit { lsn, .. }
            | ChangeSet::Rollback { lsn, .. }
            | ChangeSet::Abort { lsn, .. } => *lsn,
        }
    }

    pub fn set_lsn(&mut self, new: Lsn) {
        match self {
            ChangeSet::CreateDatabase { lsn, .. }
            | ChangeSet::CreateTable { lsn, .. }
            | ChangeSet::Insert { lsn, .. }
            | ChangeSet::Update { lsn, .. }
            | ChangeSet::Begin { lsn, .. }
            | ChangeSet::Commit { lsn, .. }
            | ChangeSet::Rollback { lsn, .. }
            | ChangeSet::Abort { lsn, .. } => *lsn = new,
        }
    }

    /// Transaction number the record belongs to, where applicable.
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            ChangeSet::Insert { txn, .. }
            | ChangeSet::Update { txn, .. }
            | ChangeSet::Begin { txn, .. }
            | ChangeSet::Commit { txn, .. }
            | ChangeSet::Rollback { txn, .. }
            | ChangeSet::Abort { txn, .. } => Some(*txn),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeSet::CreateDatabase { .. } => "CreateDatabase",
            ChangeSet::CreateTable { .. } => "CreateTable",
            ChangeSet::Insert { .. } => "Insert",
            ChangeSet::Update { .. } => "Update",
            ChangeSet::Begin { .. } => "Begin",
            ChangeSet::Commit { .. } => "Commit",
            ChangeSet::Rollback { .. } => "Rollback",
            ChangeSet::Abort { .. } => "Abort",
        }
    }

    /// Bincode payload without framing; the form handed to Raft.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<ChangeSet> {
        Ok(bincode::deserialize(data)?)
    }

    /// Append the length-framed wire form to `buf`.
    pub fn encode_framed(&self, buf: &mut Vec<u8>) -> Result<()> {
        let encoded = self.to_bytes()?;
        buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buf.extend_from_slice(&encoded);
        Ok(())
    }

    /// Read one framed record. `Ok(None)` at a clean end of input; a frame
    /// cut off mid-record is a `Format` error.
    pub fn read_framed<R: Read>(reader: &mut R) -> Result<Option<ChangeSet>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut record_buf = vec![0u8; len];
        reader
            .read_exact(&mut record_buf)
            .map_err(|e| BasaltError::Format(format!("truncated record: {}", e)))?;

        Ok(Some(ChangeSet::from_bytes(&record_buf)?))
    }
}
