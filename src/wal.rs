//! Write-ahead log
//!
//! An append-only file of length-framed change-set records. The LSN cursor
//! counts records since the most recent snapshot; `write` stamps the cursor
//! into the record before appending, so a record's `lsn` equals its 0-based
//! position in the log. Recovery rewinds the cursor to the snapshot LSN and
//! skips older records.
//!
//! Files are named `<prefix><sequence>.log`. The durable prefix is `wal_`;
//! tests run against `wal_tmp_` so a crashed test never pollutes real state.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use crate::changeset::ChangeSet;
use crate::error::Result;
use crate::types::Lsn;

/// Prefix of durable WAL files
pub const WAL_PREFIX: &str = "wal_";
/// Prefix of temporary (test) WAL files
pub const WAL_TMP_PREFIX: &str = "wal_tmp_";

pub struct Wal {
    dir: PathBuf,
    prefix: String,
    file_number: u32,
    lsn: Lsn,
}

impl Wal {
    pub fn new(dir: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            file_number: 0,
            lsn: 0,
        })
    }

    fn file_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{}.log", self.prefix, self.file_number))
    }

    pub fn exists(&self) -> bool {
        self.file_path().exists()
    }

    /// Delete the current log file. Used when switching to a temporary WAL.
    pub fn remove(&self) -> Result<()> {
        let path = self.file_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn current_lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn advance_lsn(&mut self, n: u64) {
        self.lsn += n;
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
    }

    fn open_append(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())?)
    }

    /// Stamp the current LSN into the record, append it durably, advance.
    pub fn write(&mut self, cs: &mut ChangeSet) -> Result<()> {
        cs.set_lsn(self.lsn);
        let mut buf = Vec::new();
        cs.encode_framed(&mut buf)?;

        let mut file = self.open_append()?;
        file.write_all(&buf)?;
        file.flush()?;
        file.sync_data()?;

        self.lsn += 1;
        log::debug!("wal append: {} lsn={}", cs.kind(), cs.lsn());
        Ok(())
    }

    /// Stamp successive LSNs and append all records in one flush.
    pub fn write_batch(&mut self, css: &mut [ChangeSet]) -> Result<()> {
        if css.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        let mut lsn = self.lsn;
        for cs in css.iter_mut() {
            cs.set_lsn(lsn);
            cs.encode_framed(&mut buf)?;
            lsn += 1;
        }

        let mut file = self.open_append()?;
        file.write_all(&buf)?;
        file.flush()?;
        file.sync_data()?;

        self.lsn = lsn;
        Ok(())
    }

    /// Parse the full log file. Missing file reads as an empty log.
    pub fn read(&self) -> Result<Vec<ChangeSet>> {
        let path = self.file_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        while let Some(cs) = ChangeSet::read_framed(&mut reader)? {
            records.push(cs);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::InsertRow;
    use std::collections::HashMap;

    fn new_test_wal(dir: &Path) -> Wal {
        Wal::new(dir, WAL_TMP_PREFIX).unwrap()
    }

    #[test]
    fn test_current_lsn_starts_at_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = new_test_wal(tmp.path());
        assert_eq!(wal.current_lsn(), 0);
        assert!(!wal.exists());
    }

    #[test]
    fn test_write_stamps_and_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let mut wal = new_test_wal(tmp.path());

        let mut cs = ChangeSet::CreateDatabase {
            lsn: 99,
            name: "hello".into(),
        };
        wal.write(&mut cs).unwrap();
        assert_eq!(cs.lsn(), 0);
        assert_eq!(wal.current_lsn(), 1);

        let records = wal.read().unwrap();
        assert_eq!(records, vec![cs]);
    }

    #[test]
    fn test_write_multiple_times() {
        let tmp = tempfile::tempdir().unwrap();
        let mut wal = new_test_wal(tmp.path());

        for name in ["hello1", "hello2"] {
            let mut cs = ChangeSet::CreateDatabase {
                lsn: 0,
                name: name.into(),
            };
            wal.write(&mut cs).unwrap();
        }
        assert_eq!(wal.current_lsn(), 2);

        let records = wal.read().unwrap();
        assert_eq!(records.len(), 2);
        for (i, cs) in records.iter().enumerate() {
            assert_eq!(cs.lsn(), i as u64);
        }
    }

    #[test]
    fn test_write_batch_stamps_successive_lsns() {
        let tmp = tempfile::tempdir().unwrap();
        let mut wal = new_test_wal(tmp.path());

        let mut columns = HashMap::new();
        columns.insert("message".to_string(), "foo".to_string());
        let mut batch = vec![
            ChangeSet::Begin { lsn: 0, txn: 1 },
            ChangeSet::Insert {
                lsn: 0,
                database: "hello".into(),
                table: "world".into(),
                txn: 1,
                rows: vec![InsertRow { columns }],
            },
            ChangeSet::Commit { lsn: 0, txn: 1 },
        ];
        wal.write_batch(&mut batch).unwrap();

        assert_eq!(wal.current_lsn(), 3);
        let records = wal.read().unwrap();
        assert_eq!(records, batch);
        assert_eq!(
            records.iter().map(|c| c.lsn()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_lsn_exceeds_every_stamped_record() {
        let tmp = tempfile::tempdir().unwrap();
        let mut wal = new_test_wal(tmp.path());

        for _ in 0..5 {
            let mut cs = ChangeSet::Begin { lsn: 0, txn: 1 };
            wal.write(&mut cs).unwrap();
            assert!(wal.current_lsn() > cs.lsn());
        }
    }

    #[test]
    fn test_set_and_advance_lsn() {
        let tmp = tempfile::tempdir().unwrap();
        let mut wal = new_test_wal(tmp.path());
        wal.set_lsn(10);
        assert_eq!(wal.current_lsn(), 10);
        wal.advance_lsn(3);
        assert_eq!(wal.current_lsn(), 13);
    }

    #[test]
    fn test_remove_clears_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut wal = new_test_wal(tmp.path());
        let mut cs = ChangeSet::Begin { lsn: 0, txn: 1 };
        wal.write(&mut cs).unwrap();
        assert!(wal.exists());

        wal.remove().unwrap();
        assert!(!wal.exists());
        assert_eq!(wal.read().unwrap(), Vec::new());
    }

    #[test]
    fn test_read_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut wal = new_test_wal(tmp.path());
            let mut cs = ChangeSet::CreateDatabase {
                lsn: 0,
                name: "hello".into(),
            };
            wal.write(&mut cs).unwrap();
        }

        let wal = new_test_wal(tmp.path());
        let records = wal.read().unwrap();
        assert_eq!(records.len(), 1);
    }
}
