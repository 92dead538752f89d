//! Write-ahead log for durable engines.
//!
//! Each committed transaction is appended as one entry before it is applied
//! in memory, so a transaction is either fully replayed on recovery or not
//! at all. Entries are framed as length + MessagePack payload + CRC32.

use crate::error::{Result, StoreError};
use crate::range::KeyRange;
use crate::types::{IndexSpec, Key, StoreOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for WAL file.
const WAL_MAGIC: &[u8; 4] = b"WAL\0";

/// Current WAL format version.
const WAL_VERSION: u8 = 1;

/// Header length (magic + version).
const WAL_HEADER_LEN: u64 = 5;

/// Upper bound on a single entry; anything larger is treated as corruption.
const MAX_ENTRY_LEN: usize = 256 * 1024 * 1024;

/// A single committed transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Mutations in application order.
    pub operations: Vec<WalOperation>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Mutations that can be recorded in the WAL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WalOperation {
    /// Create the database if needed and set its version.
    SetVersion { database: String, version: u64 },
    DeleteDatabase { database: String },
    CreateStore {
        database: String,
        store: String,
        options: StoreOptions,
    },
    DeleteStore { database: String, store: String },
    CreateIndex {
        database: String,
        store: String,
        spec: IndexSpec,
    },
    DeleteIndex {
        database: String,
        store: String,
        index: String,
    },
    /// Insert or overwrite a record whose key is already resolved.
    Put {
        database: String,
        store: String,
        key: Key,
        value: Value,
    },
    Delete {
        database: String,
        store: String,
        range: KeyRange,
    },
    Clear { database: String, store: String },
}

/// Write-ahead log manager.
pub struct WriteAheadLog {
    /// Path to the WAL file.
    path: PathBuf,
    /// Next sequence number.
    next_seq: Mutex<u64>,
    /// Write handle.
    writer: Mutex<BufWriter<File>>,
    /// fsync after each append.
    sync_writes: bool,
    /// Largest payload `append` accepts.
    max_entry_len: usize,
}

impl WriteAheadLog {
    /// Create or open a WAL file.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_seq = if path.exists() {
            let (entries, valid_len) = Self::scan(&path)?;
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > valid_len {
                // Drop a torn tail so new entries follow the last intact one.
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            entries.last().map(|e| e.seq + 1).unwrap_or(1)
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            Self::write_header(&mut file)?;
            1
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(BufWriter::new(file)),
            sync_writes,
            max_entry_len: MAX_ENTRY_LEN,
        })
    }

    /// Append one committed transaction (returns its sequence number).
    ///
    /// An entry too large to be read back is refused before anything is
    /// written.
    pub fn append(&self, operations: &[WalOperation]) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        let entry = WalEntry {
            seq,
            operations: operations.to_vec(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let encoded = rmp_serde::to_vec(&entry)?;
        if encoded.len() > self.max_entry_len {
            return Err(StoreError::InvalidOperation(format!(
                "transaction of {} bytes exceeds the {} byte log entry limit",
                encoded.len(),
                self.max_entry_len
            )));
        }

        let mut writer = self.writer.lock();
        Self::write_entry(&mut writer, &encoded)?;
        writer.flush()?;
        if self.sync_writes {
            writer.get_ref().sync_all()?;
        }

        *next_seq += 1;
        Ok(seq)
    }

    /// Sequence number of the last appended entry (0 before the first).
    pub fn last_seq(&self) -> u64 {
        *self.next_seq.lock() - 1
    }

    /// Make sure new entries are numbered after `seq`.
    pub fn resume_after(&self, seq: u64) {
        let mut next_seq = self.next_seq.lock();
        *next_seq = (*next_seq).max(seq + 1);
    }

    /// All intact entries, in order.
    pub fn entries(&self) -> Result<Vec<WalEntry>> {
        Ok(Self::scan(&self.path)?.0)
    }

    /// Number of intact entries.
    #[cfg(test)]
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    #[cfg(test)]
    fn set_max_entry_len(&mut self, max_entry_len: usize) {
        self.max_entry_len = max_entry_len;
    }

    /// Clear the WAL (called after a successful checkpoint).
    ///
    /// The empty log is built beside the old one and renamed over it, so a
    /// failure leaves the current log and writer in place. Sequence numbers
    /// keep counting up.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();

        let tmp = self.path.with_extension("wal.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        Self::write_header(&mut file)?;
        let fresh = OpenOptions::new().append(true).open(&tmp)?;
        fs::rename(&tmp, &self.path)?;

        *writer = BufWriter::new(fresh);
        Ok(())
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Read intact entries and the byte length they span (header included).
    fn scan(path: &Path) -> Result<(Vec<WalEntry>, u64)> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid WAL magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported WAL version: {}",
                version[0]
            )));
        }

        file.seek(SeekFrom::Start(WAL_HEADER_LEN))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = WAL_HEADER_LEN;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, framed_len))) => {
                    entries.push(entry);
                    valid_len += framed_len;
                }
                Ok(None) => break,
                Err(e) => {
                    // A torn write at the tail: everything before it is intact.
                    warn!(
                        target: "storehouse::wal",
                        error = %e,
                        kept = entries.len(),
                        "Discarding unreadable WAL tail"
                    );
                    break;
                }
            }
        }

        Ok((entries, valid_len))
    }

    fn write_entry(writer: &mut BufWriter<File>, encoded: &[u8]) -> Result<()> {
        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(encoded)?;

        let checksum = crc32fast::hash(encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read one entry and its framed length; `Ok(None)` at a clean end of file.
    fn read_entry(reader: &mut BufReader<File>) -> Result<Option<(WalEntry, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(StoreError::Corruption("WAL entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, (len + 8) as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn put(key: i64) -> WalOperation {
        WalOperation::Put {
            database: "db".to_string(),
            store: "items".to_string(),
            key: Key::from(key),
            value: json!({"id": key}),
        }
    }

    #[test]
    fn test_wal_basic() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal"), true).unwrap();

        assert!(wal.is_empty().unwrap());
        let seq = wal.append(&[put(1), put(2)]).unwrap();
        assert_eq!(seq, 1);

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operations.len(), 2);
    }

    #[test]
    fn test_wal_persistence() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&wal_path, true).unwrap();
            wal.append(&[put(1)]).unwrap();
            wal.append(&[put(2)]).unwrap();
        }

        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        if let WalOperation::Put { key, value, .. } = &entries[1].operations[0] {
            assert_eq!(key, &Key::from(2));
            assert_eq!(value, &json!({"id": 2}));
        } else {
            panic!("Wrong operation type");
        }

        // Sequence continues after reopen.
        assert_eq!(wal.append(&[put(3)]).unwrap(), 3);
    }

    #[test]
    fn test_wal_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&wal_path, true).unwrap();
            wal.append(&[put(1)]).unwrap();
        }

        // Simulate a crash halfway through the next entry.
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        assert_eq!(wal.len().unwrap(), 1);

        // New entries land after the last intact one.
        wal.append(&[put(2)]).unwrap();
        drop(wal);
        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        assert_eq!(wal.len().unwrap(), 2);
    }

    #[test]
    fn test_wal_clear() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal"), false).unwrap();

        wal.append(&[put(1)]).unwrap();
        assert!(!wal.is_empty().unwrap());

        wal.clear().unwrap();
        assert!(wal.is_empty().unwrap());
        assert!(!dir.path().join("test.wal.tmp").exists());

        // Sequence keeps counting so a snapshot can tell old entries apart.
        assert_eq!(wal.last_seq(), 1);
        assert_eq!(wal.append(&[put(2)]).unwrap(), 2);
        assert_eq!(wal.entries().unwrap()[0].seq, 2);
    }

    #[test]
    fn test_wal_clear_failure_keeps_log_writable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        wal.append(&[put(1)]).unwrap();

        // The scratch file cannot be created while a directory holds its name.
        fs::create_dir(dir.path().join("test.wal.tmp")).unwrap();
        assert!(wal.clear().is_err());

        assert_eq!(wal.append(&[put(2)]).unwrap(), 2);
        drop(wal);
        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.len().unwrap(), 2);
    }

    #[test]
    fn test_resume_after_skips_ahead() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal"), false).unwrap();

        wal.resume_after(41);
        assert_eq!(wal.append(&[put(1)]).unwrap(), 42);

        // Never moves backwards.
        wal.resume_after(10);
        assert_eq!(wal.append(&[put(2)]).unwrap(), 43);
    }

    #[test]
    fn test_oversized_entry_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = WriteAheadLog::open(&path, false).unwrap();
        wal.set_max_entry_len(256);

        wal.append(&[put(1)]).unwrap();
        let big = WalOperation::Put {
            database: "db".to_string(),
            store: "items".to_string(),
            key: Key::from(2),
            value: json!({"blob": "x".repeat(512)}),
        };
        assert!(matches!(
            wal.append(&[big]),
            Err(StoreError::InvalidOperation(_))
        ));

        // Nothing was written and numbering did not advance.
        assert_eq!(wal.append(&[put(3)]).unwrap(), 2);
        drop(wal);
        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.len().unwrap(), 2);
    }

    #[test]
    fn test_wal_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, b"NOPE!").unwrap();

        let result = WriteAheadLog::open(&path, true);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }
}
