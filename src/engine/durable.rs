//! On-disk layout for durable engines.
//!
//! ```text
//! <path>/MANIFEST      magic + format version
//! <path>/LOCK         exclusive advisory lock
//! <path>/snapshot.bin checkpointed catalog + last WAL seq it covers
//! <path>/engine.wal   transactions committed since the snapshot
//! ```
//!
//! A checkpoint renames the new snapshot into place before clearing the
//! WAL. Recovery skips WAL entries the snapshot already covers, so a crash
//! between the two steps replays nothing twice.

use super::schema::{apply_operation, Catalog};
use super::wal::{WalOperation, WriteAheadLog};
use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Magic bytes for the storage manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"SHS\0";

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current on-disk format version.
const FORMAT_VERSION: u8 = 1;

/// Durable half of an engine backend.
pub(crate) struct Durable {
    path: PathBuf,
    _lock_file: File,
    wal: WriteAheadLog,
    commits_since_checkpoint: usize,
    checkpoint_every: usize,
}

impl Durable {
    /// Open (or create) the directory and recover its catalog.
    pub(crate) fn open(
        path: &Path,
        create_if_missing: bool,
        checkpoint_every: usize,
        sync_writes: bool,
    ) -> Result<(Self, Catalog)> {
        if path.join("MANIFEST").exists() {
            Self::verify_manifest(path)?;
        } else if create_if_missing {
            fs::create_dir_all(path)?;
            Self::write_manifest(path)?;
        } else {
            return Err(StoreError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(path)?;

        let snapshot_path = path.join("snapshot.bin");
        let (mut catalog, snapshot_seq) = if snapshot_path.exists() {
            read_snapshot(&snapshot_path)?
        } else {
            (Catalog::new(), 0)
        };

        let wal = WriteAheadLog::open(path.join("engine.wal"), sync_writes)?;
        wal.resume_after(snapshot_seq);
        let mut replayed = 0;
        let mut skipped = 0;
        for entry in wal.entries()? {
            if entry.seq <= snapshot_seq {
                skipped += 1;
                continue;
            }
            for operation in entry.operations {
                apply_operation(&mut catalog, operation)?;
            }
            replayed += 1;
        }
        if skipped > 0 {
            warn!(
                target: "storehouse::wal",
                skipped,
                snapshot_seq,
                "WAL holds entries already in the snapshot"
            );
        }

        for database in catalog.values_mut() {
            database.rebuild_indexes();
        }

        info!(
            target: "storehouse::engine",
            path = ?path,
            databases = catalog.len(),
            snapshot_seq,
            replayed,
            "Recovered durable storage"
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                _lock_file: lock_file,
                wal,
                commits_since_checkpoint: replayed,
                checkpoint_every,
            },
            catalog,
        ))
    }

    /// Make a transaction durable before it is applied in memory.
    pub(crate) fn log(&mut self, operations: &[WalOperation]) -> Result<()> {
        self.wal.append(operations)?;
        self.commits_since_checkpoint += 1;
        Ok(())
    }

    /// Checkpoint if enough commits accumulated. Failures are logged only;
    /// the WAL still holds every commit.
    pub(crate) fn maybe_checkpoint(&mut self, catalog: &Catalog) {
        if self.checkpoint_every == 0 || self.commits_since_checkpoint < self.checkpoint_every {
            return;
        }
        if let Err(e) = self.checkpoint(catalog) {
            warn!(target: "storehouse::engine", error = %e, "Checkpoint failed");
        }
    }

    /// Write a snapshot of the catalog and clear the WAL.
    pub(crate) fn checkpoint(&mut self, catalog: &Catalog) -> Result<()> {
        let tmp = self.path.join("snapshot.tmp");
        write_snapshot(&tmp, catalog, self.wal.last_seq())?;
        fs::rename(&tmp, self.path.join("snapshot.bin"))?;
        self.wal.clear()?;

        info!(
            target: "storehouse::engine",
            commits = self.commits_since_checkpoint,
            "Checkpoint written"
        );
        self.commits_since_checkpoint = 0;
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;

        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid storage magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported storage version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

/// Checksum over the covered sequence number and the payload.
fn snapshot_checksum(seq: u64, encoded: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(encoded);
    hasher.finalize()
}

fn write_snapshot(path: &Path, catalog: &Catalog, seq: u64) -> Result<()> {
    let encoded = rmp_serde::to_vec(catalog)?;
    let mut file = File::create(path)?;

    file.write_all(SNAPSHOT_MAGIC)?;
    file.write_all(&[FORMAT_VERSION])?;
    file.write_all(&seq.to_le_bytes())?;
    file.write_all(&(encoded.len() as u64).to_le_bytes())?;
    file.write_all(&encoded)?;
    file.write_all(&snapshot_checksum(seq, &encoded).to_le_bytes())?;
    file.sync_all()?;

    Ok(())
}

/// The catalog and the last WAL sequence number it includes.
fn read_snapshot(path: &Path) -> Result<(Catalog, u64)> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid snapshot magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != FORMAT_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported snapshot version: {}",
            version[0]
        )));
    }

    let mut seq_bytes = [0u8; 8];
    file.read_exact(&mut seq_bytes)?;
    let seq = u64::from_le_bytes(seq_bytes);

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut encoded = vec![0u8; len];
    file.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let got = snapshot_checksum(seq, &encoded);
    if expected != got {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }

    Ok((rmp_serde::from_slice(&encoded)?, seq))
}
