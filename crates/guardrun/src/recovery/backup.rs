//! Write-once file snapshots taken before mutating repairs.

use crate::error::{GuardError, GuardResult};
use crate::model::{now_ms, BackupId, BackupRecord};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Directory under the temp dir used when no backup dir is configured.
const DEFAULT_BACKUP_DIR: &str = "guardrun-backups";

/// Snapshot store for one orchestrator.
///
/// Every store writes into its own namespace directory, so concurrent
/// stores never share files. Stored copies are created with `create_new`
/// and never rewritten.
#[derive(Debug)]
pub struct BackupStore {
    namespace: PathBuf,
    records: Mutex<Vec<BackupRecord>>,
}

impl BackupStore {
    /// Create a store under `base`, or under the temp dir when `None`.
    ///
    /// # Errors
    /// `E_IO` if the namespace directory cannot be created.
    pub fn new(base: Option<&Path>) -> GuardResult<Self> {
        let base = base.map_or_else(
            || std::env::temp_dir().join(DEFAULT_BACKUP_DIR),
            Path::to_path_buf,
        );
        let namespace = base.join(format!("run-{}", BackupId::new()));
        fs::create_dir_all(&namespace)
            .map_err(|err| GuardError::io("failed to create backup directory", err))?;
        Ok(Self {
            namespace,
            records: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &Path {
        &self.namespace
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BackupRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Snapshot `path`.
    ///
    /// # Errors
    /// `E_INVALID_CONTEXT` if the source cannot be read, `E_IO` if the copy
    /// cannot be written into the store.
    pub fn snapshot(&self, path: &Path) -> GuardResult<BackupRecord> {
        let bytes = fs::read(path).map_err(|err| {
            GuardError::invalid_context(
                "file to back up cannot be read",
                serde_json::json!({ "path": path, "source": err.to_string() }),
            )
        })?;
        let id = BackupId::new();
        let stored_path = self.namespace.join(format!("{id}.bak"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&stored_path)
            .map_err(|err| GuardError::io("failed to create backup file", err))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|err| GuardError::io("failed to write backup file", err))?;

        let record = BackupRecord {
            id,
            original_path: path.to_path_buf(),
            stored_path,
            checksum: checksum(&bytes),
            size_bytes: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            mode: file_mode(path),
            created_at_ms: now_ms(),
        };
        tracing::debug!(path = %path.display(), backup = %record.id, "backed up file");
        self.lock().push(record.clone());
        Ok(record)
    }

    /// Write the stored bytes and mode back to the original path.
    ///
    /// # Errors
    /// `E_INTEGRITY` if the stored copy or the restored file does not match
    /// the recorded checksum, `E_IO` on read or write failure.
    pub fn restore(&self, record: &BackupRecord) -> GuardResult<()> {
        let bytes = fs::read(&record.stored_path)
            .map_err(|err| GuardError::io("failed to read backup file", err))?;
        verify(&bytes, record, "stored backup")?;
        fs::write(&record.original_path, &bytes)
            .map_err(|err| GuardError::io("failed to restore file", err))?;
        if let Some(mode) = record.mode {
            set_file_mode(&record.original_path, mode)?;
        }
        let restored = fs::read(&record.original_path)
            .map_err(|err| GuardError::io("failed to re-read restored file", err))?;
        verify(&restored, record, "restored file")?;
        tracing::info!(path = %record.original_path.display(), backup = %record.id, "restored file from backup");
        Ok(())
    }

    /// Records taken so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<BackupRecord> {
        self.lock().clone()
    }

    /// Remove the namespace directory and forget all records.
    ///
    /// # Errors
    /// `E_IO` if the directory exists but cannot be removed.
    pub fn cleanup(&self) -> GuardResult<()> {
        self.lock().clear();
        match fs::remove_dir_all(&self.namespace) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GuardError::io("failed to remove backup directory", err)),
        }
    }
}

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hex SHA-256 of the file at `path`.
///
/// # Errors
/// `E_IO` if the file cannot be read.
pub fn file_checksum(path: &Path) -> GuardResult<String> {
    let bytes = fs::read(path).map_err(|err| GuardError::io("failed to read file", err))?;
    Ok(checksum(&bytes))
}

fn verify(bytes: &[u8], record: &BackupRecord, what: &str) -> GuardResult<()> {
    let actual = checksum(bytes);
    if actual == record.checksum {
        return Ok(());
    }
    Err(GuardError::integrity(
        format!("{what} checksum mismatch"),
        serde_json::json!({
            "path": record.original_path,
            "backup": record.id,
            "expected": record.checksum,
            "actual": actual,
        }),
    ))
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .ok()
        .map(|meta| meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> GuardResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| GuardError::io("failed to restore file mode", err))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> GuardResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn snapshot_then_restore_reproduces_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(Some(dir.path())).unwrap();
        let path = dir.path().join("main.py");
        fs::write(&path, "print('hi')\n").unwrap();
        let record = store.snapshot(&path).unwrap();
        fs::write(&path, "broken").unwrap();
        store.restore(&record).unwrap();
        assert_eq!(file_checksum(&path).unwrap(), record.checksum);
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn tampered_backup_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(Some(dir.path())).unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "one").unwrap();
        let record = store.snapshot(&path).unwrap();
        fs::write(&record.stored_path, "two").unwrap();
        let err = store.restore(&record).unwrap_err();
        assert_eq!(err.code, ErrorCode::Integrity);
        assert_eq!(fs::read_to_string(&path).unwrap(), "one");
    }

    #[test]
    fn unreadable_source_is_invalid_context() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(Some(dir.path())).unwrap();
        let err = store.snapshot(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidContext);
    }

    #[test]
    fn cleanup_removes_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(Some(dir.path())).unwrap();
        assert!(store.namespace().is_dir());
        store.cleanup().unwrap();
        assert!(!store.namespace().exists());
        store.cleanup().unwrap();
    }
}
