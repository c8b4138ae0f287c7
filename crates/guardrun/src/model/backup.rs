use crate::model::BackupId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot of a file taken before a mutating action.
///
/// The stored copy is written once and never updated; `checksum` is the
/// SHA-256 of the original bytes, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub original_path: PathBuf,
    pub stored_path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
    /// Unix permission bits of the original, when available.
    pub mode: Option<u32>,
    pub created_at_ms: u64,
}
