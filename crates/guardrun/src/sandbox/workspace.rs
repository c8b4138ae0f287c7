//! Ephemeral, filtered copy of the caller's source tree.

use crate::config::SandboxConfig;
use crate::error::{GuardError, GuardResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::{DirEntry, WalkDir};

/// Build and vendor directories never copied into a workspace.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "venv", ".venv", ".git"];

/// Harness-owned directory inside the workspace (HOME and TMPDIR live here).
pub(crate) const HARNESS_DIR: &str = ".guardrun";

#[derive(Clone, Debug, PartialEq, Eq)]
struct FileState {
    digest: Vec<u8>,
    mode: Option<u32>,
}

/// A workspace lives as long as this value; the directory is removed on drop.
#[derive(Debug)]
pub(crate) struct Workspace {
    dir: TempDir,
    source: PathBuf,
    allowed_extensions: Vec<String>,
    snapshot: BTreeMap<PathBuf, FileState>,
    skipped: usize,
}

impl Workspace {
    /// Copy allow-listed files from `source` into a fresh temp directory.
    pub(crate) fn materialize(source: &Path, config: &SandboxConfig) -> GuardResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("guardrun-ws-")
            .tempdir()
            .map_err(|err| GuardError::io("failed to create sandbox workspace", err))?;
        let mut workspace = Self {
            dir,
            source: source.to_path_buf(),
            allowed_extensions: config.allowed_extensions.clone(),
            snapshot: BTreeMap::new(),
            skipped: 0,
        };
        workspace.copy_in(config)?;
        for sub in ["home", "tmp"] {
            fs::create_dir_all(workspace.harness_dir().join(sub))
                .map_err(|err| GuardError::io("failed to create sandbox home", err))?;
        }
        Ok(workspace)
    }

    fn copy_in(&mut self, config: &SandboxConfig) -> GuardResult<()> {
        let mut bytes_copied: u64 = 0;
        // The workspace itself may sit below the source (source under the temp root).
        let own_root = self.dir.path().to_path_buf();
        let walker = WalkDir::new(&self.source)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |entry| {
                entry.path() != own_root && (entry.depth() == 0 || !is_skipped_dir(entry))
            });
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() || !self.is_allowed(entry.path()) {
                continue;
            }
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            if self.snapshot.len() >= config.max_workspace_files
                || bytes_copied.saturating_add(size) > config.max_workspace_bytes
            {
                self.skipped += 1;
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.source) else {
                continue;
            };
            let target = self.dir.path().join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| GuardError::io("failed to create workspace directory", err))?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|err| GuardError::io("failed to copy file into workspace", err))?;
            bytes_copied = bytes_copied.saturating_add(size);
            if let Some(state) = file_state(&target) {
                self.snapshot.insert(relative.to_path_buf(), state);
            }
        }
        if self.skipped > 0 {
            tracing::warn!(
                skipped = self.skipped,
                max_files = config.max_workspace_files,
                max_bytes = config.max_workspace_bytes,
                "workspace ceilings reached, some files were not copied"
            );
        }
        Ok(())
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn harness_dir(&self) -> PathBuf {
        self.dir.path().join(HARNESS_DIR)
    }

    pub(crate) fn file_count(&self) -> usize {
        self.snapshot.len()
    }

    /// Copy files created or changed in the workspace back to the source
    /// tree. Deletions are not propagated.
    pub(crate) fn write_back(&self) -> GuardResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        let walker = WalkDir::new(self.dir.path())
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() || !self.is_allowed(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(self.dir.path()) else {
                continue;
            };
            let Some(state) = file_state(entry.path()) else {
                continue;
            };
            if self.snapshot.get(relative) == Some(&state) {
                continue;
            }
            let destination = self.source.join(relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| GuardError::io("failed to create write-back directory", err))?;
            }
            fs::copy(entry.path(), &destination)
                .map_err(|err| GuardError::io("failed to write back workspace file", err))?;
            written.push(destination);
        }
        Ok(written)
    }

    fn is_allowed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .is_some_and(|ext| self.allowed_extensions.iter().any(|allowed| *allowed == ext))
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)
}

fn file_state(path: &Path) -> Option<FileState> {
    let bytes = fs::read(path).ok()?;
    Some(FileState {
        digest: Sha256::digest(&bytes).to_vec(),
        mode: file_mode(path),
    })
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

#[cfg(test)]
mod tests {
    use super::*;

    fn source_tree() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        fs::write(dir.path().join("notes.bin"), [0u8, 1, 2]).unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/util.py"), "X = 1\n").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::write(dir.path().join("node_modules/dep/index.js"), "").unwrap();
        fs::create_dir_all(dir.path().join(".secret")).unwrap();
        fs::write(dir.path().join(".secret/key.txt"), "k").unwrap();
        dir
    }

    #[test]
    fn copies_only_allowed_files() {
        let source = source_tree();
        let workspace = Workspace::materialize(source.path(), &SandboxConfig::default()).unwrap();
        assert!(workspace.root().join("main.py").is_file());
        assert!(workspace.root().join("pkg/util.py").is_file());
        assert!(!workspace.root().join("notes.bin").exists());
        assert!(!workspace.root().join("node_modules").exists());
        assert!(!workspace.root().join(".secret").exists());
        assert_eq!(workspace.file_count(), 2);
    }

    #[test]
    fn file_ceiling_bounds_the_copy() {
        let source = source_tree();
        let config = SandboxConfig {
            max_workspace_files: 1,
            ..SandboxConfig::default()
        };
        let workspace = Workspace::materialize(source.path(), &config).unwrap();
        assert_eq!(workspace.file_count(), 1);
    }

    #[test]
    fn write_back_copies_changed_and_new_files_only() {
        let source = source_tree();
        let workspace = Workspace::materialize(source.path(), &SandboxConfig::default()).unwrap();
        fs::write(workspace.root().join("main.py"), "print('changed')\n").unwrap();
        fs::write(workspace.root().join("new.py"), "pass\n").unwrap();
        fs::write(workspace.harness_dir().join("tmp/scratch.py"), "").unwrap();

        let mut written = workspace.write_back().unwrap();
        written.sort();
        assert_eq!(
            written,
            vec![source.path().join("main.py"), source.path().join("new.py")]
        );
        assert_eq!(
            fs::read_to_string(source.path().join("main.py")).unwrap(),
            "print('changed')\n"
        );
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let source = source_tree();
        let workspace = Workspace::materialize(source.path(), &SandboxConfig::default()).unwrap();
        let root = workspace.root().to_path_buf();
        drop(workspace);
        assert!(!root.exists());
    }
}
