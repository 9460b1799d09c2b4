//! Artifact writing: atomic replace-on-completion, and per-path locks so two
//! workers never write the same output at once.

use crate::error::{CompilerError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes `bytes` to a temporary file next to `path`, then renames it into place.
/// Readers see either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| CompilerError::path_io(dir, e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".fsl-")
        .tempfile_in(dir)
        .map_err(|e| CompilerError::path_io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| CompilerError::path_io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| CompilerError::path_io(path, e))?;
    tmp.persist(path).map_err(|e| CompilerError::path_io(path, e.error))?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct OutputLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

/// Holds one output path until dropped.
pub struct OutputGuard<'a> {
    locks: &'a OutputLocks,
    path: PathBuf,
}

impl OutputLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other worker holds `path`.
    pub fn lock(&self, path: &Path) -> OutputGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(path) {
            self.released.wait(&mut held);
        }
        held.insert(path.to_path_buf());
        OutputGuard {
            locks: self,
            path: path.to_path_buf(),
        }
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.held.lock().contains(path)
    }
}

impl Drop for OutputGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.path);
        self.locks.released.notify_all();
    }
}

/// Locks `path` and writes it atomically.
pub fn write_locked(locks: &OutputLocks, path: &Path, bytes: &[u8]) -> Result<()> {
    let _guard = locks.lock(path);
    write_atomic(path, bytes)
}
