//! Persisted incremental build cache.
//!
//! One JSON row per input file, named after the xxh3 hash of its canonical path.
//! A row is fresh when the invocation arguments match, every recorded dependency
//! still hashes to the recorded fingerprint, and every recorded output exists.

use crate::artifacts::write_atomic;
use crate::error::{CompilerError, Result};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::{xxh3_128, Xxh3};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRow {
    pub input: PathBuf,
    /// Input file first, then every include, in load order.
    pub dependencies: Vec<PathBuf>,
    pub fingerprint: String,
    pub arguments: String,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BuildCache {
    dir: PathBuf,
}

/// Hash over the contents of `files`, in order. Paths are mixed in so that
/// reordering or swapping includes changes the result.
pub fn fingerprint_files(files: &[PathBuf]) -> Result<String> {
    let mut hasher = Xxh3::new();
    for file in files {
        let bytes = std::fs::read(file).map_err(|e| CompilerError::path_io(file, e))?;
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(format!("{:032x}", hasher.digest128()))
}

pub fn fingerprint_arguments(arguments: &str) -> String {
    format!("{:032x}", xxh3_128(arguments.as_bytes()))
}

impl BuildCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BuildCache { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn row_path(&self, input: &Path) -> PathBuf {
        let key = xxh3_128(input.to_string_lossy().as_bytes());
        self.dir.join(format!("{:032x}.json", key))
    }

    pub fn load(&self, input: &Path) -> Option<CacheRow> {
        let text = std::fs::read_to_string(self.row_path(input)).ok()?;
        match serde_json::from_str::<CacheRow>(&text) {
            Ok(row) if row.input == input => Some(row),
            Ok(_) => None,
            Err(e) => {
                debug!("ignoring unreadable cache row for {}: {}", input.display(), e);
                None
            }
        }
    }

    /// Whether `input` (canonical) can be skipped for these arguments.
    pub fn is_fresh(&self, input: &Path, arguments: &str) -> bool {
        let Some(row) = self.load(input) else {
            trace!("{}: no cache row", input.display());
            return false;
        };
        if row.arguments != arguments {
            trace!("{}: arguments changed", input.display());
            return false;
        }
        if let Some(missing) = row.outputs.iter().find(|p| !p.exists()) {
            trace!("{}: output {} missing", input.display(), missing.display());
            return false;
        }
        match fingerprint_files(&row.dependencies) {
            Ok(fingerprint) => fingerprint == row.fingerprint,
            Err(_) => false,
        }
    }

    pub fn record(&self, row: &CacheRow) -> Result<()> {
        let text = serde_json::to_string_pretty(row)?;
        write_atomic(&self.row_path(&row.input), text.as_bytes())
    }

    pub fn invalidate(&self, input: &Path) -> Result<()> {
        let path = self.row_path(input);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CompilerError::path_io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BuildCache, PathBuf, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("lit.fsl");
        let include = dir.path().join("common.h.fsl");
        let output = dir.path().join("lit.spv");
        std::fs::write(&input, "#include \"common.h.fsl\"\n").unwrap();
        std::fs::write(&include, "STRUCT(A) { DATA(float, x, None); };\n").unwrap();
        std::fs::write(&output, b"spv").unwrap();
        let cache = BuildCache::new(dir.path().join(".cache"));
        (dir, cache, input, include, output)
    }

    fn row(input: &Path, include: &Path, output: &Path) -> CacheRow {
        let dependencies = vec![input.to_path_buf(), include.to_path_buf()];
        CacheRow {
            input: input.to_path_buf(),
            fingerprint: fingerprint_files(&dependencies).unwrap(),
            dependencies,
            arguments: fingerprint_arguments("vulkan"),
            outputs: vec![output.to_path_buf()],
        }
    }

    #[test]
    fn test_fresh_until_include_changes() {
        let (_dir, cache, input, include, output) = setup();
        let args = fingerprint_arguments("vulkan");
        assert!(!cache.is_fresh(&input, &args));
        cache.record(&row(&input, &include, &output)).unwrap();
        assert!(cache.is_fresh(&input, &args));
        assert!(!cache.is_fresh(&input, &fingerprint_arguments("metal")));

        std::fs::write(&include, "STRUCT(A) { DATA(float2, x, None); };\n").unwrap();
        assert!(!cache.is_fresh(&input, &args));
    }

    #[test]
    fn test_missing_output_is_stale() {
        let (_dir, cache, input, include, output) = setup();
        cache.record(&row(&input, &include, &output)).unwrap();
        std::fs::remove_file(&output).unwrap();
        assert!(!cache.is_fresh(&input, &fingerprint_arguments("vulkan")));
    }

    #[test]
    fn test_invalidate() {
        let (_dir, cache, input, include, output) = setup();
        cache.record(&row(&input, &include, &output)).unwrap();
        cache.invalidate(&input).unwrap();
        assert!(cache.load(&input).is_none());
        cache.invalidate(&input).unwrap();
    }
}
