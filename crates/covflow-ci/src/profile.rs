//! Raw profiling artifacts (`*.profraw`) emitted by instrumented test processes.

use std::path::{Path, PathBuf};
use tracing::debug;

/// File extension of LLVM raw profiles.
pub const PROFRAW_EXTENSION: &str = "profraw";

/// Placeholder LLVM expands to the writing process id.
pub const PID_PLACEHOLDER: &str = "%p";

/// Placeholder LLVM expands to the instrumented module's signature.
pub const MODULE_PLACEHOLDER: &str = "%m";

/// The set of profiling artifacts produced by one test run.
///
/// Not `Clone`: the set is handed from the test stage to the aggregator by
/// value and read exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct ProfileData {
    search_root: PathBuf,
    artifacts: Vec<PathBuf>,
}

impl ProfileData {
    /// Collect every `*.profraw` file under `root`, sorted by path.
    pub fn discover(root: &Path) -> std::io::Result<Self> {
        let mut artifacts = walk_profraw(root)?;
        artifacts.sort();
        debug!(root = %root.display(), count = artifacts.len(), "Discovered profiling artifacts");
        Ok(Self {
            search_root: root.to_path_buf(),
            artifacts,
        })
    }

    pub fn search_root(&self) -> &Path {
        &self.search_root
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// Check that a `LLVM_PROFILE_FILE` pattern yields one file per process and
/// module, so concurrently running test binaries cannot collide.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if !pattern.contains(PID_PLACEHOLDER) {
        return Err(format!(
            "profile file pattern `{pattern}` must contain {PID_PLACEHOLDER}"
        ));
    }
    if !pattern.contains(MODULE_PLACEHOLDER) {
        return Err(format!(
            "profile file pattern `{pattern}` must contain {MODULE_PLACEHOLDER}"
        ));
    }
    if !pattern.ends_with(&format!(".{PROFRAW_EXTENSION}")) {
        return Err(format!(
            "profile file pattern `{pattern}` must end in .{PROFRAW_EXTENSION}"
        ));
    }
    Ok(())
}

/// Delete leftover `*.profraw` files under `root` from an earlier run.
///
/// Returns how many were removed.
pub fn remove_stale(root: &Path) -> std::io::Result<usize> {
    let stale = walk_profraw(root)?;
    for path in &stale {
        std::fs::remove_file(path)?;
    }
    Ok(stale.len())
}

fn walk_profraw(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let name = entry.file_name();
                if name == ".git" || name == "target" {
                    continue;
                }
                files.extend(walk_profraw(&path)?);
            } else if file_type.is_file()
                && path.extension().is_some_and(|e| e == PROFRAW_EXTENSION)
            {
                files.push(path);
            }
        }
    }

    Ok(files)
}
