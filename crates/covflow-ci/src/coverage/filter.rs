//! Path exclusion for coverage reports.

use crate::error::AggregationError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};

/// Decides which source files are left out of a report.
///
/// Paths under the source root are matched relative to it, so `tests/*`
/// drops `<root>/tests/fixture.rs`; paths outside the root stay absolute,
/// so `/*` drops everything that is not part of the project.
#[derive(Debug, Clone)]
pub struct PathFilter {
    source_root: PathBuf,
    canonical_root: Option<PathBuf>,
    set: GlobSet,
}

impl PathFilter {
    pub fn new(source_root: &Path, patterns: &[String]) -> Result<Self, AggregationError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| AggregationError::InvalidGlob {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| AggregationError::InvalidGlob {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source_root: normalize(source_root),
            canonical_root: source_root.canonicalize().ok(),
            set,
        })
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.set.is_match(self.candidate(path))
    }

    fn candidate(&self, path: &Path) -> PathBuf {
        let path = normalize(path);
        if path.is_absolute() {
            let roots = std::iter::once(&self.source_root).chain(self.canonical_root.as_ref());
            for root in roots {
                if let Ok(relative) = path.strip_prefix(root) {
                    return relative.to_path_buf();
                }
            }
        }
        path
    }
}

/// Drop `.` components so `./tests/a.rs` matches `tests/*`.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(root: &str, patterns: &[&str]) -> PathFilter {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        PathFilter::new(Path::new(root), &patterns).unwrap()
    }

    #[test]
    fn test_tests_dir_excluded() {
        let f = filter("/work/project", &["tests/*"]);
        assert!(f.is_excluded(Path::new("tests/fixture.rs")));
        assert!(f.is_excluded(Path::new("./tests/fixture.rs")));
        assert!(f.is_excluded(Path::new("tests/common/mod.rs")));
        assert!(f.is_excluded(Path::new("/work/project/tests/fixture.rs")));
        assert!(!f.is_excluded(Path::new("src/lib.rs")));
        assert!(!f.is_excluded(Path::new("src/tests.rs")));
    }

    #[test]
    fn test_outside_project_excluded() {
        let f = filter("/work/project", &["/*"]);
        assert!(f.is_excluded(Path::new("/home/ci/.cargo/registry/src/serde/lib.rs")));
        assert!(f.is_excluded(Path::new("/rustc/abc123/library/core/src/option.rs")));
        assert!(!f.is_excluded(Path::new("/work/project/src/lib.rs")));
        assert!(!f.is_excluded(Path::new("src/lib.rs")));
    }

    #[test]
    fn test_no_patterns_keeps_everything() {
        let f = filter(".", &[]);
        assert!(!f.is_excluded(Path::new("tests/fixture.rs")));
        assert!(!f.is_excluded(Path::new("/abs/path.rs")));
    }

    #[test]
    fn test_invalid_glob() {
        let err = PathFilter::new(Path::new("."), &["src/[".to_string()]).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidGlob { .. }));
    }
}
