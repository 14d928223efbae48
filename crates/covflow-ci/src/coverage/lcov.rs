//! LCOV tracefile model, parser and canonical writer.
//!
//! Records are kept in ordered maps and rendered in a fixed field order, so
//! rendering is a pure function of the data: the same report always yields
//! the same bytes.

use crate::coverage::summary::{CoverageCounts, CoverageSummary, FileSummary};
use crate::error::AggregationError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies one outcome of one branch point (`BRDA:<line>,<block>,<branch>,…`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchId {
    pub line: u32,
    pub block: u32,
    pub branch: u32,
}

/// Function entry (`FN`/`FNDA`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionCoverage {
    pub line: u32,
    pub hits: u64,
}

/// Coverage of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCoverage {
    /// Line number to execution count.
    pub lines: BTreeMap<u32, u64>,

    /// Branch outcome to times taken; `None` when the enclosing block never ran.
    pub branches: BTreeMap<BranchId, Option<u64>>,

    /// Function name to entry.
    pub functions: BTreeMap<String, FunctionCoverage>,
}

impl FileCoverage {
    /// Record `hits` executions of `line`, adding to any earlier count.
    pub fn add_line(&mut self, line: u32, hits: u64) {
        *self.lines.entry(line).or_insert(0) += hits;
    }

    /// Record a branch outcome, adding to any earlier count.
    pub fn add_branch(&mut self, id: BranchId, taken: Option<u64>) {
        let entry = self.branches.entry(id).or_insert(None);
        *entry = match (*entry, taken) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }

    pub fn counts(&self) -> CoverageCounts {
        CoverageCounts {
            lines_found: self.lines.len() as u64,
            lines_hit: self.lines.values().filter(|&&h| h > 0).count() as u64,
            branches_found: self.branches.len() as u64,
            branches_hit: self
                .branches
                .values()
                .filter(|t| matches!(t, Some(n) if *n > 0))
                .count() as u64,
            functions_found: self.functions.len() as u64,
            functions_hit: self.functions.values().filter(|f| f.hits > 0).count() as u64,
        }
    }

    fn merge(&mut self, other: FileCoverage) {
        for (line, hits) in other.lines {
            self.add_line(line, hits);
        }
        for (id, taken) in other.branches {
            self.add_branch(id, taken);
        }
        for (name, function) in other.functions {
            let entry = self
                .functions
                .entry(name)
                .or_insert(FunctionCoverage {
                    line: function.line,
                    hits: 0,
                });
            entry.hits += function.hits;
        }
    }
}

/// An aggregated coverage report: per-file line, branch and function data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    files: BTreeMap<PathBuf, FileCoverage>,
}

impl CoverageReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `coverage` for `path`, merging with data already present.
    pub fn insert(&mut self, path: impl Into<PathBuf>, coverage: FileCoverage) {
        match self.files.entry(path.into()) {
            std::collections::btree_map::Entry::Occupied(mut e) => e.get_mut().merge(coverage),
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(coverage);
            }
        }
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<&FileCoverage> {
        self.files.get(path.as_ref())
    }

    pub fn files(&self) -> impl Iterator<Item = (&Path, &FileCoverage)> {
        self.files.iter().map(|(p, c)| (p.as_path(), c))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Keep only files for which `keep` returns true. Returns how many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&Path) -> bool) -> usize {
        let before = self.files.len();
        self.files.retain(|path, _| keep(path));
        before - self.files.len()
    }

    /// Parse an LCOV tracefile.
    ///
    /// Repeated records for the same file are merged. Summary fields
    /// (`LF`, `LH`, `BRF`, ...) are ignored and recomputed on render.
    pub fn parse(content: &str) -> Result<Self, AggregationError> {
        let mut report = CoverageReport::new();
        let mut current: Option<(PathBuf, FileCoverage)> = None;

        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let malformed = |reason: &str| AggregationError::Malformed {
                line: line_no,
                reason: reason.to_string(),
            };

            if let Some(path) = line.strip_prefix("SF:") {
                if let Some((path, coverage)) = current.take() {
                    report.insert(path, coverage);
                }
                current = Some((PathBuf::from(path), FileCoverage::default()));
                continue;
            }
            if line == "end_of_record" {
                let (path, coverage) = current
                    .take()
                    .ok_or_else(|| malformed("end_of_record outside a record"))?;
                report.insert(path, coverage);
                continue;
            }

            let Some((tag, value)) = line.split_once(':') else {
                return Err(malformed("expected <TAG>:<value>"));
            };
            match tag {
                "DA" | "BRDA" | "FN" | "FNDA" => {}
                // Test name, summaries and extensions carry nothing we keep.
                _ => continue,
            }
            let Some((_, coverage)) = current.as_mut() else {
                return Err(malformed("data before SF"));
            };

            match tag {
                "DA" => {
                    let mut parts = value.split(',');
                    let line = parse_num::<u32>(parts.next(), "DA line").map_err(|r| malformed(&r))?;
                    let hits = parse_hits(parts.next()).map_err(|r| malformed(&r))?;
                    coverage.add_line(line, hits);
                }
                "BRDA" => {
                    let parts: Vec<&str> = value.split(',').collect();
                    if parts.len() != 4 {
                        return Err(malformed("BRDA needs four fields"));
                    }
                    let id = BranchId {
                        line: parse_num(Some(parts[0]), "BRDA line").map_err(|r| malformed(&r))?,
                        block: parse_num(Some(parts[1]), "BRDA block").map_err(|r| malformed(&r))?,
                        branch: parse_num(Some(parts[2]), "BRDA branch").map_err(|r| malformed(&r))?,
                    };
                    let taken = match parts[3] {
                        "-" => None,
                        n => Some(parse_hits(Some(n)).map_err(|r| malformed(&r))?),
                    };
                    coverage.add_branch(id, taken);
                }
                "FN" => {
                    let (line, name) = value
                        .split_once(',')
                        .ok_or_else(|| malformed("FN needs <line>,<name>"))?;
                    let line = parse_num::<u32>(Some(line), "FN line").map_err(|r| malformed(&r))?;
                    coverage
                        .functions
                        .entry(name.to_string())
                        .or_insert(FunctionCoverage { line, hits: 0 })
                        .line = line;
                }
                "FNDA" => {
                    let (hits, name) = value
                        .split_once(',')
                        .ok_or_else(|| malformed("FNDA needs <hits>,<name>"))?;
                    let hits = parse_hits(Some(hits)).map_err(|r| malformed(&r))?;
                    coverage
                        .functions
                        .entry(name.to_string())
                        .or_insert(FunctionCoverage { line: 0, hits: 0 })
                        .hits += hits;
                }
                _ => unreachable!("filtered above"),
            }
        }

        // Tolerate a final record without end_of_record.
        if let Some((path, coverage)) = current {
            report.insert(path, coverage);
        }
        Ok(report)
    }

    /// Render as an LCOV tracefile in canonical order.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Write the canonical tracefile to `out`.
    pub fn write_to(&self, out: &mut impl fmt::Write) -> fmt::Result {
        for (path, coverage) in &self.files {
            let counts = coverage.counts();
            writeln!(out, "TN:")?;
            writeln!(out, "SF:{}", path.display())?;

            let mut functions: Vec<(&String, &FunctionCoverage)> =
                coverage.functions.iter().collect();
            functions.sort_by(|a, b| a.1.line.cmp(&b.1.line).then_with(|| a.0.cmp(b.0)));
            for (name, function) in &functions {
                writeln!(out, "FN:{},{}", function.line, name)?;
            }
            for (name, function) in &functions {
                writeln!(out, "FNDA:{},{}", function.hits, name)?;
            }
            writeln!(out, "FNF:{}", counts.functions_found)?;
            writeln!(out, "FNH:{}", counts.functions_hit)?;

            for (id, taken) in &coverage.branches {
                write!(out, "BRDA:{},{},{},", id.line, id.block, id.branch)?;
                match taken {
                    Some(n) => writeln!(out, "{n}")?,
                    None => writeln!(out, "-")?,
                }
            }
            writeln!(out, "BRF:{}", counts.branches_found)?;
            writeln!(out, "BRH:{}", counts.branches_hit)?;

            for (line, hits) in &coverage.lines {
                writeln!(out, "DA:{},{}", line, hits)?;
            }
            writeln!(out, "LF:{}", counts.lines_found)?;
            writeln!(out, "LH:{}", counts.lines_hit)?;
            writeln!(out, "end_of_record")?;
        }
        Ok(())
    }

    /// SHA-256 hex digest of the rendered report.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Per-file and total counts.
    pub fn summary(&self) -> CoverageSummary {
        let files: Vec<FileSummary> = self
            .files
            .iter()
            .map(|(path, coverage)| FileSummary {
                path: path.clone(),
                counts: coverage.counts(),
            })
            .collect();
        let total = files
            .iter()
            .fold(CoverageCounts::default(), |acc, f| acc + f.counts);
        CoverageSummary { files, total }
    }
}

impl fmt::Display for CoverageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_to(f)
    }
}

fn parse_num<T: std::str::FromStr>(field: Option<&str>, what: &str) -> Result<T, String> {
    let field = field.ok_or_else(|| format!("missing {what}"))?;
    field
        .trim()
        .parse()
        .map_err(|_| format!("invalid {what}: `{field}`"))
}

/// Hit counts; some producers emit negative or fractional counts on overflow,
/// which are clamped to zero.
fn parse_hits(field: Option<&str>) -> Result<u64, String> {
    let field = field.ok_or_else(|| "missing hit count".to_string())?.trim();
    if let Ok(n) = field.parse::<u64>() {
        return Ok(n);
    }
    match field.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n.max(0.0) as u64),
        _ => Err(format!("invalid hit count: `{field}`")),
    }
}
