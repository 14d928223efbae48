//! Line, branch and function coverage percentages.

use serde::Serialize;
use std::fmt;
use std::ops::Add;
use std::path::PathBuf;

/// Found/hit counters for one file or a whole report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoverageCounts {
    pub lines_found: u64,
    pub lines_hit: u64,
    pub branches_found: u64,
    pub branches_hit: u64,
    pub functions_found: u64,
    pub functions_hit: u64,
}

impl CoverageCounts {
    /// Percentage of instrumented lines executed; `None` without lines.
    pub fn line_percent(&self) -> Option<f64> {
        percent(self.lines_hit, self.lines_found)
    }

    /// Percentage of branch outcomes taken; `None` without branches.
    pub fn branch_percent(&self) -> Option<f64> {
        percent(self.branches_hit, self.branches_found)
    }

    pub fn function_percent(&self) -> Option<f64> {
        percent(self.functions_hit, self.functions_found)
    }
}

impl Add for CoverageCounts {
    type Output = CoverageCounts;

    fn add(self, rhs: CoverageCounts) -> CoverageCounts {
        CoverageCounts {
            lines_found: self.lines_found + rhs.lines_found,
            lines_hit: self.lines_hit + rhs.lines_hit,
            branches_found: self.branches_found + rhs.branches_found,
            branches_hit: self.branches_hit + rhs.branches_hit,
            functions_found: self.functions_found + rhs.functions_found,
            functions_hit: self.functions_hit + rhs.functions_hit,
        }
    }
}

fn percent(hit: u64, found: u64) -> Option<f64> {
    (found > 0).then(|| hit as f64 * 100.0 / found as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSummary {
    pub path: PathBuf,
    #[serde(flatten)]
    pub counts: CoverageCounts,
}

/// Per-file and total coverage of a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageSummary {
    pub files: Vec<FileSummary>,
    pub total: CoverageCounts,
}

impl CoverageSummary {
    pub fn file(&self, path: &str) -> Option<&CoverageCounts> {
        self.files
            .iter()
            .find(|f| f.path.as_os_str() == path)
            .map(|f| &f.counts)
    }
}

fn fmt_percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |p| format!("{p:.1}%"))
}

impl fmt::Display for CoverageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<50} {:>8} {:>8} {:>8}", "File", "Lines", "Branches", "Funcs")?;
        for file in &self.files {
            writeln!(
                f,
                "{:<50} {:>8} {:>8} {:>8}",
                file.path.display().to_string(),
                fmt_percent(file.counts.line_percent()),
                fmt_percent(file.counts.branch_percent()),
                fmt_percent(file.counts.function_percent()),
            )?;
        }
        write!(
            f,
            "{:<50} {:>8} {:>8} {:>8}",
            "TOTAL",
            fmt_percent(self.total.line_percent()),
            fmt_percent(self.total.branch_percent()),
            fmt_percent(self.total.function_percent()),
        )
    }
}
