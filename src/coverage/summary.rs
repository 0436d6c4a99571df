//! Coverage aggregation
//!
//! Totals across files are sums of the per-file numerators and denominators,
//! re-divided once, never a mean of per-file percentages. The only mean is
//! the `overall_percent` composite of line and function coverage.

use serde::{Deserialize, Serialize};

use super::CoverageFile;

/// `numerator / denominator * 100`, or 0 when the denominator is 0.
pub fn percent(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64 * 100.0
    }
}

/// Per-file coverage numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub path: String,
    pub executable_lines: usize,
    /// Lines executed at least once.
    pub covered_lines: usize,
    /// Executed lines also touched by an assertion.
    pub validated_lines: usize,
    pub total_functions: usize,
    pub covered_functions: usize,
    pub line_coverage_percent: f64,
    pub function_coverage_percent: f64,
}

impl FileSummary {
    pub fn of(file: &CoverageFile) -> Self {
        let executable_lines = file.line_records.len();
        let covered_lines = file
            .line_records
            .values()
            .filter(|r| r.execution_count > 0)
            .count();
        let validated_lines = file
            .line_records
            .values()
            .filter(|r| r.execution_count > 0 && r.assertion_validated)
            .count();
        let total_functions = file.function_records.len();
        let covered_functions = file
            .function_records
            .values()
            .filter(|f| f.execution_count > 0)
            .count();

        Self {
            path: file.path.clone(),
            executable_lines,
            covered_lines,
            validated_lines,
            total_functions,
            covered_functions,
            line_coverage_percent: percent(covered_lines, executable_lines),
            function_coverage_percent: percent(covered_functions, total_functions),
        }
    }
}

/// Coverage numbers for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub files: Vec<FileSummary>,
    pub total_files: usize,
    pub executable_lines: usize,
    pub covered_lines: usize,
    pub validated_lines: usize,
    pub total_functions: usize,
    pub covered_functions: usize,
    pub line_coverage_percent: f64,
    pub function_coverage_percent: f64,
    pub validated_percent: f64,
    /// Mean of line and function coverage (line coverage alone when no
    /// functions are tracked).
    pub overall_percent: f64,
}

impl CoverageSummary {
    pub fn from_files<'a>(files: impl IntoIterator<Item = &'a CoverageFile>) -> Self {
        let files: Vec<FileSummary> = files.into_iter().map(FileSummary::of).collect();

        let mut summary = CoverageSummary {
            total_files: files.len(),
            ..Default::default()
        };
        for f in &files {
            summary.executable_lines += f.executable_lines;
            summary.covered_lines += f.covered_lines;
            summary.validated_lines += f.validated_lines;
            summary.total_functions += f.total_functions;
            summary.covered_functions += f.covered_functions;
        }
        summary.line_coverage_percent = percent(summary.covered_lines, summary.executable_lines);
        summary.function_coverage_percent = percent(summary.covered_functions, summary.total_functions);
        summary.validated_percent = percent(summary.validated_lines, summary.executable_lines);
        summary.overall_percent = if summary.total_functions == 0 {
            summary.line_coverage_percent
        } else {
            (summary.line_coverage_percent + summary.function_coverage_percent) / 2.0
        };
        summary.files = files;
        summary
    }

    /// Whether line coverage reaches `threshold` percent.
    pub fn meets_threshold(&self, threshold: f64) -> bool {
        self.line_coverage_percent >= threshold
    }

    pub fn file(&self, path: &str) -> Option<&FileSummary> {
        self.files.iter().find(|f| f.path == path)
    }
}
