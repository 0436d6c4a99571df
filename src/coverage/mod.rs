//! Coverage tracker
//!
//! Records per-line execution counts, per-line assertion validation and
//! per-function entry counts for seeded source files. A line is in one of
//! three states:
//!
//! | state | `execution_count` | `assertion_validated` |
//! |---|---|---|
//! | uncovered | 0 | false |
//! | executed | > 0 | false |
//! | covered | > 0 | true |
//!
//! Records must be seeded from a [`LineAnalysis`] before the run; hits on
//! unknown files, lines or functions are rejected rather than invented.

pub mod summary;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoverageError;

pub use summary::{CoverageSummary, FileSummary};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Coverage classification of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineState {
    Uncovered,
    Executed,
    Covered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    pub executable: bool,
    pub execution_count: u64,
    /// Only ever true when `execution_count > 0`.
    pub assertion_validated: bool,
}

impl LineRecord {
    fn seeded() -> Self {
        Self {
            executable: true,
            execution_count: 0,
            assertion_validated: false,
        }
    }

    pub fn state(&self) -> LineState {
        match (self.execution_count, self.assertion_validated) {
            (0, _) => LineState::Uncovered,
            (_, false) => LineState::Executed,
            (_, true) => LineState::Covered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub execution_count: u64,
}

/// Coverage records of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageFile {
    pub path: String,
    pub line_records: BTreeMap<u32, LineRecord>,
    /// Keyed by function id.
    pub function_records: BTreeMap<String, FunctionRecord>,
}

impl CoverageFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn from_analysis(path: impl Into<String>, analysis: &LineAnalysis) -> Self {
        let mut file = Self::new(path);
        for line in &analysis.executable_lines {
            file.line_records.insert(*line, LineRecord::seeded());
        }
        for func in &analysis.functions {
            file.function_records.insert(
                func.id.clone(),
                FunctionRecord {
                    name: func.name.clone(),
                    start_line: func.start_line,
                    end_line: func.end_line,
                    execution_count: 0,
                },
            );
        }
        file
    }

    fn reset_counts(&mut self) {
        for record in self.line_records.values_mut() {
            record.execution_count = 0;
            record.assertion_validated = false;
        }
        for record in self.function_records.values_mut() {
            record.execution_count = 0;
        }
    }

    /// Fold another shard's records for the same file into this one:
    /// counts add up, validation is OR-ed, unknown records are adopted.
    pub fn merge(&mut self, other: &CoverageFile) {
        for (line, theirs) in &other.line_records {
            let ours = self.line_records.entry(*line).or_insert(LineRecord {
                executable: theirs.executable,
                execution_count: 0,
                assertion_validated: false,
            });
            ours.executable |= theirs.executable;
            ours.execution_count += theirs.execution_count;
            ours.assertion_validated =
                (ours.assertion_validated || theirs.assertion_validated) && ours.execution_count > 0;
        }
        for (id, theirs) in &other.function_records {
            match self.function_records.get_mut(id) {
                Some(ours) => ours.execution_count += theirs.execution_count,
                None => {
                    self.function_records.insert(id.clone(), theirs.clone());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Line analysis
// ---------------------------------------------------------------------------

/// A function's extent within a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRange {
    pub id: String,
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl FunctionRange {
    /// Range with the default id `name:start_line`.
    pub fn new(name: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        let name = name.into();
        Self {
            id: format!("{}:{}", name, start_line),
            name,
            start_line,
            end_line,
        }
    }
}

/// Executable lines and function ranges of a source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineAnalysis {
    pub executable_lines: BTreeSet<u32>,
    pub functions: Vec<FunctionRange>,
}

impl LineAnalysis {
    pub fn new(lines: impl IntoIterator<Item = u32>) -> Self {
        Self {
            executable_lines: lines.into_iter().collect(),
            functions: Vec::new(),
        }
    }

    pub fn with_function(mut self, func: FunctionRange) -> Self {
        self.functions.push(func);
        self
    }
}

/// Source-line analysis seam: decides which lines can execute.
pub trait LineAnalyzer {
    fn analyze(&self, source: &str) -> LineAnalysis;
}

/// Line-oriented analyzer: every non-blank line that is not a comment is
/// executable. Functions are recognised by a regex on their opening line
/// and closed by the next `end` at the same indentation.
#[derive(Debug, Clone)]
pub struct PlainTextAnalyzer {
    pub comment_prefix: String,
    function_pattern: Option<Regex>,
}

impl Default for PlainTextAnalyzer {
    fn default() -> Self {
        Self {
            comment_prefix: "--".to_string(),
            function_pattern: Regex::new(r"^(\s*)(?:local\s+)?function\s+([A-Za-z_][\w.:]*)").ok(),
        }
    }
}

impl PlainTextAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.comment_prefix = prefix.into();
        self
    }

    /// Replace the function-opening pattern. Capture group 1 must be the
    /// indentation and group 2 the function name.
    pub fn with_function_pattern(mut self, pattern: Regex) -> Self {
        self.function_pattern = Some(pattern);
        self
    }

    fn closing_line(lines: &[&str], open: usize, indent: &str) -> usize {
        lines
            .iter()
            .enumerate()
            .skip(open + 1)
            .find(|(_, l)| {
                let trimmed = l.trim_start();
                trimmed.starts_with("end") && &l[..l.len() - trimmed.len()] == indent
            })
            .map(|(i, _)| i)
            .unwrap_or(lines.len().saturating_sub(1))
    }
}

impl LineAnalyzer for PlainTextAnalyzer {
    fn analyze(&self, source: &str) -> LineAnalysis {
        let lines: Vec<&str> = source.lines().collect();
        let mut analysis = LineAnalysis::default();

        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(self.comment_prefix.as_str()) {
                continue;
            }
            let line_no = i as u32 + 1;
            analysis.executable_lines.insert(line_no);

            if let Some(caps) = self.function_pattern.as_ref().and_then(|re| re.captures(line)) {
                let indent = caps.get(1).map_or("", |m| m.as_str());
                let name = caps.get(2).map_or("<anonymous>", |m| m.as_str());
                let end = Self::closing_line(&lines, i, indent) as u32 + 1;
                analysis.functions.push(FunctionRange::new(name, line_no, end));
            }
        }
        analysis
    }
}

// ---------------------------------------------------------------------------
// CoverageTracker
// ---------------------------------------------------------------------------

/// Mutable coverage state for one run.
#[derive(Debug, Clone)]
pub struct CoverageTracker {
    files: BTreeMap<String, CoverageFile>,
    enabled: bool,
}

impl Default for CoverageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            enabled: true,
        }
    }

    /// Seed (or re-seed) a file's records from an analysis.
    pub fn seed_file(&mut self, path: impl Into<String>, analysis: &LineAnalysis) {
        let path = path.into();
        debug!(
            file = %path,
            lines = analysis.executable_lines.len(),
            functions = analysis.functions.len(),
            "seeding coverage"
        );
        let file = CoverageFile::from_analysis(path.clone(), analysis);
        self.files.insert(path, file);
    }

    pub fn seed_source(&mut self, path: impl Into<String>, source: &str, analyzer: &dyn LineAnalyzer) {
        self.seed_file(path, &analyzer.analyze(source));
    }

    /// Zero every count and validation mark; seeded records are kept.
    pub fn reset(&mut self) {
        for file in self.files.values_mut() {
            file.reset_counts();
        }
    }

    /// A disabled tracker accepts and ignores instrumentation calls.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn line_mut(&mut self, file: &str, line: u32) -> Result<&mut LineRecord, CoverageError> {
        let coverage_file = self
            .files
            .get_mut(file)
            .ok_or_else(|| CoverageError::UnknownFile(file.to_string()))?;
        coverage_file
            .line_records
            .get_mut(&line)
            .ok_or_else(|| CoverageError::UnknownLine {
                file: file.to_string(),
                line,
            })
    }

    pub fn record_line_hit(&mut self, file: &str, line: u32) -> Result<(), CoverageError> {
        if !self.enabled {
            return Ok(());
        }
        match self.line_mut(file, line) {
            Ok(record) => {
                record.execution_count += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "rejected line hit");
                Err(e)
            }
        }
    }

    pub fn record_function_entry(&mut self, file: &str, function_id: &str) -> Result<(), CoverageError> {
        if !self.enabled {
            return Ok(());
        }
        let result = self
            .files
            .get_mut(file)
            .ok_or_else(|| CoverageError::UnknownFile(file.to_string()))
            .and_then(|f| {
                f.function_records
                    .get_mut(function_id)
                    .ok_or_else(|| CoverageError::UnknownFunction {
                        file: file.to_string(),
                        function: function_id.to_string(),
                    })
            });
        match result {
            Ok(record) => {
                record.execution_count += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "rejected function entry");
                Err(e)
            }
        }
    }

    /// Mark a line as touched by an assertion. Returns whether the mark was
    /// applied; a line that never ran cannot be validated.
    pub fn mark_validated(&mut self, file: &str, line: u32) -> Result<bool, CoverageError> {
        if !self.enabled {
            return Ok(false);
        }
        let record = self.line_mut(file, line)?;
        if record.execution_count == 0 {
            return Ok(false);
        }
        record.assertion_validated = true;
        Ok(true)
    }

    pub fn line_state(&self, file: &str, line: u32) -> Option<LineState> {
        self.files
            .get(file)
            .and_then(|f| f.line_records.get(&line))
            .map(LineRecord::state)
    }

    pub fn file(&self, path: &str) -> Option<&CoverageFile> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = &CoverageFile> {
        self.files.values()
    }

    /// Frozen copy of the current records.
    pub fn snapshot(&self) -> CoverageSnapshot {
        CoverageSnapshot {
            files: self.files.clone(),
        }
    }

    pub fn summary(&self) -> CoverageSummary {
        CoverageSummary::from_files(self.files.values())
    }
}

// ---------------------------------------------------------------------------
// CoverageHandle
// ---------------------------------------------------------------------------

/// Shared handle for instrumented code running inside test bodies.
#[derive(Debug, Clone, Default)]
pub struct CoverageHandle(Rc<RefCell<CoverageTracker>>);

impl CoverageHandle {
    pub fn new(tracker: CoverageTracker) -> Self {
        Self(Rc::new(RefCell::new(tracker)))
    }

    pub fn hit(&self, file: &str, line: u32) -> Result<(), CoverageError> {
        self.0.borrow_mut().record_line_hit(file, line)
    }

    /// Record several line hits in order, stopping at the first rejection.
    pub fn hit_lines(&self, file: &str, lines: impl IntoIterator<Item = u32>) -> Result<(), CoverageError> {
        let mut tracker = self.0.borrow_mut();
        for line in lines {
            tracker.record_line_hit(file, line)?;
        }
        Ok(())
    }

    pub fn enter(&self, file: &str, function_id: &str) -> Result<(), CoverageError> {
        self.0.borrow_mut().record_function_entry(file, function_id)
    }

    pub fn validate(&self, file: &str, line: u32) -> Result<bool, CoverageError> {
        self.0.borrow_mut().mark_validated(file, line)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut CoverageTracker) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    pub fn snapshot(&self) -> CoverageSnapshot {
        self.0.borrow().snapshot()
    }
}

// ---------------------------------------------------------------------------
// CoverageSnapshot
// ---------------------------------------------------------------------------

/// Read-only coverage payload of a finished run (or shard).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    pub files: BTreeMap<String, CoverageFile>,
}

impl CoverageSnapshot {
    pub fn merge(&mut self, other: &CoverageSnapshot) {
        for (path, theirs) in &other.files {
            match self.files.get_mut(path) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.files.insert(path.clone(), theirs.clone());
                }
            }
        }
    }

    pub fn summary(&self) -> CoverageSummary {
        CoverageSummary::from_files(self.files.values())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CoverageTracker {
        let mut t = CoverageTracker::new();
        t.seed_file(
            "calc.lua",
            &LineAnalysis::new([1, 2, 3, 5]).with_function(FunctionRange::new("add", 1, 5)),
        );
        t
    }

    #[test]
    fn test_unknown_targets_are_rejected() {
        let mut t = tracker();
        assert_eq!(
            t.record_line_hit("nope.lua", 1),
            Err(CoverageError::UnknownFile("nope.lua".into()))
        );
        assert_eq!(
            t.record_line_hit("calc.lua", 4),
            Err(CoverageError::UnknownLine {
                file: "calc.lua".into(),
                line: 4
            })
        );
        assert!(matches!(
            t.record_function_entry("calc.lua", "sub:1"),
            Err(CoverageError::UnknownFunction { .. })
        ));
        assert!(t.mark_validated("calc.lua", 9).is_err());
    }

    #[test]
    fn test_validation_requires_execution() {
        let mut t = tracker();
        assert_eq!(t.mark_validated("calc.lua", 2), Ok(false));
        assert_eq!(t.line_state("calc.lua", 2), Some(LineState::Uncovered));

        t.record_line_hit("calc.lua", 2).unwrap();
        assert_eq!(t.line_state("calc.lua", 2), Some(LineState::Executed));
        assert_eq!(t.mark_validated("calc.lua", 2), Ok(true));
        assert_eq!(t.line_state("calc.lua", 2), Some(LineState::Covered));
    }

    #[test]
    fn test_function_entries_count() {
        let mut t = tracker();
        t.record_function_entry("calc.lua", "add:1").unwrap();
        t.record_function_entry("calc.lua", "add:1").unwrap();
        let f = t.file("calc.lua").unwrap();
        assert_eq!(f.function_records["add:1"].execution_count, 2);
        assert_eq!(f.function_records["add:1"].name, "add");
    }

    #[test]
    fn test_reset_and_disable() {
        let mut t = tracker();
        t.record_line_hit("calc.lua", 1).unwrap();
        t.mark_validated("calc.lua", 1).unwrap();
        t.reset();
        assert_eq!(t.line_state("calc.lua", 1), Some(LineState::Uncovered));
        assert_eq!(t.file("calc.lua").unwrap().line_records.len(), 4);

        t.set_enabled(false);
        assert!(t.record_line_hit("missing.lua", 1).is_ok());
        t.record_line_hit("calc.lua", 1).unwrap();
        assert_eq!(t.line_state("calc.lua", 1), Some(LineState::Uncovered));
    }

    #[test]
    fn test_plain_text_analyzer() {
        let source = "\
-- math helpers
local function add(a, b)
  return a + b
end

function M.twice(x)
  -- double it
  return add(x, x)
end
";
        let analysis = PlainTextAnalyzer::new().analyze(source);
        assert_eq!(
            analysis.executable_lines.iter().copied().collect::<Vec<_>>(),
            vec![2, 3, 4, 6, 8, 9]
        );
        assert_eq!(
            analysis.functions,
            vec![FunctionRange::new("add", 2, 4), FunctionRange::new("M.twice", 6, 9)]
        );
        assert_eq!(analysis.functions[1].id, "M.twice:6");
    }

    #[test]
    fn test_custom_comment_prefix() {
        let analysis = PlainTextAnalyzer::new()
            .with_comment_prefix("#")
            .analyze("# header\nx = 1\n\n# trailing\ny = 2\n");
        assert_eq!(analysis.executable_lines.into_iter().collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn test_snapshot_merge() {
        let mut a = tracker();
        a.record_line_hit("calc.lua", 1).unwrap();
        a.mark_validated("calc.lua", 1).unwrap();
        let mut b = tracker();
        b.record_line_hit("calc.lua", 1).unwrap();
        b.record_line_hit("calc.lua", 3).unwrap();
        b.record_function_entry("calc.lua", "add:1").unwrap();
        b.seed_file("other.lua", &LineAnalysis::new([1]));

        let mut merged = a.snapshot();
        merged.merge(&b.snapshot());
        let calc = &merged.files["calc.lua"];
        assert_eq!(calc.line_records[&1].execution_count, 2);
        assert!(calc.line_records[&1].assertion_validated);
        assert_eq!(calc.line_records[&3].state(), LineState::Executed);
        assert_eq!(calc.function_records["add:1"].execution_count, 1);
        assert!(merged.files.contains_key("other.lua"));
    }

    #[test]
    fn test_handle_shares_tracker() {
        let handle = CoverageHandle::new(tracker());
        let inner = handle.clone();
        inner.hit_lines("calc.lua", [1, 2]).unwrap();
        inner.enter("calc.lua", "add:1").unwrap();
        assert_eq!(inner.validate("calc.lua", 1), Ok(true));
        let states = handle.with(|t| (t.line_state("calc.lua", 1), t.line_state("calc.lua", 3)));
        assert_eq!(states, (Some(LineState::Covered), Some(LineState::Uncovered)));
    }
}
