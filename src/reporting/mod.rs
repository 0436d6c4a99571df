//! Report aggregation
//!
//! Folds a [`RunReport`] and a [`CoverageSnapshot`] into
//! [`StandardReportData`], the single input every formatter consumes.
//! Either section is absent when its subsystem was not active. No text is
//! produced here; see [`formatters`].

pub mod formatters;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coverage::{CoverageFile, CoverageSnapshot, CoverageSummary};
use crate::error::Result;
use crate::runner::{Outcome, RunReport};

pub use formatters::{FormatOptions, FormatterRegistry};

// ---------------------------------------------------------------------------
// Test results section
// ---------------------------------------------------------------------------

/// Report-level status of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl TestStatus {
    /// Timed-out tests report as skipped.
    pub fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Passed => TestStatus::Pass,
            Outcome::Failed { .. } => TestStatus::Fail,
            Outcome::Errored { .. } => TestStatus::Error,
            Outcome::Skipped { .. } | Outcome::TimedOut { .. } => TestStatus::Skipped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Error => "error",
            TestStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseData {
    pub name: String,
    pub classname: String,
    pub full_name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Assertion location or error stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultsData {
    pub suite_name: String,
    /// Run start (UTC).
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Every test whose status is `skipped`, timed-out ones included.
    pub skipped: usize,
    pub timed_out: usize,
    /// Wall time of the run.
    pub elapsed_ms: u64,
    #[serde(default)]
    pub virtual_elapsed_ms: u64,
    pub test_cases: Vec<TestCaseData>,
}

impl TestResultsData {
    pub fn from_run(run: &RunReport) -> Self {
        let s = &run.summary;
        let test_cases = run
            .records
            .iter()
            .map(|r| {
                let detail = match &r.outcome {
                    Outcome::Failed { location, .. } => location.clone(),
                    Outcome::Errored { stack, .. } => stack.clone(),
                    _ => None,
                };
                TestCaseData {
                    name: r.name.clone(),
                    classname: r.classname.clone(),
                    full_name: r.full_name(),
                    status: TestStatus::from_outcome(&r.outcome),
                    duration_ms: r.duration_ms,
                    message: r.outcome.message(),
                    detail,
                    tags: r.tags.clone(),
                }
            })
            .collect();

        Self {
            suite_name: run.suite_name.clone(),
            timestamp: run.started_at,
            total: s.total,
            passed: s.passed,
            failed: s.failed,
            errored: s.errored,
            skipped: s.skipped + s.timed_out,
            timed_out: s.timed_out,
            elapsed_ms: s.elapsed_ms,
            virtual_elapsed_ms: s.virtual_elapsed_ms,
            test_cases,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.errored > 0 {
            1
        } else {
            0
        }
    }

    fn merge(&self, other: &TestResultsData) -> TestResultsData {
        let mut test_cases = self.test_cases.clone();
        test_cases.extend(other.test_cases.iter().cloned());
        TestResultsData {
            suite_name: self.suite_name.clone(),
            timestamp: self.timestamp.min(other.timestamp),
            total: self.total + other.total,
            passed: self.passed + other.passed,
            failed: self.failed + other.failed,
            errored: self.errored + other.errored,
            skipped: self.skipped + other.skipped,
            timed_out: self.timed_out + other.timed_out,
            elapsed_ms: self.elapsed_ms.max(other.elapsed_ms),
            virtual_elapsed_ms: self.virtual_elapsed_ms.max(other.virtual_elapsed_ms),
            test_cases,
        }
    }
}

// ---------------------------------------------------------------------------
// Coverage section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageData {
    pub files: Vec<CoverageFile>,
    pub summary: CoverageSummary,
}

impl CoverageData {
    pub fn from_snapshot(snapshot: &CoverageSnapshot) -> Self {
        Self {
            files: snapshot.files.values().cloned().collect(),
            summary: snapshot.summary(),
        }
    }

    pub fn to_snapshot(&self) -> CoverageSnapshot {
        CoverageSnapshot {
            files: self
                .files
                .iter()
                .map(|f| (f.path.clone(), f.clone()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// StandardReportData
// ---------------------------------------------------------------------------

/// Format-agnostic report payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardReportData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<TestResultsData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageData>,
}

/// Build the report payload from whichever subsystems were active.
pub fn aggregate(run: Option<&RunReport>, coverage: Option<&CoverageSnapshot>) -> StandardReportData {
    StandardReportData {
        test_results: run.map(TestResultsData::from_run),
        coverage: coverage.map(CoverageData::from_snapshot),
    }
}

impl StandardReportData {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Combine two shard reports. Coverage is merged at line level and then
    /// re-summarised, so totals stay sums of sums.
    pub fn merge(&self, other: &StandardReportData) -> StandardReportData {
        let test_results = match (&self.test_results, &other.test_results) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        let coverage = match (&self.coverage, &other.coverage) {
            (Some(a), Some(b)) => {
                let mut snapshot = a.to_snapshot();
                snapshot.merge(&b.to_snapshot());
                Some(CoverageData::from_snapshot(&snapshot))
            }
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        StandardReportData {
            test_results,
            coverage,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.test_results.as_ref().map_or(0, TestResultsData::exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(TestStatus::from_outcome(&Outcome::Passed).as_str(), "pass");
        assert_eq!(
            TestStatus::from_outcome(&Outcome::TimedOut { elapsed_ms: 3 }),
            TestStatus::Skipped
        );
        assert_eq!(
            TestStatus::from_outcome(&Outcome::Errored {
                message: "x".into(),
                stack: None
            })
            .to_string(),
            "error"
        );
        assert_eq!(serde_json::to_string(&TestStatus::Fail).unwrap(), "\"fail\"");
    }

    #[test]
    fn test_absent_sections_stay_absent() {
        let data = aggregate(None, None);
        assert_eq!(data, StandardReportData::default());
        assert_eq!(serde_json::to_string(&data).unwrap(), "{}");
        assert_eq!(data.exit_code(), 0);
    }

    #[test]
    fn test_merge_with_one_sided_sections() {
        let coverage_only = aggregate(None, Some(&CoverageSnapshot::default()));
        let merged = StandardReportData::default().merge(&coverage_only);
        assert!(merged.test_results.is_none());
        assert!(merged.coverage.is_some());
    }
}
