//! Suite runner
//!
//! Walks a declared [`SuiteTree`] in declaration order and records exactly
//! one [`Outcome`] per test. For every eligible test the runner runs the
//! before-hook chain, the body (inline when sync, on the scheduler when
//! async), then the after-hook chain regardless of what happened before.
//! Errors never escape a test: they are converted into outcomes.
//!
//! ```
//! use specula::config::RunnerConfig;
//! use specula::runner::SuiteRunner;
//! use specula::suite::SuiteTree;
//!
//! let tree = SuiteTree::declare(|d| {
//!     d.it_async("waits", |ctx| async move {
//!         ctx.sleep(20).await;
//!         Ok(())
//!     });
//! })
//! .unwrap();
//! let report = SuiteRunner::new(RunnerConfig::default()).run(&tree);
//! assert_eq!(report.summary.passed, 1);
//! assert_eq!(report.summary.exit_code, 0);
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RunnerConfig;
use crate::error::TestError;
use crate::hooks::{self, HookFailure};
use crate::scheduler::{Scheduler, SchedulerStats, TaskOutcome};
use crate::suite::filter::Eligibility;
use crate::suite::{SuiteTree, TestCase, TestId};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal result of a single test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// An assertion did not hold.
    Failed {
        message: String,
        location: Option<String>,
    },
    /// Something unexpected went wrong (raised error, panic, hook failure).
    Errored {
        message: String,
        stack: Option<String>,
    },
    /// The test did not run.
    Skipped { reason: String },
    /// The body did not finish before its deadline.
    TimedOut { elapsed_ms: u64 },
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    /// Failure detail, if any.
    pub fn message(&self) -> Option<String> {
        match self {
            Outcome::Passed => None,
            Outcome::Failed { message, .. } | Outcome::Errored { message, .. } => Some(message.clone()),
            Outcome::Skipped { reason } => Some(reason.clone()),
            Outcome::TimedOut { elapsed_ms } => Some(format!("timed out after {} ms", elapsed_ms)),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASSED"),
            Outcome::Failed { message, .. } => write!(f, "FAILED: {}", message),
            Outcome::Errored { message, .. } => write!(f, "ERRORED: {}", message),
            Outcome::Skipped { reason } => write!(f, "SKIPPED: {}", reason),
            Outcome::TimedOut { elapsed_ms } => write!(f, "TIMED OUT after {} ms", elapsed_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// TestRecord
// ---------------------------------------------------------------------------

/// One row of the run's result sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub name: String,
    /// Enclosing suite names followed by the test name.
    pub name_path: Vec<String>,
    /// Dotted suite path.
    pub classname: String,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<HookFailure>,
    /// Message of the error an `expect_error` test produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_error: Option<String>,
}

impl TestRecord {
    pub fn full_name(&self) -> String {
        self.name_path.join(crate::suite::PATH_SEPARATOR)
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// Run-level tally handed to drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub timed_out: usize,
    /// Wall time of the whole run.
    pub elapsed_ms: u64,
    /// Scheduler time of the whole run. Equals wall time only under the
    /// wall clock.
    pub virtual_elapsed_ms: u64,
    /// 0 iff nothing failed or errored (and, with strict timeouts, nothing
    /// timed out).
    pub exit_code: i32,
}

impl RunSummary {
    pub fn from_records(
        records: &[TestRecord],
        elapsed_ms: u64,
        virtual_elapsed_ms: u64,
        strict_timeouts: bool,
    ) -> Self {
        let mut summary = RunSummary {
            total: records.len(),
            elapsed_ms,
            virtual_elapsed_ms,
            ..Default::default()
        };
        for record in records {
            match record.outcome {
                Outcome::Passed => summary.passed += 1,
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::Errored { .. } => summary.errored += 1,
                Outcome::Skipped { .. } => summary.skipped += 1,
                Outcome::TimedOut { .. } => summary.timed_out += 1,
            }
        }
        let timed_out_fails = strict_timeouts && summary.timed_out > 0;
        summary.exit_code = if summary.failed > 0 || summary.errored > 0 || timed_out_fails {
            1
        } else {
            0
        };
        summary
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combine two shard summaries. Shards run concurrently, so elapsed
    /// time is the maximum, not the sum.
    pub fn merge(&self, other: &RunSummary) -> RunSummary {
        let mut merged = RunSummary {
            total: self.total + other.total,
            passed: self.passed + other.passed,
            failed: self.failed + other.failed,
            errored: self.errored + other.errored,
            skipped: self.skipped + other.skipped,
            timed_out: self.timed_out + other.timed_out,
            elapsed_ms: self.elapsed_ms.max(other.elapsed_ms),
            virtual_elapsed_ms: self.virtual_elapsed_ms.max(other.virtual_elapsed_ms),
            exit_code: self.exit_code.max(other.exit_code),
        };
        if merged.failed > 0 || merged.errored > 0 {
            merged.exit_code = merged.exit_code.max(1);
        }
        merged
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub suite_name: String,
    pub started_at: DateTime<Utc>,
    pub records: Vec<TestRecord>,
    pub summary: RunSummary,
    pub scheduler: SchedulerStats,
}

impl RunReport {
    pub fn record(&self, full_name: &str) -> Option<&TestRecord> {
        self.records.iter().find(|r| r.full_name() == full_name)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(f, "  {}", self.suite_name)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;

        for record in &self.records {
            let icon = match record.outcome {
                Outcome::Passed => "✓",
                Outcome::Failed { .. } => "✗",
                Outcome::Errored { .. } => "!",
                Outcome::Skipped { .. } => "○",
                Outcome::TimedOut { .. } => "⏱",
            };
            writeln!(f, "  {} {} ({} ms)", icon, record.full_name(), record.duration_ms)?;
            match &record.outcome {
                Outcome::Passed | Outcome::Skipped { .. } => {}
                other => writeln!(f, "      {}", other)?,
            }
            for failure in &record.hook_failures {
                writeln!(f, "      {}", failure)?;
            }
        }

        let s = &self.summary;
        writeln!(f, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "  Total: {}  Passed: {}  Failed: {}  Errored: {}  Skipped: {}  Timed out: {}",
            s.total, s.passed, s.failed, s.errored, s.skipped, s.timed_out
        )?;
        writeln!(f, "  Duration: {} ms (scheduler {} ms)", s.elapsed_ms, s.virtual_elapsed_ms)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SuiteRunner
// ---------------------------------------------------------------------------

/// Executes a suite tree.
#[derive(Debug)]
pub struct SuiteRunner {
    config: RunnerConfig,
}

impl SuiteRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run every test in the tree. Each run gets a fresh scheduler, so the
    /// clock starts at zero.
    pub fn run(&self, tree: &SuiteTree) -> RunReport {
        let started_at = Utc::now();
        let wall = Instant::now();
        let mut scheduler = Scheduler::with_config(self.config.scheduler_config());
        let eligibility = Eligibility::resolve(tree, &self.config.test_filter());
        debug!(
            tests = tree.len(),
            eligible = eligibility.eligible_count(),
            focus = eligibility.focus_mode(),
            "starting run"
        );

        let start = scheduler.now_ms();
        let records: Vec<TestRecord> = tree
            .walk_tests()
            .into_iter()
            .map(|id| self.run_test(tree, id, &eligibility, &mut scheduler))
            .collect();
        let virtual_elapsed_ms = scheduler.now_ms().saturating_sub(start);
        let elapsed_ms = wall.elapsed().as_millis() as u64;

        let summary = RunSummary::from_records(
            &records,
            elapsed_ms,
            virtual_elapsed_ms,
            self.config.strict_timeouts,
        );
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            errored = summary.errored,
            skipped = summary.skipped,
            timed_out = summary.timed_out,
            elapsed_ms,
            virtual_elapsed_ms,
            "run finished"
        );

        RunReport {
            suite_name: self.config.suite_name.clone(),
            started_at,
            records,
            summary,
            scheduler: scheduler.stats().clone(),
        }
    }

    fn run_test(
        &self,
        tree: &SuiteTree,
        id: TestId,
        eligibility: &Eligibility,
        scheduler: &mut Scheduler,
    ) -> TestRecord {
        let test = tree.test(id);
        let full_name = tree.display_name(id);
        let mut record = TestRecord {
            name: test.name.clone(),
            name_path: tree.name_path(id),
            classname: tree.classname(id),
            duration_ms: 0,
            outcome: Outcome::Passed,
            tags: test.tags.iter().cloned().collect(),
            hook_failures: Vec::new(),
            captured_error: None,
        };

        if let Some(reason) = eligibility.skip_reason(id) {
            debug!(test = %full_name, reason, "skipping test");
            record.outcome = Outcome::Skipped {
                reason: reason.to_string(),
            };
            return record;
        }

        let timeout = Duration::from_millis(test.options.timeout_ms.unwrap_or(self.config.default_timeout_ms));
        debug!(test = %full_name, is_async = test.is_async(), ?timeout, "running test");
        let start = scheduler.now_ms();

        let before = hooks::before_chain(tree, id);
        record.hook_failures = hooks::run_chain(tree, &before, scheduler, Some(timeout));
        let body = if record.hook_failures.is_empty() {
            Some(test.body.invoke(scheduler, &full_name, Some(timeout)))
        } else {
            None
        };

        let after = hooks::after_chain(tree, id);
        let after_failures = hooks::run_chain(tree, &after, scheduler, Some(timeout));
        record.hook_failures.extend(after_failures);

        let (outcome, captured) = match body {
            Some(task) => resolve_outcome(test, task),
            None => (
                Outcome::Errored {
                    message: record.hook_failures[0].to_string(),
                    stack: None,
                },
                None,
            ),
        };
        record.outcome = match outcome {
            Outcome::Passed if !record.hook_failures.is_empty() => Outcome::Errored {
                message: record.hook_failures[0].to_string(),
                stack: None,
            },
            other => other,
        };
        record.captured_error = captured;
        record.duration_ms = scheduler.now_ms().saturating_sub(start);
        debug!(test = %full_name, outcome = %record.outcome, duration_ms = record.duration_ms, "test finished");
        record
    }
}

/// Map a finished body onto an outcome, honouring `expect_error`.
fn resolve_outcome(test: &TestCase, task: TaskOutcome) -> (Outcome, Option<String>) {
    let result = match task {
        TaskOutcome::TimedOut { elapsed_ms } => return (Outcome::TimedOut { elapsed_ms }, None),
        TaskOutcome::Stalled => {
            return (
                Outcome::Errored {
                    message: "test stalled with nothing left to wake it".to_string(),
                    stack: None,
                },
                None,
            )
        }
        TaskOutcome::Returned(result) => result,
    };

    if test.options.expect_error {
        return match result {
            Ok(()) => (
                Outcome::Failed {
                    message: "expected an error but the test completed successfully".to_string(),
                    location: None,
                },
                None,
            ),
            Err(e) => {
                let message = e.message().to_string();
                match &test.matcher {
                    Some(matcher) if !matcher.is_match(&message) => (
                        Outcome::Failed {
                            message: format!("expected an error matching {}, got: {}", matcher, message),
                            location: None,
                        },
                        Some(message),
                    ),
                    _ => (Outcome::Passed, Some(message)),
                }
            }
        };
    }

    let outcome = match result {
        Ok(()) => Outcome::Passed,
        Err(TestError::Assertion { message, location }) => Outcome::Failed { message, location },
        Err(TestError::Raised { message, stack }) => Outcome::Errored { message, stack },
    };
    (outcome, None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
