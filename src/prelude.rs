//! Prelude module for convenient imports
//!
//! ```
//! use specula::prelude::*;
//!
//! let tree = SuiteTree::declare(|d| d.it("passes", || Ok(()))).unwrap();
//! let report = SuiteRunner::new(RunnerConfig::default()).run(&tree);
//! assert!(report.summary.is_success());
//! ```

// Declaration
pub use crate::suite::filter::TestFilter;
pub use crate::suite::{Declarator, SuiteTree, TestOptions};

// Execution
pub use crate::config::{CoverageConfig, RunnerConfig};
pub use crate::runner::{Outcome, RunReport, RunSummary, SuiteRunner};
pub use crate::scheduler::{promise, ClockMode, Promise, Resolver, Scheduler, TaskResult, TestContext};

// Coverage
pub use crate::coverage::{
    CoverageHandle, CoverageSnapshot, CoverageSummary, CoverageTracker, LineAnalysis, LineAnalyzer, LineState,
    PlainTextAnalyzer,
};

// Reporting
pub use crate::reporting::{self, FormatOptions, FormatterRegistry, StandardReportData};

// Error handling
pub use crate::error::{Error, Result, TestError};
