//! Specula: a BDD test engine with a deterministic async scheduler
//!
//! Specula declares nested `describe`/`it` suites, runs them with
//! before/after hooks on a cooperative scheduler driven by a virtual clock,
//! tracks line and function coverage, and renders results through a
//! registry of report formatters.
//!
//! # Quick Start
//!
//! ```
//! use specula::prelude::*;
//!
//! let tree = SuiteTree::declare(|d| {
//!     d.describe("timers", |d| {
//!         d.it_async("sleeps without real waiting", |ctx| async move {
//!             ctx.sleep(1_000).await;
//!             if ctx.now_ms() == 1_000 { Ok(()) } else { Err(TestError::assertion("clock drifted")) }
//!         });
//!     });
//! })
//! .unwrap();
//!
//! let report = SuiteRunner::new(RunnerConfig::default()).run(&tree);
//! let data = reporting::aggregate(Some(&report), None);
//! let text = FormatterRegistry::with_builtins()
//!     .format("tap", &data, &FormatOptions::default())
//!     .unwrap();
//! assert!(text.contains("ok 1 - timers > sleeps without real waiting"));
//! ```
//!
//! # Module Overview
//!
//! Declaration flows: [`suite`] → [`runner`] (using [`hooks`] and
//! [`scheduler`]) → [`reporting`], with [`coverage`] fed by instrumented code.
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Declaration** | [`suite`], [`hooks`] |
//! | **Execution** | [`scheduler`], [`runner`], [`config`] |
//! | **Results** | [`coverage`], [`reporting`], [`error`](Error) |
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod coverage;
pub mod error;
pub mod hooks;
pub mod prelude;
pub mod reporting;
pub mod runner;
pub mod scheduler;
pub mod suite;

pub use error::{Error, Result};

/// Specula version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
