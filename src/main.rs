//! Specula CLI
//!
//! Runs the built-in demonstration suites, merges report shards and lists
//! the available report formats.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use specula::prelude::*;
use specula::scheduler::{promise, LocalBoxFuture};
use specula::VERSION;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "specula")]
#[command(author, version, about = "A BDD test engine with a deterministic async scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in demonstration suites and render a report
    Demo {
        /// Report format
        #[arg(short, long, default_value = "markdown")]
        format: String,
        /// Write the report here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// JSON config file (defaults to ./specula.json when present)
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Clock driving timers and deadlines
        #[arg(long, value_enum)]
        clock: Option<ClockArg>,
        /// Only run tests whose name path contains this string
        #[arg(long)]
        filter: Option<String>,
        /// Only run tests carrying one of these tags
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
        /// Skip tests carrying any of these tags
        #[arg(long = "exclude-tag", value_name = "TAG")]
        exclude_tags: Vec<String>,
        /// Collect coverage for the instrumented demo module
        #[arg(long)]
        coverage: bool,
    },

    /// Merge JSON report shards and render the combined report
    Merge {
        /// Shard files produced with `--format json`
        #[arg(required = true, value_name = "SHARD")]
        shards: Vec<PathBuf>,
        /// Report format
        #[arg(short, long, default_value = "json")]
        format: String,
        /// Write the report here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// List registered report formats
    Formats,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClockArg {
    Virtual,
    Wall,
}

impl From<ClockArg> for ClockMode {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Virtual => ClockMode::Virtual,
            ClockArg::Wall => ClockMode::Wall,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Demo {
            format,
            output,
            config,
            clock,
            filter,
            tags,
            exclude_tags,
            coverage,
        } => {
            let overrides = DemoOverrides {
                clock,
                filter,
                tags,
                exclude_tags,
                coverage,
            };
            run_demo(&format, output.as_deref(), config.as_deref(), overrides)
        }
        Commands::Merge { shards, format, output } => merge_shards(&shards, &format, output.as_deref()),
        Commands::Formats => {
            for name in FormatterRegistry::with_builtins().names() {
                println!("{}", name);
            }
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn emit(text: &str, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), bytes = text.len(), "report written");
        }
        None => print!("{}", text),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

struct DemoOverrides {
    clock: Option<ClockArg>,
    filter: Option<String>,
    tags: Vec<String>,
    exclude_tags: Vec<String>,
    coverage: bool,
}

fn run_demo(format: &str, output: Option<&Path>, config: Option<&Path>, overrides: DemoOverrides) -> anyhow::Result<i32> {
    let registry = FormatterRegistry::with_builtins();
    if !registry.contains(format) {
        bail!("unknown format '{}' (available: {})", format, registry.names().join(", "));
    }

    let mut config = RunnerConfig::load(config).context("loading configuration")?;
    if let Some(clock) = overrides.clock {
        config.clock = clock.into();
    }
    if overrides.filter.is_some() {
        config.filter = overrides.filter;
    }
    config.include_tags.extend(overrides.tags);
    config.exclude_tags.extend(overrides.exclude_tags);
    config.coverage.enabled |= overrides.coverage;
    config.validate()?;

    let mut tracker = CoverageTracker::new();
    tracker.seed_source(calc::FILE, calc::SOURCE, &PlainTextAnalyzer::new());
    tracker.set_enabled(config.coverage.enabled);
    let coverage = CoverageHandle::new(tracker);

    let tree = demo_suites(&coverage).context("declaring demo suites")?;
    info!(tests = tree.len(), version = VERSION, "running demo suites");
    let report = SuiteRunner::new(config.clone()).run(&tree);

    let snapshot = config.coverage.enabled.then(|| coverage.snapshot());
    let data = reporting::aggregate(Some(&report), snapshot.as_ref());
    let options = FormatOptions {
        title: Some(format!("{} demo", config.suite_name)),
        ..FormatOptions::default()
    };
    let text = registry.format(format, &data, &options)?;
    emit(&text, output)?;

    let mut code = report.summary.exit_code;
    let threshold = config.coverage.threshold_percent;
    if let Some(cov) = &data.coverage {
        if threshold > 0.0 && !cov.summary.meets_threshold(threshold) {
            warn!(
                line_coverage = cov.summary.line_coverage_percent,
                threshold, "coverage below threshold"
            );
            code = code.max(1);
        }
    }
    Ok(code)
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

fn merge_shards(shards: &[PathBuf], format: &str, output: Option<&Path>) -> anyhow::Result<i32> {
    let registry = FormatterRegistry::with_builtins();
    let mut merged: Option<StandardReportData> = None;
    for path in shards {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let shard = StandardReportData::from_json(&text).with_context(|| format!("parsing {}", path.display()))?;
        merged = Some(match merged {
            Some(acc) => acc.merge(&shard),
            None => shard,
        });
    }
    let data = merged.unwrap_or_default();
    info!(shards = shards.len(), "merged report shards");

    let text = registry.format(format, &data, &FormatOptions::default())?;
    emit(&text, output)?;
    Ok(data.exit_code())
}

// ---------------------------------------------------------------------------
// demo suites
// ---------------------------------------------------------------------------

fn check(cond: bool, message: &str) -> TaskResult {
    if cond {
        Ok(())
    } else {
        Err(TestError::assertion(message))
    }
}

/// The demonstration suites.
fn demo_suites(coverage: &CoverageHandle) -> specula::Result<SuiteTree> {
    let outer_before = Rc::new(Cell::new(0u32));
    let outer_after = Rc::new(Cell::new(0u32));
    let inner_before = Rc::new(Cell::new(0u32));
    let inner_after = Rc::new(Cell::new(0u32));
    let calc = calc::Calc::new(coverage.clone())?;

    let tree = SuiteTree::declare_named("demo", |d| {
        d.describe("calc", |d| {
            let c = calc.clone();
            d.it("adds", move || {
                let sum = c.add(2, 3)?;
                check(sum == 5, "2 + 3 should be 5")?;
                c.validated(5)
            });
            let c = calc.clone();
            d.it("divides", move || {
                let q = c.div(9, 3)?;
                check(q == 3, "9 / 3 should be 3")
            });
            let c = calc.clone();
            d.it_with(
                "rejects division by zero",
                TestOptions::new().expect_error().matching("division by zero"),
                move || c.div(1, 0).map(|_| ()),
            );
            d.xit("parses expressions", || Err(TestError::raised("not implemented")));
        });

        d.describe("nested_async", |d| {
            let (ob, oa) = (outer_before.clone(), outer_after.clone());
            d.before_each(move || {
                ob.set(ob.get() + 1);
                Ok(())
            });
            d.after_each(move || {
                oa.set(oa.get() + 1);
                Ok(())
            });

            d.describe_async("inner", |d| {
                let (ib, ia) = (inner_before.clone(), inner_after.clone());
                d.before_each_async(move |ctx| {
                    let ib = ib.clone();
                    async move {
                        ctx.sleep(5).await;
                        ib.set(ib.get() + 1);
                        Ok(())
                    }
                });
                d.after_each_async(move |ctx| {
                    let ia = ia.clone();
                    async move {
                        ctx.yield_now().await;
                        ia.set(ia.get() + 1);
                        Ok(())
                    }
                });
                d.it_async("waits on a timer", |ctx| async move {
                    let start = ctx.now_ms();
                    ctx.sleep(100).await;
                    check(ctx.now_ms() - start >= 100, "timer resumed early")
                });
                d.it_async("polls a condition", |ctx| async move {
                    let ready_at = ctx.now_ms() + 30;
                    let probe = ctx.clone();
                    let ok = ctx.wait_until(move || probe.now_ms() >= ready_at, 1_000, None).await;
                    check(ok, "condition never held")
                });
            });

            d.it("runs sync after async", || Ok(()));
        });

        d.describe("hook counts", |d| {
            let (ob, oa) = (outer_before.clone(), outer_after.clone());
            let (ib, ia) = (inner_before.clone(), inner_after.clone());
            d.it("fire once per leaf test", move || {
                check(ob.get() == 3 && oa.get() == 3, "outer hooks should fire 3 times")?;
                check(ib.get() == 2 && ia.get() == 2, "inner hooks should fire 2 times")
            });
        });

        d.describe("concurrency", |d| {
            d.tags(["async"]);
            d.it_async("keeps parallel results in input order", |ctx| async move {
                let slow = {
                    let ctx = ctx.clone();
                    Box::pin(async move {
                        ctx.sleep(10).await;
                        "slow"
                    }) as LocalBoxFuture<'static, &str>
                };
                let fast = {
                    let ctx = ctx.clone();
                    Box::pin(async move {
                        ctx.sleep(5).await;
                        "fast"
                    }) as LocalBoxFuture<'static, &str>
                };
                let results = ctx.parallel(vec![slow, fast]).await;
                check(results == ["slow", "fast"], "parallel results out of order")
            });
            d.it_async("awaits a promise", |ctx| async move {
                let (p, resolver) = promise::<u32>();
                let settle = ctx.clone();
                let waiter: LocalBoxFuture<'static, std::result::Result<u32, TestError>> = Box::pin(ctx.await_promise(p));
                let worker: LocalBoxFuture<'static, std::result::Result<u32, TestError>> = Box::pin(async move {
                    settle.sleep(20).await;
                    resolver.resolve(42);
                    Ok(0)
                });
                let results = ctx.parallel(vec![waiter, worker]).await;
                match results.into_iter().next() {
                    Some(value) => value.and_then(|v| check(v == 42, "promise resolved to the wrong value")),
                    None => Err(TestError::assertion("parallel returned no results")),
                }
            });
            d.it_async_with(
                "gives up at its deadline",
                TestOptions::new().timeout(50).tag("slow"),
                |ctx| async move {
                    ctx.sleep(10_000).await;
                    Ok(())
                },
            );
        });
    })?;
    Ok(tree)
}

/// A small instrumented module standing in for code under test.
mod calc {
    use specula::coverage::CoverageHandle;
    use specula::error::{CoverageError, TestError};

    pub const FILE: &str = "demo/calc.lua";

    pub const SOURCE: &str = r#"-- calc.lua
local M = {}

function M.add(a, b)
  return a + b
end

function M.div(a, b)
  if b == 0 then
    error("division by zero")
  end
  return a / b
end

function M.unused()
  return nil
end

return M
"#;

    #[derive(Clone)]
    pub struct Calc {
        cov: CoverageHandle,
    }

    impl Calc {
        /// Module body runs once at load; its lines must be seeded.
        pub fn new(cov: CoverageHandle) -> Result<Self, CoverageError> {
            cov.hit_lines(FILE, [2, 4, 8, 15, 19])?;
            Ok(Self { cov })
        }

        fn trace(&self, function: &str, lines: &[u32]) -> Result<(), TestError> {
            self.cov
                .enter(FILE, function)
                .and_then(|()| self.cov.hit_lines(FILE, lines.iter().copied()))
                .map_err(|e| TestError::raised(e.to_string()))
        }

        pub fn validated(&self, line: u32) -> Result<(), TestError> {
            self.cov
                .validate(FILE, line)
                .map(|_| ())
                .map_err(|e| TestError::raised(e.to_string()))
        }

        pub fn add(&self, a: i64, b: i64) -> Result<i64, TestError> {
            self.trace("M.add:4", &[5])?;
            Ok(a + b)
        }

        pub fn div(&self, a: i64, b: i64) -> Result<i64, TestError> {
            self.trace("M.div:8", &[9])?;
            if b == 0 {
                self.trace_line(10)?;
                return Err(TestError::raised("division by zero"));
            }
            self.trace_line(12)?;
            Ok(a / b)
        }

        fn trace_line(&self, line: u32) -> Result<(), TestError> {
            self.cov.hit(FILE, line).map_err(|e| TestError::raised(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> CoverageTracker {
        let mut tracker = CoverageTracker::new();
        tracker.seed_source(calc::FILE, calc::SOURCE, &PlainTextAnalyzer::new());
        tracker
    }

    #[test]
    fn test_calc_load_lines_are_executable() {
        let coverage = CoverageHandle::new(seeded());
        assert!(calc::Calc::new(coverage.clone()).is_ok());
        let snapshot = coverage.snapshot();
        let file = &snapshot.files[calc::FILE];
        assert_eq!(file.line_records[&2].execution_count, 1);
    }

    #[test]
    fn test_calc_load_surfaces_unseeded_file() {
        let coverage = CoverageHandle::new(CoverageTracker::new());
        assert!(calc::Calc::new(coverage.clone()).is_err());
        assert!(demo_suites(&coverage).is_err());
    }
}
