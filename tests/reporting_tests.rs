//! Integration tests for report aggregation, formatters and shard merge

mod common;

use common::run_tree;
use specula::config::RunnerConfig;
use specula::coverage::{CoverageSnapshot, CoverageTracker, FunctionRange, LineAnalysis};
use specula::error::{Error, TestError};
use specula::reporting::{self, FormatOptions, FormatterRegistry, StandardReportData, TestStatus};
use specula::suite::TestOptions;

fn sample_run() -> specula::runner::RunReport {
    run_tree(|d| {
        d.describe("math", |d| {
            d.it("adds", || Ok(()));
            d.it("compares <tags>", || {
                Err(TestError::assertion("expected \"a\" & got b").with_location("math.rs:7"))
            });
            d.it("connects", || Err(TestError::raised("refused")));
            d.xit("later", || Ok(()));
        });
        d.it_async_with("slow", TestOptions::new().timeout(10), |ctx| async move {
            ctx.sleep(100).await;
            Ok(())
        });
    })
}

fn sample_coverage() -> CoverageSnapshot {
    let mut tracker = CoverageTracker::new();
    tracker.seed_file(
        "src/calc.lua",
        &LineAnalysis::new([1, 2, 3, 5])
            .with_function(FunctionRange::new("add", 1, 3))
            .with_function(FunctionRange::new("sub", 5, 5)),
    );
    tracker.record_function_entry("src/calc.lua", "add:1").unwrap();
    tracker.record_line_hit("src/calc.lua", 1).unwrap();
    tracker.record_line_hit("src/calc.lua", 2).unwrap();
    tracker.record_line_hit("src/calc.lua", 2).unwrap();
    tracker.mark_validated("src/calc.lua", 2).unwrap();
    tracker.snapshot()
}

fn render(name: &str, data: &StandardReportData) -> String {
    FormatterRegistry::with_builtins()
        .format(name, data, &FormatOptions::default())
        .unwrap()
}

mod aggregate {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_test_results_section() {
        let run = sample_run();
        let data = reporting::aggregate(Some(&run), None);
        let tests = data.test_results.as_ref().unwrap();

        assert_eq!(tests.suite_name, RunnerConfig::default().suite_name);
        assert_eq!(
            (tests.total, tests.passed, tests.failed, tests.errored, tests.skipped, tests.timed_out),
            (5, 1, 1, 1, 2, 1)
        );
        let statuses: Vec<_> = tests.test_cases.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                TestStatus::Pass,
                TestStatus::Fail,
                TestStatus::Error,
                TestStatus::Skipped,
                TestStatus::Skipped
            ]
        );
        assert_eq!(tests.test_cases[1].classname, "math");
        assert_eq!(tests.test_cases[1].detail.as_deref(), Some("math.rs:7"));
        assert!(data.coverage.is_none());
        assert_eq!(data.exit_code(), 1);
    }

    #[test]
    fn test_coverage_section_only() {
        let data = reporting::aggregate(None, Some(&sample_coverage()));
        assert!(data.test_results.is_none());
        let coverage = data.coverage.as_ref().unwrap();
        assert_eq!(coverage.summary.executable_lines, 4);
        assert_eq!(coverage.summary.covered_lines, 2);
        assert_eq!(coverage.summary.line_coverage_percent, 50.0);
        assert_eq!(data.exit_code(), 0);
    }
}

mod formats {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_junit_distinguishes_failure_and_error() {
        let data = reporting::aggregate(Some(&sample_run()), None);
        let xml = render("junit", &data);

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("tests=\"5\" failures=\"1\" errors=\"1\" skipped=\"2\""));
        assert!(xml.contains("<testcase name=\"compares &lt;tags&gt;\" classname=\"math\""));
        assert!(xml.contains(
            "<failure message=\"expected &quot;a&quot; &amp; got b\" type=\"AssertionFailure\">math.rs:7</failure>"
        ));
        assert!(xml.contains("<error message=\"refused\" type=\"Error\">"));
        assert!(xml.contains("<skipped message=\"skipped by xit/xdescribe\"/>"));
        assert!(xml.contains("<testcase name=\"slow\" classname=\"root\" time=\"0.010\">"));
        assert!(xml.trim_end().ends_with("</testsuites>"));
    }

    #[test]
    fn test_tap_plan_and_directives() {
        let data = reporting::aggregate(Some(&sample_run()), None);
        let tap = render("tap", &data);
        let lines: Vec<&str> = tap.lines().collect();

        assert_eq!(lines[0], "TAP version 13");
        assert_eq!(lines[1], "1..5");
        assert_eq!(lines[2], "ok 1 - math > adds");
        assert_eq!(lines[3], "not ok 2 - math > compares <tags>");
        assert!(tap.contains("ok 4 - math > later # SKIP skipped by xit/xdescribe"));
        assert!(tap.contains("severity: error"));
    }

    #[test]
    fn test_lcov_records() {
        let data = reporting::aggregate(None, Some(&sample_coverage()));
        let lcov = render("lcov", &data);
        assert_eq!(
            lcov,
            "TN:\n\
             SF:src/calc.lua\n\
             FN:1,add\n\
             FN:5,sub\n\
             FNDA:1,add\n\
             FNDA:0,sub\n\
             FNF:2\n\
             FNH:1\n\
             DA:1,1\n\
             DA:2,2\n\
             DA:3,0\n\
             DA:5,0\n\
             LF:4\n\
             LH:2\n\
             end_of_record\n"
        );
    }

    #[test]
    fn test_cobertura_rates() {
        let data = reporting::aggregate(None, Some(&sample_coverage()));
        let xml = render("cobertura", &data);
        assert!(xml.contains("<coverage line-rate=\"0.5000\""));
        assert!(xml.contains("lines-covered=\"2\" lines-valid=\"4\""));
        assert!(xml.contains("<class name=\"src/calc.lua\" filename=\"src/calc.lua\" line-rate=\"0.5000\""));
        assert!(xml.contains("<method name=\"add\" signature=\"\" line-rate=\"0.6667\""));
        assert!(xml.contains("<line number=\"2\" hits=\"2\" branch=\"false\"/>"));
    }

    #[test]
    fn test_cobertura_tolerates_inverted_function_range() {
        let mut tracker = CoverageTracker::new();
        tracker.seed_file(
            "src/odd.lua",
            &LineAnalysis::new([1, 2, 3]).with_function(FunctionRange::new("backwards", 3, 1)),
        );
        tracker.record_line_hit("src/odd.lua", 1).unwrap();
        let data = reporting::aggregate(None, Some(&tracker.snapshot()));

        let xml = FormatterRegistry::with_builtins()
            .format("cobertura", &data, &FormatOptions::default())
            .unwrap();
        assert!(xml.contains(
            "<method name=\"backwards\" signature=\"\" line-rate=\"0.0000\" branch-rate=\"0\" complexity=\"0\">\n              <lines>\n              </lines>"
        ));
        assert!(xml.contains("<line number=\"1\" hits=\"1\" branch=\"false\"/>"));
    }

    #[test]
    fn test_csv_quotes_fields() {
        let data = reporting::aggregate(Some(&sample_run()), Some(&sample_coverage()));
        let csv = render("csv", &data);
        let mut sections = csv.split("\n\n");
        let tests = sections.next().unwrap();
        let coverage = sections.next().unwrap();

        assert!(tests.starts_with("classname,name,status,duration_ms,message\n"));
        assert!(tests.contains("math,compares <tags>,fail,0,\"expected \"\"a\"\" & got b\""));
        assert!(coverage.starts_with("file,executable_lines,covered_lines,validated_lines"));
        assert!(coverage.contains("src/calc.lua,4,2,1,50.00,2,1,50.00"));
    }

    #[test]
    fn test_markdown_and_html_cover_both_sections() {
        let data = reporting::aggregate(Some(&sample_run()), Some(&sample_coverage()));
        let md = render("markdown", &data);
        assert!(md.starts_with("## specula\n"));
        assert!(md.contains("| Failed | 1 |"));
        assert!(md.contains("- **[fail]** math > compares <tags>:"));
        assert!(md.contains("| src/calc.lua | 50.0% (2/4) | 1 | 50.0% (1/2) |"));

        let html = render("html", &data);
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>specula</title>"));
        assert!(html.contains("math &gt; compares &lt;tags&gt;"));
        assert!(html.contains("<div class=\"pass-rate\">50.00%</div>"));
    }

    #[test]
    fn test_json_round_trips_through_merge_input() {
        let data = reporting::aggregate(Some(&sample_run()), Some(&sample_coverage()));
        let compact = FormatterRegistry::with_builtins()
            .format(
                "json",
                &data,
                &FormatOptions {
                    pretty: false,
                    ..FormatOptions::default()
                },
            )
            .unwrap();
        assert!(!compact.contains('\n'));
        assert_eq!(StandardReportData::from_json(&compact).unwrap(), data);
    }

    #[test]
    fn test_title_option_and_custom_formatter() {
        let mut registry = FormatterRegistry::with_builtins();
        registry.register_formatter("summary", |data: &StandardReportData, opts: &FormatOptions| {
            let tests = data
                .test_results
                .as_ref()
                .ok_or_else(|| Error::Format("no tests".into()))?;
            Ok(format!(
                "{}: {}/{}",
                opts.title.as_deref().unwrap_or("-"),
                tests.passed,
                tests.total
            ))
        });
        let data = reporting::aggregate(Some(&sample_run()), None);
        let options = FormatOptions {
            title: Some("nightly".into()),
            ..FormatOptions::default()
        };
        assert_eq!(registry.format("summary", &data, &options).unwrap(), "nightly: 1/5");
        assert!(registry.format("summary", &StandardReportData::default(), &options).is_err());
        assert!(registry.names().contains(&"summary"));
    }
}

mod shards {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn test_merge_shard_files() {
        let dir = tempfile::tempdir().unwrap();

        let first = reporting::aggregate(Some(&sample_run()), Some(&sample_coverage()));
        let second_run = run_tree(|d| d.it("extra", || Ok(())));
        let mut tracker = CoverageTracker::new();
        tracker.seed_file("src/calc.lua", &LineAnalysis::new([1, 2, 3, 5]));
        tracker.record_line_hit("src/calc.lua", 3).unwrap();
        let second = reporting::aggregate(Some(&second_run), Some(&tracker.snapshot()));

        let registry = FormatterRegistry::with_builtins();
        let mut paths = Vec::new();
        for (i, shard) in [&first, &second].iter().enumerate() {
            let path = dir.path().join(format!("shard-{}.json", i));
            fs::write(&path, registry.format("json", shard, &FormatOptions::default()).unwrap()).unwrap();
            paths.push(path);
        }

        let merged = paths
            .iter()
            .map(|p| StandardReportData::from_json(&fs::read_to_string(p).unwrap()).unwrap())
            .reduce(|acc, shard| acc.merge(&shard))
            .unwrap();

        let tests = merged.test_results.as_ref().unwrap();
        assert_eq!((tests.total, tests.passed, tests.failed), (6, 2, 1));
        assert_eq!(tests.test_cases.last().map(|c| c.name.as_str()), Some("extra"));

        let coverage = merged.coverage.as_ref().unwrap();
        assert_eq!(coverage.summary.executable_lines, 4);
        assert_eq!(coverage.summary.covered_lines, 3);
        assert_eq!(coverage.summary.line_coverage_percent, 75.0);
        assert_eq!(merged.exit_code(), 1);
    }
}
