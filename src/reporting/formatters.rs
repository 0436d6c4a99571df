//! Report formatters
//!
//! A formatter is a pure function `(StandardReportData, FormatOptions) ->
//! String`. The registry maps names to formatters and ships with `json`,
//! `junit`, `tap`, `csv`, `lcov`, `cobertura`, `markdown` and `html`.
//!
//! ```
//! use specula::reporting::{FormatOptions, FormatterRegistry, StandardReportData};
//!
//! let mut registry = FormatterRegistry::with_builtins();
//! registry.register_formatter("count", |data: &StandardReportData, _opts: &FormatOptions| {
//!     Ok(data.test_results.as_ref().map_or(0, |t| t.total).to_string())
//! });
//! let out = registry.format("count", &StandardReportData::default(), &FormatOptions::default());
//! assert_eq!(out.unwrap(), "0");
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::coverage::summary::percent;
use crate::coverage::CoverageFile;
use crate::error::{Error, Result};

use super::{CoverageData, StandardReportData, TestResultsData, TestStatus};

/// Options shared by every formatter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// Report title; defaults to the suite name.
    pub title: Option<String>,
    /// Human-friendly layout where the format allows it.
    pub pretty: bool,
    /// Formatter-specific settings.
    pub extra: BTreeMap<String, String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            title: None,
            pretty: true,
            extra: BTreeMap::new(),
        }
    }
}

impl FormatOptions {
    fn title_for(&self, data: &StandardReportData) -> String {
        self.title
            .clone()
            .or_else(|| data.test_results.as_ref().map(|t| t.suite_name.clone()))
            .unwrap_or_else(|| "specula".to_string())
    }
}

pub type FormatFn = Box<dyn Fn(&StandardReportData, &FormatOptions) -> Result<String>>;

// ---------------------------------------------------------------------------
// FormatterRegistry
// ---------------------------------------------------------------------------

/// Name → formatter mapping.
pub struct FormatterRegistry {
    formatters: BTreeMap<String, FormatFn>,
}

impl std::fmt::Debug for FormatterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatterRegistry")
            .field("formatters", &self.names())
            .finish()
    }
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FormatterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            formatters: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_formatter("json", format_json);
        registry.register_formatter("junit", format_junit);
        registry.register_formatter("tap", format_tap);
        registry.register_formatter("csv", format_csv);
        registry.register_formatter("lcov", format_lcov);
        registry.register_formatter("cobertura", format_cobertura);
        registry.register_formatter("markdown", format_markdown);
        registry.register_formatter("html", format_html);
        registry
    }

    /// Add a formatter, replacing any existing one of the same name.
    /// Returns whether a formatter was replaced.
    pub fn register_formatter<F>(&mut self, name: impl Into<String>, f: F) -> bool
    where
        F: Fn(&StandardReportData, &FormatOptions) -> Result<String> + 'static,
    {
        self.formatters.insert(name.into(), Box::new(f)).is_some()
    }

    pub fn format(&self, name: &str, data: &StandardReportData, options: &FormatOptions) -> Result<String> {
        let formatter = self.formatters.get(name).ok_or_else(|| {
            Error::Format(format!(
                "unknown formatter '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        formatter(data, options)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formatters.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.formatters.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn require_tests<'a>(data: &'a StandardReportData, format: &str) -> Result<&'a TestResultsData> {
    data.test_results
        .as_ref()
        .ok_or_else(|| Error::Format(format!("{} output needs test results", format)))
}

fn require_coverage<'a>(data: &'a StandardReportData, format: &str) -> Result<&'a CoverageData> {
    data.coverage
        .as_ref()
        .ok_or_else(|| Error::Format(format!("{} output needs coverage data", format)))
}

/// Escape text for XML/HTML attribute and element content.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn escape_csv(s: &str) -> String {
    if s.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn seconds(ms: u64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

fn rate(covered: usize, total: usize) -> String {
    format!("{:.4}", percent(covered, total) / 100.0)
}

// ---------------------------------------------------------------------------
// Built-in formatters
// ---------------------------------------------------------------------------

pub fn format_json(data: &StandardReportData, options: &FormatOptions) -> Result<String> {
    let text = if options.pretty {
        serde_json::to_string_pretty(data)?
    } else {
        serde_json::to_string(data)?
    };
    Ok(text)
}

pub fn format_junit(data: &StandardReportData, options: &FormatOptions) -> Result<String> {
    let tests = require_tests(data, "junit")?;
    let name = escape_xml(&options.title_for(data));
    let mut s = String::new();
    s.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        s,
        "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{}\">",
        name,
        tests.total,
        tests.failed,
        tests.errored,
        tests.skipped,
        seconds(tests.elapsed_ms)
    );
    let _ = writeln!(
        s,
        "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{}\" timestamp=\"{}\">",
        name,
        tests.total,
        tests.failed,
        tests.errored,
        tests.skipped,
        seconds(tests.elapsed_ms),
        tests.timestamp.format("%Y-%m-%dT%H:%M:%S")
    );

    for case in &tests.test_cases {
        let open = format!(
            "    <testcase name=\"{}\" classname=\"{}\" time=\"{}\"",
            escape_xml(&case.name),
            escape_xml(&case.classname),
            seconds(case.duration_ms)
        );
        let message = escape_xml(case.message.as_deref().unwrap_or(""));
        let detail = escape_xml(case.detail.as_deref().unwrap_or(""));
        match case.status {
            TestStatus::Pass => {
                let _ = writeln!(s, "{}/>", open);
            }
            TestStatus::Skipped => {
                let _ = writeln!(s, "{}>\n      <skipped message=\"{}\"/>\n    </testcase>", open, message);
            }
            TestStatus::Fail => {
                let _ = writeln!(
                    s,
                    "{}>\n      <failure message=\"{}\" type=\"AssertionFailure\">{}</failure>\n    </testcase>",
                    open, message, detail
                );
            }
            TestStatus::Error => {
                let _ = writeln!(
                    s,
                    "{}>\n      <error message=\"{}\" type=\"Error\">{}</error>\n    </testcase>",
                    open, message, detail
                );
            }
        }
    }

    s.push_str("  </testsuite>\n</testsuites>\n");
    Ok(s)
}

pub fn format_tap(data: &StandardReportData, _options: &FormatOptions) -> Result<String> {
    let tests = require_tests(data, "tap")?;
    let mut s = String::from("TAP version 13\n");
    let _ = writeln!(s, "1..{}", tests.test_cases.len());
    for (i, case) in tests.test_cases.iter().enumerate() {
        let n = i + 1;
        match case.status {
            TestStatus::Pass => {
                let _ = writeln!(s, "ok {} - {}", n, case.full_name);
            }
            TestStatus::Skipped => {
                let _ = writeln!(
                    s,
                    "ok {} - {} # SKIP {}",
                    n,
                    case.full_name,
                    case.message.as_deref().unwrap_or("")
                );
            }
            TestStatus::Fail | TestStatus::Error => {
                let _ = writeln!(s, "not ok {} - {}", n, case.full_name);
                s.push_str("  ---\n");
                let message = case.message.as_deref().unwrap_or("");
                let _ = writeln!(s, "  message: {}", serde_json::to_string(message)?);
                let _ = writeln!(s, "  severity: {}", case.status);
                if let Some(detail) = &case.detail {
                    let _ = writeln!(s, "  at: {}", serde_json::to_string(detail)?);
                }
                s.push_str("  ...\n");
            }
        }
    }
    Ok(s)
}

pub fn format_csv(data: &StandardReportData, _options: &FormatOptions) -> Result<String> {
    if data.test_results.is_none() && data.coverage.is_none() {
        return Err(Error::Format("csv output needs test results or coverage data".into()));
    }
    let mut s = String::new();
    if let Some(tests) = &data.test_results {
        s.push_str("classname,name,status,duration_ms,message\n");
        for case in &tests.test_cases {
            let _ = writeln!(
                s,
                "{},{},{},{},{}",
                escape_csv(&case.classname),
                escape_csv(&case.name),
                case.status,
                case.duration_ms,
                escape_csv(case.message.as_deref().unwrap_or(""))
            );
        }
    }
    if let Some(coverage) = &data.coverage {
        if !s.is_empty() {
            s.push('\n');
        }
        s.push_str("file,executable_lines,covered_lines,validated_lines,line_coverage_percent,total_functions,covered_functions,function_coverage_percent\n");
        for f in &coverage.summary.files {
            let _ = writeln!(
                s,
                "{},{},{},{},{:.2},{},{},{:.2}",
                escape_csv(&f.path),
                f.executable_lines,
                f.covered_lines,
                f.validated_lines,
                f.line_coverage_percent,
                f.total_functions,
                f.covered_functions,
                f.function_coverage_percent
            );
        }
    }
    Ok(s)
}

fn lcov_record(s: &mut String, test_name: &str, file: &CoverageFile) {
    let _ = writeln!(s, "TN:{}", test_name);
    let _ = writeln!(s, "SF:{}", file.path);

    let mut functions: Vec<_> = file.function_records.values().collect();
    functions.sort_by_key(|f| (f.start_line, f.name.clone()));
    for func in &functions {
        let _ = writeln!(s, "FN:{},{}", func.start_line, func.name);
    }
    for func in &functions {
        let _ = writeln!(s, "FNDA:{},{}", func.execution_count, func.name);
    }
    let _ = writeln!(s, "FNF:{}", functions.len());
    let _ = writeln!(s, "FNH:{}", functions.iter().filter(|f| f.execution_count > 0).count());

    for (line, record) in &file.line_records {
        let _ = writeln!(s, "DA:{},{}", line, record.execution_count);
    }
    let _ = writeln!(s, "LF:{}", file.line_records.len());
    let _ = writeln!(
        s,
        "LH:{}",
        file.line_records.values().filter(|r| r.execution_count > 0).count()
    );
    s.push_str("end_of_record\n");
}

pub fn format_lcov(data: &StandardReportData, options: &FormatOptions) -> Result<String> {
    let coverage = require_coverage(data, "lcov")?;
    let test_name = options.title.clone().unwrap_or_default();
    let mut s = String::new();
    for file in &coverage.files {
        lcov_record(&mut s, &test_name, file);
    }
    Ok(s)
}

pub fn format_cobertura(data: &StandardReportData, options: &FormatOptions) -> Result<String> {
    let coverage = require_coverage(data, "cobertura")?;
    let summary = &coverage.summary;
    let timestamp_ms = data.test_results.as_ref().map_or(0, |t| t.timestamp.timestamp_millis());

    let mut s = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        s,
        "<coverage line-rate=\"{}\" branch-rate=\"0\" lines-covered=\"{}\" lines-valid=\"{}\" branches-covered=\"0\" branches-valid=\"0\" complexity=\"0\" version=\"{}\" timestamp=\"{}\">",
        rate(summary.covered_lines, summary.executable_lines),
        summary.covered_lines,
        summary.executable_lines,
        crate::VERSION,
        timestamp_ms
    );
    let _ = writeln!(s, "  <sources>\n    <source>.</source>\n  </sources>");
    let _ = writeln!(
        s,
        "  <packages>\n    <package name=\"{}\" line-rate=\"{}\" branch-rate=\"0\" complexity=\"0\">\n      <classes>",
        escape_xml(&options.title_for(data)),
        rate(summary.covered_lines, summary.executable_lines)
    );

    for file in &coverage.files {
        let covered = file.line_records.values().filter(|r| r.execution_count > 0).count();
        let path = escape_xml(&file.path);
        let _ = writeln!(
            s,
            "        <class name=\"{}\" filename=\"{}\" line-rate=\"{}\" branch-rate=\"0\" complexity=\"0\">",
            path,
            path,
            rate(covered, file.line_records.len())
        );
        s.push_str("          <methods>\n");
        for func in file.function_records.values() {
            // Inverted ranges cover no lines.
            let lines: Vec<_> = if func.start_line <= func.end_line {
                file.line_records.range(func.start_line..=func.end_line).collect()
            } else {
                Vec::new()
            };
            let hit = lines.iter().filter(|(_, r)| r.execution_count > 0).count();
            let _ = writeln!(
                s,
                "            <method name=\"{}\" signature=\"\" line-rate=\"{}\" branch-rate=\"0\" complexity=\"0\">",
                escape_xml(&func.name),
                rate(hit, lines.len())
            );
            s.push_str("              <lines>\n");
            for (line, record) in &lines {
                let _ = writeln!(
                    s,
                    "                <line number=\"{}\" hits=\"{}\" branch=\"false\"/>",
                    line, record.execution_count
                );
            }
            s.push_str("              </lines>\n            </method>\n");
        }
        s.push_str("          </methods>\n          <lines>\n");
        for (line, record) in &file.line_records {
            let _ = writeln!(
                s,
                "            <line number=\"{}\" hits=\"{}\" branch=\"false\"/>",
                line, record.execution_count
            );
        }
        s.push_str("          </lines>\n        </class>\n");
    }

    s.push_str("      </classes>\n    </package>\n  </packages>\n</coverage>\n");
    Ok(s)
}

pub fn format_markdown(data: &StandardReportData, options: &FormatOptions) -> Result<String> {
    let mut s = String::new();
    let _ = writeln!(s, "## {}\n", options.title_for(data));

    if let Some(tests) = &data.test_results {
        s.push_str("### Tests\n\n");
        let _ = writeln!(
            s,
            "| Metric | Count |\n|--------|-------|\n| Total | {} |\n| Passed | {} |\n| Failed | {} |\n| Errored | {} |\n| Skipped | {} |\n| Timed Out | {} |\n| **Duration** | **{} ms** |\n",
            tests.total,
            tests.passed,
            tests.failed,
            tests.errored,
            tests.skipped,
            tests.timed_out,
            tests.elapsed_ms,
        );

        let problems: Vec<_> = tests
            .test_cases
            .iter()
            .filter(|c| matches!(c.status, TestStatus::Fail | TestStatus::Error))
            .collect();
        if !problems.is_empty() {
            s.push_str("#### Failures\n\n");
            for case in problems {
                let _ = writeln!(
                    s,
                    "- **[{}]** {}: {}",
                    case.status,
                    case.full_name,
                    case.message.as_deref().unwrap_or("")
                );
            }
            s.push('\n');
        }
    }

    if let Some(coverage) = &data.coverage {
        let summary = &coverage.summary;
        s.push_str("### Coverage\n\n");
        s.push_str("| File | Lines | Validated | Functions |\n|------|-------|-----------|-----------|\n");
        for f in &summary.files {
            let _ = writeln!(
                s,
                "| {} | {:.1}% ({}/{}) | {} | {:.1}% ({}/{}) |",
                f.path,
                f.line_coverage_percent,
                f.covered_lines,
                f.executable_lines,
                f.validated_lines,
                f.function_coverage_percent,
                f.covered_functions,
                f.total_functions
            );
        }
        let _ = writeln!(
            s,
            "| **Total** | **{:.2}%** ({}/{}) | {} | **{:.2}%** ({}/{}) |\n",
            summary.line_coverage_percent,
            summary.covered_lines,
            summary.executable_lines,
            summary.validated_lines,
            summary.function_coverage_percent,
            summary.covered_functions,
            summary.total_functions
        );
    }

    Ok(s)
}

pub fn format_html(data: &StandardReportData, options: &FormatOptions) -> Result<String> {
    let title = escape_xml(&options.title_for(data));

    let tests_html = match &data.test_results {
        Some(tests) => {
            let mut rows = String::new();
            for case in &tests.test_cases {
                let _ = writeln!(
                    rows,
                    "<tr class=\"status-{}\"><td>{}</td><td>{}</td><td>{} ms</td><td>{}</td></tr>",
                    case.status,
                    escape_xml(&case.full_name),
                    case.status,
                    case.duration_ms,
                    escape_xml(case.message.as_deref().unwrap_or(""))
                );
            }
            format!(
                "<div class=\"summary\">\
                <p>{} passed / {} total ({} failed, {} errored, {} skipped) in {} ms</p>\
                </div>\n\
                <table>\n<thead><tr><th>Test</th><th>Status</th><th>Duration</th><th>Message</th></tr></thead>\n\
                <tbody>\n{}</tbody>\n</table>",
                tests.passed, tests.total, tests.failed, tests.errored, tests.skipped, tests.elapsed_ms, rows
            )
        }
        None => String::new(),
    };

    let coverage_html = match &data.coverage {
        Some(coverage) => {
            let summary = &coverage.summary;
            let mut rows = String::new();
            for f in &summary.files {
                let _ = writeln!(
                    rows,
                    "<tr><td>{}</td><td>{:.1}%</td><td>{}/{}</td><td>{}</td><td>{:.1}%</td></tr>",
                    escape_xml(&f.path),
                    f.line_coverage_percent,
                    f.covered_lines,
                    f.executable_lines,
                    f.validated_lines,
                    f.function_coverage_percent
                );
            }
            format!(
                "<h2>Coverage</h2>\n<div class=\"pass-rate\">{:.2}%</div>\n\
                <table>\n<thead><tr><th>File</th><th>Lines</th><th>Covered</th><th>Validated</th><th>Functions</th></tr></thead>\n\
                <tbody>\n{}</tbody>\n</table>",
                summary.line_coverage_percent, rows
            )
        }
        None => String::new(),
    };

    Ok(format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
        <title>{title}</title>\n\
        <style>\n\
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; \
        margin: 0; padding: 20px; background: #f5f5f5; }}\n\
        .container {{ max-width: 1200px; margin: 0 auto; }}\n\
        .summary {{ background: white; padding: 20px; border-radius: 8px; margin-bottom: 20px; }}\n\
        .pass-rate {{ font-size: 48px; font-weight: bold; color: #2ea44f; }}\n\
        table {{ width: 100%; border-collapse: collapse; background: white; }}\n\
        th, td {{ padding: 12px 16px; text-align: left; border-bottom: 1px solid #eee; }}\n\
        .status-pass {{ color: #2ea44f; }}\n\
        .status-fail, .status-error {{ color: #cb2431; }}\n\
        .status-skipped {{ color: #d29922; }}\n\
        </style>\n</head>\n<body>\n<div class=\"container\">\n\
        <h1>{title}</h1>\n\
        {tests_html}\n\
        {coverage_html}\n\
        </div>\n</body>\n</html>\n"
    ))
}
