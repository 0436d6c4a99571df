//! Runner configuration
//!
//! Configuration is resolved in this order (later wins):
//! 1. Built-in defaults
//! 2. A JSON file (`--config PATH`, or `./specula.json` when present)
//! 3. `SPECULA_*` environment variables

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scheduler::{ClockMode, SchedulerConfig};
use crate::suite::filter::TestFilter;

/// Project-local config file picked up by [`RunnerConfig::load`].
pub const DEFAULT_CONFIG_FILE: &str = "specula.json";

/// Coverage collection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Whether the driver seeds and collects coverage.
    pub enabled: bool,
    /// Minimum overall line coverage percentage (0.0 means disabled).
    pub threshold_percent: f64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_percent: 0.0,
        }
    }
}

/// Configuration for a test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Timeout applied to tests that do not set their own.
    pub default_timeout_ms: u64,
    /// Default poll interval for `wait_until`.
    pub poll_interval_ms: u64,
    /// Clock driving timers and deadlines.
    pub clock: ClockMode,
    /// Only tests whose name path contains this string run.
    pub filter: Option<String>,
    /// When non-empty, a test must carry at least one of these tags.
    pub include_tags: Vec<String>,
    /// A test carrying any of these tags is skipped.
    pub exclude_tags: Vec<String>,
    /// Count timed-out tests against the exit code.
    pub strict_timeouts: bool,
    pub coverage: CoverageConfig,
    /// Name used for the test-suite section of reports.
    pub suite_name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            poll_interval_ms: 10,
            clock: ClockMode::Virtual,
            filter: None,
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            strict_timeouts: false,
            coverage: CoverageConfig::default(),
            suite_name: "specula".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Load from an explicit path, or from `./specula.json` if it exists,
    /// falling back to defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        let config = base.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply `SPECULA_*` environment overrides.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = lookup("SPECULA_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.default_timeout_ms = ms;
        }
        if let Some(ms) = lookup("SPECULA_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.poll_interval_ms = ms;
        }
        if let Some(clock) = lookup("SPECULA_CLOCK") {
            match clock.to_ascii_lowercase().as_str() {
                "virtual" => self.clock = ClockMode::Virtual,
                "wall" => self.clock = ClockMode::Wall,
                other => tracing::warn!(value = other, "ignoring unknown SPECULA_CLOCK"),
            }
        }
        if let Some(filter) = lookup("SPECULA_FILTER") {
            self.filter = if filter.is_empty() { None } else { Some(filter) };
        }
        self
    }

    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(Error::Config("default_timeout_ms must be greater than 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be greater than 0".into()));
        }
        let t = self.coverage.threshold_percent;
        if !(0.0..=100.0).contains(&t) {
            return Err(Error::Config(format!(
                "coverage.threshold_percent must be within 0..=100, got {}",
                t
            )));
        }
        Ok(())
    }

    /// Scheduler settings derived from this config.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            clock: self.clock,
            poll_interval_ms: self.poll_interval_ms,
            ..SchedulerConfig::default()
        }
    }

    /// Eligibility filter derived from this config.
    pub fn test_filter(&self) -> TestFilter {
        TestFilter {
            include_tags: self.include_tags.iter().cloned().collect(),
            exclude_tags: self.exclude_tags.iter().cloned().collect(),
            name_pattern: self.filter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.default_timeout_ms, 5_000);
        assert_eq!(cfg.poll_interval_ms, 10);
        assert_eq!(cfg.clock, ClockMode::Virtual);
        assert!(cfg.filter.is_none());
        assert!(!cfg.coverage.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = RunnerConfig::from_json(
            r#"{ "default_timeout_ms": 250, "clock": "wall", "coverage": { "enabled": true } }"#,
        )
        .unwrap();
        assert_eq!(cfg.default_timeout_ms, 250);
        assert_eq!(cfg.clock, ClockMode::Wall);
        assert!(cfg.coverage.enabled);
        assert_eq!(cfg.coverage.threshold_percent, 0.0);
        assert_eq!(cfg.poll_interval_ms, 10);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SPECULA_TIMEOUT_MS", "75"),
            ("SPECULA_CLOCK", "WALL"),
            ("SPECULA_FILTER", "math"),
            ("SPECULA_POLL_INTERVAL_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let cfg = RunnerConfig::default()
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.default_timeout_ms, 75);
        assert_eq!(cfg.clock, ClockMode::Wall);
        assert_eq!(cfg.filter.as_deref(), Some("math"));
        assert_eq!(cfg.poll_interval_ms, 10);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = RunnerConfig {
            default_timeout_ms: 0,
            ..RunnerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = RunnerConfig::default();
        cfg.coverage.threshold_percent = 120.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_derived_filter() {
        let cfg = RunnerConfig {
            include_tags: vec!["fast".into()],
            exclude_tags: vec!["slow".into()],
            filter: Some("parser".into()),
            ..RunnerConfig::default()
        };
        let filter = cfg.test_filter();
        assert!(filter.include_tags.contains("fast"));
        assert!(filter.exclude_tags.contains("slow"));
        assert_eq!(filter.name_pattern.as_deref(), Some("parser"));
    }
}
