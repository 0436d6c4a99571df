//! Error types for specula

use std::fmt;
use thiserror::Error;

/// Main error type for specula
#[derive(Error, Debug)]
pub enum Error {
    /// The declaration phase could not build a suite tree
    #[error("DeclarationError: {0}")]
    Declaration(#[from] DeclarationError),

    /// Instrumentation referenced something the tracker was never seeded with
    #[error("CoverageError: {0}")]
    Coverage(#[from] CoverageError),

    /// Scheduler misuse (unknown task, task consumed twice, ...)
    #[error("SchedulerError: {0}")]
    Scheduler(String),

    /// Formatter lookup or rendering failure
    #[error("FormatError: {0}")]
    Format(String),

    /// Invalid configuration
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("JSONError: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for specula
pub type Result<T> = std::result::Result<T, Error>;

/// What kind of declaration an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationKind {
    Suite,
    Test,
}

impl fmt::Display for DeclarationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclarationKind::Suite => write!(f, "describe"),
            DeclarationKind::Test => write!(f, "it"),
        }
    }
}

/// Fatal problems found while declaring suites. Any of these aborts the
/// whole declaration phase; no test runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeclarationError {
    #[error("{kind} declared with an empty name (inside '{parent}')")]
    EmptyName {
        kind: DeclarationKind,
        parent: String,
    },

    #[error("test '{test}' declares a zero timeout")]
    InvalidTimeout { test: String },

    #[error("test '{test}' has an invalid error pattern: {message}")]
    InvalidErrorPattern { test: String, message: String },

    #[error("describe body for '{suite}' panicked: {message}")]
    BodyPanicked { suite: String, message: String },
}

/// Rejected instrumentation calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoverageError {
    #[error("file '{0}' was not seeded for coverage")]
    UnknownFile(String),

    #[error("line {line} of '{file}' is not an executable line")]
    UnknownLine { file: String, line: u32 },

    #[error("function '{function}' is not known in '{file}'")]
    UnknownFunction { file: String, function: String },
}

/// Error value produced by a test body or hook.
///
/// `Assertion` maps to a `Failed` outcome, `Raised` to `Errored`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TestError {
    #[error("{message}")]
    Assertion {
        message: String,
        location: Option<String>,
    },

    #[error("{message}")]
    Raised {
        message: String,
        stack: Option<String>,
    },
}

impl TestError {
    /// An assertion mismatch.
    pub fn assertion(message: impl Into<String>) -> Self {
        TestError::Assertion {
            message: message.into(),
            location: None,
        }
    }

    /// An unexpected error raised by the code under test.
    pub fn raised(message: impl Into<String>) -> Self {
        TestError::Raised {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a `file:line` location to an assertion failure.
    pub fn with_location(self, loc: impl Into<String>) -> Self {
        match self {
            TestError::Assertion { message, .. } => TestError::Assertion {
                message,
                location: Some(loc.into()),
            },
            other => other,
        }
    }

    /// Attach a stack/backtrace rendering to a raised error.
    pub fn with_stack(self, trace: impl Into<String>) -> Self {
        match self {
            TestError::Raised { message, .. } => TestError::Raised {
                message,
                stack: Some(trace.into()),
            },
            other => other,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TestError::Assertion { message, .. } | TestError::Raised { message, .. } => message,
        }
    }

    pub fn is_assertion(&self) -> bool {
        matches!(self, TestError::Assertion { .. })
    }

    /// Convert a caught panic payload into a raised error.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {}", s)
        } else {
            "panicked with a non-string payload".to_string()
        };
        TestError::raised(message)
    }
}

impl From<&str> for TestError {
    fn from(message: &str) -> Self {
        TestError::raised(message)
    }
}

impl From<String> for TestError {
    fn from(message: String) -> Self {
        TestError::raised(message)
    }
}

impl From<anyhow::Error> for TestError {
    fn from(err: anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let raised = TestError::raised(err.to_string());
        if chain.is_empty() {
            raised
        } else {
            raised.with_stack(chain.join("\n"))
        }
    }
}
