//! Setup/teardown hooks and their scope chains
//!
//! For a test owned by suite `S`, the chain is the ancestor path
//! `root → … → S`. Before-hooks run root-to-leaf, after-hooks leaf-to-root;
//! within one suite, hooks always run in declaration order.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::scheduler::{Scheduler, TaskOutcome};
use crate::suite::{Callback, SuiteId, SuiteTree, TestId};

/// Which side of a test a hook runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Before,
    After,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Before => write!(f, "before_each"),
            HookKind::After => write!(f, "after_each"),
        }
    }
}

/// A registered hook, owned by the suite it was declared in.
#[derive(Debug)]
pub struct Hook {
    pub kind: HookKind,
    pub scope: SuiteId,
    pub callback: Callback,
}

/// A hook that failed while running for a particular test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailure {
    pub kind: HookKind,
    /// Name of the suite that declared the hook.
    pub suite: String,
    pub message: String,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hook in '{}' failed: {}", self.kind, self.suite, self.message)
    }
}

/// Before-hooks applying to `test`, in execution order.
pub fn before_chain(tree: &SuiteTree, test: TestId) -> Vec<&Hook> {
    tree.ancestors(tree.test(test).suite)
        .into_iter()
        .flat_map(|s| tree.suite(s).before_hooks.iter())
        .collect()
}

/// After-hooks applying to `test`, in execution order.
pub fn after_chain(tree: &SuiteTree, test: TestId) -> Vec<&Hook> {
    tree.ancestors(tree.test(test).suite)
        .into_iter()
        .rev()
        .flat_map(|s| tree.suite(s).after_hooks.iter())
        .collect()
}

/// Run every hook in `chain`, even after one fails, and collect failures.
pub fn run_chain(
    tree: &SuiteTree,
    chain: &[&Hook],
    scheduler: &mut Scheduler,
    timeout: Option<Duration>,
) -> Vec<HookFailure> {
    let mut failures = Vec::new();
    for hook in chain {
        let suite = &tree.suite(hook.scope).name;
        let name = format!("{} ({})", hook.kind, suite);
        let message = match hook.callback.invoke(scheduler, &name, timeout) {
            TaskOutcome::Returned(Ok(())) => continue,
            TaskOutcome::Returned(Err(e)) => e.message().to_string(),
            TaskOutcome::TimedOut { elapsed_ms } => format!("timed out after {} ms", elapsed_ms),
            TaskOutcome::Stalled => "stalled with nothing left to wake it".to_string(),
        };
        let failure = HookFailure {
            kind: hook.kind,
            suite: suite.clone(),
            message,
        };
        warn!(%failure, "hook failed");
        failures.push(failure);
    }
    failures
}
