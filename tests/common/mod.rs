//! Shared test helpers for integration tests
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use specula::config::RunnerConfig;
use specula::error::TestError;
use specula::runner::{RunReport, SuiteRunner};
use specula::scheduler::TaskResult;
use specula::suite::{Declarator, SuiteTree};

/// Declare a tree and run it with the default config.
pub fn run_tree<F>(body: F) -> RunReport
where
    F: FnOnce(&mut Declarator),
{
    run_tree_with(RunnerConfig::default(), body)
}

pub fn run_tree_with<F>(config: RunnerConfig, body: F) -> RunReport
where
    F: FnOnce(&mut Declarator),
{
    let tree = SuiteTree::declare(body).expect("declaration failed");
    SuiteRunner::new(config).run(&tree)
}

/// Append-only event log shared between hooks and bodies.
#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    /// Closure that appends `entry` and succeeds.
    pub fn recorder(&self, entry: &str) -> impl Fn() -> TaskResult + 'static {
        let log = self.clone();
        let entry = entry.to_string();
        move || {
            log.push(entry.clone());
            Ok(())
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.borrow().iter().filter(|e| *e == entry).count()
    }
}

pub fn ensure(cond: bool, message: &str) -> TaskResult {
    if cond {
        Ok(())
    } else {
        Err(TestError::assertion(message))
    }
}
