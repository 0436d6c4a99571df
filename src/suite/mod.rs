//! Suite tree and declaration phase
//!
//! Suites and tests live in a flat arena indexed by [`SuiteId`] and
//! [`TestId`]; each node keeps its parent's index as a non-owning back
//! reference. The tree is built in one synchronous pass by
//! [`SuiteTree::declare`] and is immutable afterwards.
//!
//! ```
//! use specula::suite::{SuiteTree, TestOptions};
//! use specula::error::TestError;
//!
//! let tree = SuiteTree::declare(|d| {
//!     d.describe("math", |d| {
//!         d.it("adds", || {
//!             if 1 + 1 == 2 { Ok(()) } else { Err(TestError::assertion("1 + 1 != 2")) }
//!         });
//!         d.xit("divides by zero", || Ok(()));
//!     });
//! })
//! .unwrap();
//! assert_eq!(tree.len(), 2);
//! ```

pub mod filter;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use regex::Regex;

use crate::error::{DeclarationError, DeclarationKind, TestError};
use crate::hooks::{Hook, HookKind};
use crate::scheduler::{LocalBoxFuture, Scheduler, TaskOutcome, TaskResult, TestContext};

/// Name of the implicit root suite.
pub const ROOT_SUITE_NAME: &str = "root";

/// Separator used when rendering a name path.
pub const PATH_SEPARATOR: &str = " > ";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Index of a suite in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuiteId(usize);

impl SuiteId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of a test in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(usize);

impl TestId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Declaration-time focus marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusMode {
    #[default]
    Normal,
    /// `fdescribe` / `fit`
    Focused,
    /// `xdescribe` / `xit`
    Skipped,
}

/// A suite's children, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Suite(SuiteId),
    Test(TestId),
}

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

pub type SyncBody = Box<dyn Fn() -> TaskResult>;
pub type AsyncBody = Box<dyn Fn(TestContext) -> LocalBoxFuture<'static, TaskResult>>;

/// A test body or hook.
pub enum Callback {
    /// Runs inline, to completion.
    Sync(SyncBody),
    /// Runs as a scheduler task and may suspend.
    Async(AsyncBody),
}

impl Callback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> TaskResult + 'static,
    {
        Callback::Sync(Box::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TestContext) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        Callback::Async(Box::new(move |ctx| Box::pin(f(ctx))))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Callback::Async(_))
    }

    /// Run to completion: sync callbacks inline, async ones as a scheduler
    /// task bounded by `timeout`. Panics become raised errors.
    pub fn invoke(&self, scheduler: &mut Scheduler, name: &str, timeout: Option<Duration>) -> TaskOutcome {
        match self {
            Callback::Sync(f) => match catch_unwind(AssertUnwindSafe(|| f())) {
                Ok(result) => TaskOutcome::Returned(result),
                Err(payload) => TaskOutcome::Returned(Err(TestError::from_panic(payload))),
            },
            Callback::Async(f) => {
                let ctx = scheduler.context();
                match catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                    Ok(future) => scheduler.block_on(name, future, timeout),
                    Err(payload) => TaskOutcome::Returned(Err(TestError::from_panic(payload))),
                }
            }
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Sync(_) => write!(f, "Callback::Sync(..)"),
            Callback::Async(_) => write!(f, "Callback::Async(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// TestOptions
// ---------------------------------------------------------------------------

/// How an expected error's message is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPattern {
    Substring(String),
    Regex(String),
}

/// Per-test configuration.
///
/// ```
/// use specula::suite::TestOptions;
///
/// let opts = TestOptions::new().timeout(250).matching("refused").tag("net");
/// assert!(opts.expect_error);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOptions {
    /// Overrides the run's default timeout.
    pub timeout_ms: Option<u64>,
    /// The body is expected to fail with an error.
    pub expect_error: bool,
    pub error_pattern: Option<ErrorPattern>,
    pub tags: BTreeSet<String>,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn expect_error(mut self) -> Self {
        self.expect_error = true;
        self
    }

    /// Expect an error whose message contains `needle`.
    pub fn matching(mut self, needle: impl Into<String>) -> Self {
        self.expect_error = true;
        self.error_pattern = Some(ErrorPattern::Substring(needle.into()));
        self
    }

    /// Expect an error whose message matches the regular expression `re`.
    pub fn matching_regex(mut self, re: impl Into<String>) -> Self {
        self.expect_error = true;
        self.error_pattern = Some(ErrorPattern::Regex(re.into()));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Compiled form of [`ErrorPattern`].
#[derive(Debug, Clone)]
pub enum ErrorMatcher {
    Substring(String),
    Pattern(Regex),
}

impl ErrorMatcher {
    pub fn is_match(&self, message: &str) -> bool {
        match self {
            ErrorMatcher::Substring(needle) => message.contains(needle.as_str()),
            ErrorMatcher::Pattern(re) => re.is_match(message),
        }
    }
}

impl fmt::Display for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::Substring(needle) => write!(f, "'{}'", needle),
            ErrorMatcher::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// SuiteNode / TestCase
// ---------------------------------------------------------------------------

/// One `describe` block, or the implicit root.
#[derive(Debug)]
pub struct SuiteNode {
    pub id: SuiteId,
    pub name: String,
    pub parent: Option<SuiteId>,
    pub entries: Vec<Entry>,
    pub tags: BTreeSet<String>,
    pub focus: FocusMode,
    pub before_hooks: Vec<Hook>,
    pub after_hooks: Vec<Hook>,
    pub is_async: bool,
}

impl SuiteNode {
    fn new(id: SuiteId, name: String, parent: Option<SuiteId>, focus: FocusMode, is_async: bool) -> Self {
        Self {
            id,
            name,
            parent,
            entries: Vec::new(),
            tags: BTreeSet::new(),
            focus,
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            is_async,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn children(&self) -> impl Iterator<Item = SuiteId> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Suite(id) => Some(*id),
            Entry::Test(_) => None,
        })
    }

    pub fn tests(&self) -> impl Iterator<Item = TestId> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Test(id) => Some(*id),
            Entry::Suite(_) => None,
        })
    }

    pub fn hooks(&self, kind: HookKind) -> &[Hook] {
        match kind {
            HookKind::Before => &self.before_hooks,
            HookKind::After => &self.after_hooks,
        }
    }
}

/// One `it` block.
#[derive(Debug)]
pub struct TestCase {
    pub id: TestId,
    pub name: String,
    pub suite: SuiteId,
    pub body: Callback,
    pub options: TestOptions,
    pub focus: FocusMode,
    /// Own tags plus every ancestor suite's tags.
    pub tags: BTreeSet<String>,
    pub matcher: Option<ErrorMatcher>,
}

impl TestCase {
    pub fn is_async(&self) -> bool {
        self.body.is_async()
    }
}

// ---------------------------------------------------------------------------
// SuiteTree
// ---------------------------------------------------------------------------

/// The declared suites and tests of one run.
#[derive(Debug)]
pub struct SuiteTree {
    suites: Vec<SuiteNode>,
    tests: Vec<TestCase>,
}

impl SuiteTree {
    /// Run the declaration phase with an implicit root named
    /// [`ROOT_SUITE_NAME`].
    pub fn declare<F>(body: F) -> Result<Self, DeclarationError>
    where
        F: FnOnce(&mut Declarator),
    {
        Self::declare_named(ROOT_SUITE_NAME, body)
    }

    /// Run the declaration phase with a named root.
    pub fn declare_named<F>(root: impl Into<String>, body: F) -> Result<Self, DeclarationError>
    where
        F: FnOnce(&mut Declarator),
    {
        let root = root.into();
        let mut d = Declarator::new(root.clone());
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| body(&mut d))) {
            d.fail(DeclarationError::BodyPanicked {
                suite: root,
                message: TestError::from_panic(payload).message().to_string(),
            });
        }
        d.finish()
    }

    pub fn root(&self) -> &SuiteNode {
        &self.suites[0]
    }

    pub fn suite(&self, id: SuiteId) -> &SuiteNode {
        &self.suites[id.0]
    }

    pub fn test(&self, id: TestId) -> &TestCase {
        &self.tests[id.0]
    }

    pub fn suites(&self) -> impl Iterator<Item = &SuiteNode> {
        self.suites.iter()
    }

    pub fn tests(&self) -> impl Iterator<Item = &TestCase> {
        self.tests.iter()
    }

    /// Number of declared tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Chain of suites from the root down to and including `id`.
    pub fn ancestors(&self, id: SuiteId) -> Vec<SuiteId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.suites[current.0].parent;
        }
        chain.reverse();
        chain
    }

    /// Suite names (root excluded) followed by the test name.
    pub fn name_path(&self, id: TestId) -> Vec<String> {
        let test = self.test(id);
        let mut path: Vec<String> = self
            .ancestors(test.suite)
            .into_iter()
            .skip(1)
            .map(|s| self.suites[s.0].name.clone())
            .collect();
        path.push(test.name.clone());
        path
    }

    pub fn display_name(&self, id: TestId) -> String {
        self.name_path(id).join(PATH_SEPARATOR)
    }

    /// Dotted suite path used as a report classname; the root name for
    /// top-level tests.
    pub fn classname(&self, id: TestId) -> String {
        let names: Vec<&str> = self
            .ancestors(self.test(id).suite)
            .into_iter()
            .skip(1)
            .map(|s| self.suites[s.0].name.as_str())
            .collect();
        if names.is_empty() {
            self.root().name.clone()
        } else {
            names.join(".")
        }
    }

    /// Every test in execution order: depth-first, declaration order.
    pub fn walk_tests(&self) -> Vec<TestId> {
        let mut out = Vec::with_capacity(self.tests.len());
        // Entries are pushed in reverse so they pop in declaration order.
        let mut pending: Vec<Entry> = self.root().entries.iter().rev().copied().collect();
        while let Some(entry) = pending.pop() {
            match entry {
                Entry::Test(t) => out.push(t),
                Entry::Suite(s) => pending.extend(self.suites[s.0].entries.iter().rev().copied()),
            }
        }
        out
    }

    /// Whether any suite or test is focused.
    pub fn has_focus(&self) -> bool {
        self.suites.iter().any(|s| s.focus == FocusMode::Focused)
            || self.tests.iter().any(|t| t.focus == FocusMode::Focused)
    }
}

// ---------------------------------------------------------------------------
// Declarator
// ---------------------------------------------------------------------------

/// Declaration context threaded through `describe` bodies.
///
/// The first error is kept and returned by [`SuiteTree::declare`]; calls
/// made after it are ignored.
pub struct Declarator {
    tree: SuiteTree,
    stack: Vec<SuiteId>,
    error: Option<DeclarationError>,
}

impl fmt::Debug for Declarator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declarator")
            .field("suites", &self.tree.suites.len())
            .field("tests", &self.tree.tests.len())
            .field("depth", &self.stack.len())
            .field("error", &self.error)
            .finish()
    }
}

impl Declarator {
    fn new(root: String) -> Self {
        let root_id = SuiteId(0);
        Self {
            tree: SuiteTree {
                suites: vec![SuiteNode::new(root_id, root, None, FocusMode::Normal, false)],
                tests: Vec::new(),
            },
            stack: vec![root_id],
            error: None,
        }
    }

    fn current(&self) -> SuiteId {
        self.stack.last().copied().unwrap_or(SuiteId(0))
    }

    fn current_name(&self) -> String {
        self.tree.suites[self.current().0].name.clone()
    }

    fn fail(&mut self, err: DeclarationError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn finish(mut self) -> Result<SuiteTree, DeclarationError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let mut tree = self.tree;
        for i in 0..tree.tests.len() {
            let inherited: Vec<String> = tree
                .ancestors(tree.tests[i].suite)
                .into_iter()
                .flat_map(|s| tree.suites[s.0].tags.iter().cloned())
                .collect();
            tree.tests[i].tags.extend(inherited);
        }
        Ok(tree)
    }

    // -- Suites ------------------------------------------------------------

    fn suite<F>(&mut self, name: String, focus: FocusMode, is_async: bool, body: F)
    where
        F: FnOnce(&mut Self),
    {
        if self.error.is_some() {
            return;
        }
        if name.trim().is_empty() {
            let parent = self.current_name();
            self.fail(DeclarationError::EmptyName {
                kind: DeclarationKind::Suite,
                parent,
            });
            return;
        }

        let parent = self.current();
        let id = SuiteId(self.tree.suites.len());
        self.tree
            .suites
            .push(SuiteNode::new(id, name.clone(), Some(parent), focus, is_async));
        self.tree.suites[parent.0].entries.push(Entry::Suite(id));

        self.stack.push(id);
        let result = catch_unwind(AssertUnwindSafe(|| body(self)));
        self.stack.pop();

        if let Err(payload) = result {
            self.fail(DeclarationError::BodyPanicked {
                suite: name,
                message: TestError::from_panic(payload).message().to_string(),
            });
        }
    }

    pub fn describe<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce(&mut Self),
    {
        self.suite(name.into(), FocusMode::Normal, false, body);
    }

    pub fn fdescribe<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce(&mut Self),
    {
        self.suite(name.into(), FocusMode::Focused, false, body);
    }

    pub fn xdescribe<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce(&mut Self),
    {
        self.suite(name.into(), FocusMode::Skipped, false, body);
    }

    /// Like [`describe`](Self::describe), but marks the suite async.
    pub fn describe_async<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce(&mut Self),
    {
        self.suite(name.into(), FocusMode::Normal, true, body);
    }

    /// Add tags to the suite currently being declared.
    pub fn tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let current = self.current();
        self.tree.suites[current.0]
            .tags
            .extend(tags.into_iter().map(Into::into));
    }

    // -- Tests -------------------------------------------------------------

    fn test(&mut self, name: String, options: TestOptions, focus: FocusMode, body: Callback) {
        if self.error.is_some() {
            return;
        }
        if name.trim().is_empty() {
            let parent = self.current_name();
            self.fail(DeclarationError::EmptyName {
                kind: DeclarationKind::Test,
                parent,
            });
            return;
        }
        if options.timeout_ms == Some(0) {
            self.fail(DeclarationError::InvalidTimeout { test: name });
            return;
        }
        let matcher = match &options.error_pattern {
            None => None,
            Some(ErrorPattern::Substring(s)) => Some(ErrorMatcher::Substring(s.clone())),
            Some(ErrorPattern::Regex(re)) => match Regex::new(re) {
                Ok(re) => Some(ErrorMatcher::Pattern(re)),
                Err(e) => {
                    self.fail(DeclarationError::InvalidErrorPattern {
                        test: name,
                        message: e.to_string(),
                    });
                    return;
                }
            },
        };

        let suite = self.current();
        let id = TestId(self.tree.tests.len());
        self.tree.tests.push(TestCase {
            id,
            name,
            suite,
            body,
            tags: options.tags.clone(),
            options,
            focus,
            matcher,
        });
        self.tree.suites[suite.0].entries.push(Entry::Test(id));
    }

    pub fn it<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn() -> TaskResult + 'static,
    {
        self.test(name.into(), TestOptions::default(), FocusMode::Normal, Callback::sync(body));
    }

    pub fn it_with<F>(&mut self, name: impl Into<String>, options: TestOptions, body: F)
    where
        F: Fn() -> TaskResult + 'static,
    {
        self.test(name.into(), options, FocusMode::Normal, Callback::sync(body));
    }

    pub fn fit<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn() -> TaskResult + 'static,
    {
        self.test(name.into(), TestOptions::default(), FocusMode::Focused, Callback::sync(body));
    }

    pub fn xit<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn() -> TaskResult + 'static,
    {
        self.test(name.into(), TestOptions::default(), FocusMode::Skipped, Callback::sync(body));
    }

    /// Declare a test whose body runs on the scheduler.
    pub fn it_async<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(TestContext) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.test(
            name.into(),
            TestOptions::default(),
            FocusMode::Normal,
            Callback::from_async(body),
        );
    }

    pub fn it_async_with<F, Fut>(&mut self, name: impl Into<String>, options: TestOptions, body: F)
    where
        F: Fn(TestContext) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.test(name.into(), options, FocusMode::Normal, Callback::from_async(body));
    }

    pub fn fit_async<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(TestContext) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.test(
            name.into(),
            TestOptions::default(),
            FocusMode::Focused,
            Callback::from_async(body),
        );
    }

    pub fn xit_async<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(TestContext) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.test(
            name.into(),
            TestOptions::default(),
            FocusMode::Skipped,
            Callback::from_async(body),
        );
    }

    // -- Hooks -------------------------------------------------------------

    fn hook(&mut self, kind: HookKind, callback: Callback) {
        if self.error.is_some() {
            return;
        }
        let scope = self.current();
        let hook = Hook {
            kind,
            scope,
            callback,
        };
        let node = &mut self.tree.suites[scope.0];
        match kind {
            HookKind::Before => node.before_hooks.push(hook),
            HookKind::After => node.after_hooks.push(hook),
        }
    }

    /// Run before every test in this suite and its descendants.
    pub fn before_each<F>(&mut self, f: F)
    where
        F: Fn() -> TaskResult + 'static,
    {
        self.hook(HookKind::Before, Callback::sync(f));
    }

    /// Run after every test in this suite and its descendants, whatever the
    /// test's outcome.
    pub fn after_each<F>(&mut self, f: F)
    where
        F: Fn() -> TaskResult + 'static,
    {
        self.hook(HookKind::After, Callback::sync(f));
    }

    pub fn before_each_async<F, Fut>(&mut self, f: F)
    where
        F: Fn(TestContext) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.hook(HookKind::Before, Callback::from_async(f));
    }

    pub fn after_each_async<F, Fut>(&mut self, f: F)
    where
        F: Fn(TestContext) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.hook(HookKind::After, Callback::from_async(f));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
