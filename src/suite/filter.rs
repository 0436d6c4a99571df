//! Focus, skip, tag and name eligibility
//!
//! Eligibility is resolved once per run by a pure walk over the tree. Each
//! test ends up with a set of [`Exclusion`] flags; an empty set means the
//! test runs.

use std::collections::BTreeSet;

use super::{Entry, FocusMode, SuiteTree, TestId};

bitflags::bitflags! {
    /// Reasons a test is excluded from a run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Exclusion: u8 {
        /// The test or an ancestor is `xit`/`xdescribe`.
        const EXPLICIT_SKIP = 1 << 0;
        /// Something in the tree is focused and this test is not.
        const NOT_FOCUSED = 1 << 1;
        /// An include filter is set and the test carries none of its tags.
        const TAG_NOT_INCLUDED = 1 << 2;
        /// The test carries an excluded tag.
        const TAG_EXCLUDED = 1 << 3;
        /// The name path does not contain the name filter.
        const NAME_FILTERED = 1 << 4;
    }
}

impl Default for Exclusion {
    fn default() -> Self {
        Exclusion::empty()
    }
}

impl Exclusion {
    /// Human-readable reason for the most significant flag set.
    pub fn reason(self) -> Option<&'static str> {
        const ORDER: [(Exclusion, &str); 5] = [
            (Exclusion::EXPLICIT_SKIP, "skipped by xit/xdescribe"),
            (Exclusion::NOT_FOCUSED, "not focused"),
            (Exclusion::TAG_EXCLUDED, "excluded by tag"),
            (Exclusion::TAG_NOT_INCLUDED, "missing included tag"),
            (Exclusion::NAME_FILTERED, "filtered by name"),
        ];
        ORDER
            .iter()
            .find(|(flag, _)| self.contains(*flag))
            .map(|(_, reason)| *reason)
    }
}

/// Externally supplied run filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestFilter {
    pub include_tags: BTreeSet<String>,
    pub exclude_tags: BTreeSet<String>,
    /// Substring matched against the " > "-joined name path.
    pub name_pattern: Option<String>,
}

impl TestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, tag: impl Into<String>) -> Self {
        self.include_tags.insert(tag.into());
        self
    }

    pub fn exclude(mut self, tag: impl Into<String>) -> Self {
        self.exclude_tags.insert(tag.into());
        self
    }

    pub fn name(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include_tags.is_empty() && self.exclude_tags.is_empty() && self.name_pattern.is_none()
    }
}

/// Per-test exclusion flags for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    exclusions: Vec<Exclusion>,
    focus_mode: bool,
}

impl Eligibility {
    /// Walk the tree top-down, carrying whether an ancestor is focused or
    /// skipped.
    pub fn resolve(tree: &SuiteTree, filter: &TestFilter) -> Self {
        let focus_mode = tree.has_focus();
        let mut exclusions = vec![Exclusion::empty(); tree.len()];
        let mut stack = vec![(tree.root().id, false, false)];

        while let Some((suite, focused, skipped)) = stack.pop() {
            let node = tree.suite(suite);
            let focused = focused || node.focus == FocusMode::Focused;
            let skipped = skipped || node.focus == FocusMode::Skipped;

            for entry in &node.entries {
                let id = match entry {
                    Entry::Suite(child) => {
                        stack.push((*child, focused, skipped));
                        continue;
                    }
                    Entry::Test(id) => *id,
                };
                let test = tree.test(id);
                let mut ex = Exclusion::empty();
                if skipped || test.focus == FocusMode::Skipped {
                    ex |= Exclusion::EXPLICIT_SKIP;
                }
                if focus_mode && !(focused || test.focus == FocusMode::Focused) {
                    ex |= Exclusion::NOT_FOCUSED;
                }
                if !filter.include_tags.is_empty() && test.tags.is_disjoint(&filter.include_tags) {
                    ex |= Exclusion::TAG_NOT_INCLUDED;
                }
                if !test.tags.is_disjoint(&filter.exclude_tags) {
                    ex |= Exclusion::TAG_EXCLUDED;
                }
                if let Some(pattern) = &filter.name_pattern {
                    if !tree.display_name(id).contains(pattern.as_str()) {
                        ex |= Exclusion::NAME_FILTERED;
                    }
                }
                exclusions[id.index()] = ex;
            }
        }

        Self {
            exclusions,
            focus_mode,
        }
    }

    pub fn exclusion(&self, id: TestId) -> Exclusion {
        self.exclusions.get(id.index()).copied().unwrap_or_default()
    }

    pub fn is_eligible(&self, id: TestId) -> bool {
        self.exclusion(id).is_empty()
    }

    pub fn skip_reason(&self, id: TestId) -> Option<&'static str> {
        self.exclusion(id).reason()
    }

    /// Whether the run is restricted to focused tests.
    pub fn focus_mode(&self) -> bool {
        self.focus_mode
    }

    pub fn eligible_count(&self) -> usize {
        self.exclusions.iter().filter(|e| e.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskResult;
    use crate::suite::TestOptions;

    fn pass() -> TaskResult {
        Ok(())
    }

    fn eligible_names(tree: &SuiteTree, filter: &TestFilter) -> Vec<String> {
        let el = Eligibility::resolve(tree, filter);
        tree.walk_tests()
            .into_iter()
            .filter(|t| el.is_eligible(*t))
            .map(|t| tree.display_name(t))
            .collect()
    }

    #[test]
    fn test_no_focus_runs_everything_but_skips() {
        let tree = SuiteTree::declare(|d| {
            d.it("a", pass);
            d.xit("b", pass);
            d.xdescribe("off", |d| d.it("c", pass));
        })
        .unwrap();
        let el = Eligibility::resolve(&tree, &TestFilter::new());
        assert!(!el.focus_mode());
        assert_eq!(el.eligible_count(), 1);
        assert_eq!(el.skip_reason(TestId(2)), Some("skipped by xit/xdescribe"));
    }

    #[test]
    fn test_focus_is_tree_wide() {
        let tree = SuiteTree::declare(|d| {
            d.describe("A", |d| d.it("A1", pass));
            d.fdescribe("B", |d| {
                d.it("B1", pass);
                d.describe("nested", |d| d.it("B2", pass));
            });
            d.describe("C", |d| d.fit("C1", pass));
        })
        .unwrap();
        assert_eq!(
            eligible_names(&tree, &TestFilter::new()),
            vec!["B > B1", "B > nested > B2", "C > C1"]
        );
        let el = Eligibility::resolve(&tree, &TestFilter::new());
        assert_eq!(el.exclusion(TestId(0)), Exclusion::NOT_FOCUSED);
    }

    #[test]
    fn test_skip_beats_focus() {
        let tree = SuiteTree::declare(|d| {
            d.xdescribe("off", |d| d.fit("focused but skipped", pass));
            d.it("plain", pass);
        })
        .unwrap();
        let el = Eligibility::resolve(&tree, &TestFilter::new());
        assert!(el.exclusion(TestId(0)).contains(Exclusion::EXPLICIT_SKIP));
        assert_eq!(el.skip_reason(TestId(1)), Some("not focused"));
        assert_eq!(el.eligible_count(), 0);
    }

    #[test]
    fn test_tag_filters() {
        let tree = SuiteTree::declare(|d| {
            d.describe("db", |d| {
                d.tags(["slow"]);
                d.it_with("migrate", TestOptions::new().tag("smoke"), pass);
                d.it("vacuum", pass);
            });
            d.it_with("parse", TestOptions::new().tag("smoke"), pass);
        })
        .unwrap();

        let only_smoke = TestFilter::new().include("smoke");
        assert_eq!(eligible_names(&tree, &only_smoke), vec!["db > migrate", "parse"]);

        let smoke_not_slow = TestFilter::new().include("smoke").exclude("slow");
        assert_eq!(eligible_names(&tree, &smoke_not_slow), vec!["parse"]);

        let el = Eligibility::resolve(&tree, &smoke_not_slow);
        assert_eq!(el.skip_reason(TestId(0)), Some("excluded by tag"));
        assert_eq!(el.skip_reason(TestId(1)), Some("excluded by tag"));
        assert!(el.exclusion(TestId(1)).contains(Exclusion::TAG_NOT_INCLUDED));
    }

    #[test]
    fn test_name_filter_matches_path() {
        let tree = SuiteTree::declare(|d| {
            d.describe("parser", |d| {
                d.it("numbers", pass);
                d.it("strings", pass);
            });
            d.it("lexer numbers", pass);
        })
        .unwrap();
        assert_eq!(
            eligible_names(&tree, &TestFilter::new().name("parser > ")),
            vec!["parser > numbers", "parser > strings"]
        );
        assert_eq!(
            eligible_names(&tree, &TestFilter::new().name("numbers")),
            vec!["parser > numbers", "lexer numbers"]
        );
        let el = Eligibility::resolve(&tree, &TestFilter::new().name("zzz"));
        assert_eq!(el.skip_reason(TestId(0)), Some("filtered by name"));
    }

    #[test]
    fn test_reason_priority() {
        let all = Exclusion::all();
        assert_eq!(all.reason(), Some("skipped by xit/xdescribe"));
        assert_eq!(Exclusion::empty().reason(), None);
        assert_eq!(
            (Exclusion::NAME_FILTERED | Exclusion::TAG_NOT_INCLUDED).reason(),
            Some("missing included tag")
        );
    }
}
