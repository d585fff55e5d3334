//! Test filter rules
//!
//! Rules come from a line-oriented file, one per line:
//!
//! ```text
//! # comment            ! also a comment
//! com\.acme\.slow\..*  default rule
//! ++ .*IT              include rule
//! -- com\.acme\..*     exclude rule
//! ```
//!
//! Patterns are anchored at the start of the class name; a match on any
//! leading substring counts. A class is filtered out of the run when any
//! rule reports a match for it. Default and include rules report a match
//! when the pattern matches; exclude rules report one when it does not.

use parking_lot::RwLock;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

use crate::error::FilterError;
use crate::java_class::JavaClass;

const INCLUDE_PREFIX: &str = "++ ";
const EXCLUDE_PREFIX: &str = "-- ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Default,
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
pub struct FilterRule {
    kind: RuleKind,
    source: String,
    pattern: Regex,
}

impl FilterRule {
    pub fn new(kind: RuleKind, source: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!("^(?:{source})"))?;
        Ok(Self {
            kind,
            source: source.to_string(),
            pattern,
        })
    }

    /// Classify one line of a rules file. Blank lines and comments give
    /// `None`.
    pub fn parse_line(line: &str) -> Option<Result<Self, regex::Error>> {
        if line.trim().is_empty() || line.starts_with('!') || line.starts_with('#') {
            return None;
        }

        let rule = if let Some(rest) = line.strip_prefix(INCLUDE_PREFIX) {
            Self::new(RuleKind::Include, rest)
        } else if let Some(rest) = line.strip_prefix(EXCLUDE_PREFIX) {
            Self::new(RuleKind::Exclude, rest)
        } else {
            Self::new(RuleKind::Default, line)
        };
        Some(rule)
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, class_name: &str) -> bool {
        rule_matches(self.kind, self.pattern.is_match(class_name))
    }

    /// A default or include rule whose pattern accepts the empty prefix
    /// matches every name, unless it asserts an end or a word boundary.
    fn is_catch_all(&self) -> bool {
        match self.kind {
            RuleKind::Default | RuleKind::Include => {
                self.pattern.is_match("")
                    && !["$", r"\b", r"\B", r"\z"]
                        .iter()
                        .any(|anchor| self.source.contains(anchor))
            }
            RuleKind::Exclude => false,
        }
    }
}

/// Polarity table: whether a rule of `kind` reports a match given whether
/// its pattern matched. Include behaves like default.
pub fn rule_matches(kind: RuleKind, pattern_matched: bool) -> bool {
    match kind {
        RuleKind::Default | RuleKind::Include => pattern_matched,
        RuleKind::Exclude => !pattern_matched,
    }
}

/// The rule list loaded from a filter file, reloadable in place
pub struct FilterChain {
    file: Option<PathBuf>,
    rules: RwLock<Vec<FilterRule>>,
}

impl FilterChain {
    pub fn from_file(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        if !file.exists() {
            info!(file = %file.display(), "filter file does not exist");
        }
        Self {
            file: Some(file),
            rules: RwLock::new(Vec::new()),
        }
    }

    /// A chain without a backing file: never filters anything
    pub fn none() -> Self {
        Self {
            file: None,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn with_rules(rules: Vec<FilterRule>) -> Self {
        Self {
            file: None,
            rules: RwLock::new(rules),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Rebuild the rules from the file. A missing file clears them; a file
    /// that exists but cannot be read (or holds a bad pattern) is an error
    /// and leaves the rules empty.
    pub fn update_filter_list(&self) -> Result<(), FilterError> {
        let Some(ref file) = self.file else {
            return Ok(());
        };

        let mut rules = self.rules.write();
        rules.clear();

        if !file.exists() {
            debug!(file = %file.display(), "filtering not in use");
            return Ok(());
        }

        *rules = read_rules(file)?;
        debug!(file = %file.display(), rules = rules.len(), "loaded filter rules");
        Ok(())
    }

    pub fn rules(&self) -> Vec<FilterRule> {
        self.rules.read().clone()
    }

    /// True when the class should be left out of the run
    pub fn matches(&self, class: &JavaClass) -> bool {
        self.matches_name(class.name())
    }

    pub fn matches_name(&self, class_name: &str) -> bool {
        let rules = self.rules.read();
        rules.iter().any(|rule| rule.matches(class_name))
    }

    /// True when the rules filter out every class, so selection can stop
    /// early
    pub fn accepts_none(&self) -> bool {
        self.rules.read().iter().any(FilterRule::is_catch_all)
    }
}

fn read_rules(file: &Path) -> Result<Vec<FilterRule>, FilterError> {
    let content = fs::read_to_string(file).map_err(|source| FilterError::Io {
        path: file.to_path_buf(),
        source,
    })?;

    let mut rules = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let Some(rule) = FilterRule::parse_line(line) else {
            continue;
        };
        let rule = rule.map_err(|source| FilterError::Pattern {
            path: file.to_path_buf(),
            line: number + 1,
            source,
        })?;
        trace!(kind = ?rule.kind(), pattern = rule.source(), "filter rule");
        rules.push(rule);
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_from(content: &str) -> (tempfile::TempDir, FilterChain) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("testloop.filters");
        fs::write(&file, content).unwrap();
        let chain = FilterChain::from_file(file);
        chain.update_filter_list().unwrap();
        (dir, chain)
    }

    #[test]
    fn test_line_classification() {
        let (_dir, chain) = chain_from("# comment\n! also\n\n   \n++ .*IT\n-- com\\.acme\\..*\ncom\\.slow\\..*\n");
        let kinds: Vec<RuleKind> = chain.rules().iter().map(FilterRule::kind).collect();

        assert_eq!(kinds, vec![RuleKind::Include, RuleKind::Exclude, RuleKind::Default]);
        assert_eq!(chain.rules()[0].source(), ".*IT");
        assert_eq!(chain.rules()[1].source(), "com\\.acme\\..*");
    }

    #[test]
    fn test_default_rule_matches_leading_substring() {
        let (_dir, chain) = chain_from("com\\.acme\\.slow\n");

        assert!(chain.matches_name("com.acme.slow.BigTest"));
        assert!(!chain.matches_name("org.com.acme.slow.BigTest"));
        assert!(!chain.matches_name("com.acme.FastTest"));
    }

    #[test]
    fn test_include_rule_has_default_polarity() {
        let (_dir, chain) = chain_from("++ com\\.acme\\.Foo\n");

        assert!(chain.matches_name("com.acme.FooTest"));
        assert!(!chain.matches_name("com.acme.BarTest"));
    }

    #[test]
    fn test_exclude_rule_matches_when_pattern_does_not() {
        let (_dir, chain) = chain_from("-- com\\.acme\\..*\n");

        // The pattern matches, so the exclude rule does not: the class runs.
        assert!(!chain.matches_name("com.acme.FooTest"));
        // The pattern misses, so the exclude rule matches: the class is filtered.
        assert!(chain.matches_name("org.other.FooTest"));
    }

    #[test]
    fn test_any_rule_matching_is_enough() {
        let (_dir, chain) = chain_from("com\\.a\\.\n++ com\\.b\\.\n");

        assert!(chain.matches_name("com.a.Test"));
        assert!(chain.matches_name("com.b.Test"));
        assert!(!chain.matches_name("com.c.Test"));
    }

    #[test]
    fn test_polarity_table() {
        assert!(rule_matches(RuleKind::Default, true));
        assert!(!rule_matches(RuleKind::Default, false));
        assert!(rule_matches(RuleKind::Include, true));
        assert!(!rule_matches(RuleKind::Include, false));
        assert!(!rule_matches(RuleKind::Exclude, true));
        assert!(rule_matches(RuleKind::Exclude, false));
    }

    #[test]
    fn test_missing_file_means_no_filtering() {
        let chain = FilterChain::from_file("/no/such/testloop.filters");
        chain.update_filter_list().unwrap();

        assert!(chain.rules().is_empty());
        assert!(!chain.matches_name("com.acme.FooTest"));
        assert!(!chain.accepts_none());
    }

    #[test]
    fn test_rules_reload_after_edit() {
        let (dir, chain) = chain_from("com\\.acme\\.A\n");
        assert!(chain.matches_name("com.acme.ATest"));

        fs::write(dir.path().join("testloop.filters"), "com\\.acme\\.B\n").unwrap();
        chain.update_filter_list().unwrap();
        assert!(!chain.matches_name("com.acme.ATest"));
        assert!(chain.matches_name("com.acme.BTest"));

        fs::remove_file(dir.path().join("testloop.filters")).unwrap();
        chain.update_filter_list().unwrap();
        assert!(chain.rules().is_empty());
    }

    #[test]
    fn test_bad_pattern_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("testloop.filters");
        fs::write(&file, "# ok\ncom\\.acme\\.(\n").unwrap();

        let err = FilterChain::from_file(&file).update_filter_list().unwrap_err();
        assert!(matches!(err, FilterError::Pattern { line: 2, .. }));
    }

    #[test]
    fn test_unreadable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory exists but cannot be read as a file.
        let err = FilterChain::from_file(dir.path()).update_filter_list().unwrap_err();
        assert!(matches!(err, FilterError::Io { .. }));
    }

    #[test]
    fn test_catch_all_detection() {
        let (_dir, chain) = chain_from(".*\n");
        assert!(chain.accepts_none());

        let (_dir, chain) = chain_from("++ .*\n");
        assert!(chain.accepts_none());

        let (_dir, chain) = chain_from("com\\..*\n");
        assert!(!chain.accepts_none());

        let (_dir, chain) = chain_from(".*Test$\n");
        assert!(!chain.accepts_none());

        let (_dir, chain) = chain_from("-- .*\n");
        assert!(!chain.accepts_none());
    }
}
