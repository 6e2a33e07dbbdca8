//! PathRules (§4.1) — a compiled gitignore matcher.
//!
//! Wraps `ignore::gitignore::Gitignore` the way the teacher's
//! `mount::walker::walk_mount` and `watcher::mod::GitignoreWatcher` do, but
//! generalized to compile from an arbitrary in-memory rule string rather
//! than only from a `.gitignore` file found on disk — the spec requires
//! building rules from `ignoreString` payloads that arrive over the wire,
//! which never touch the filesystem.

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// A compiled set of gitignore-style rules, anchored at a virtual root.
///
/// Precedence is last-match-wins, exactly as gitignore specifies and as
/// `ignore::gitignore::Gitignore` implements: a later `!pattern` negates an
/// earlier ignore.
#[derive(Debug, Clone)]
pub struct PathRules {
    inner: Gitignore,
}

impl PathRules {
    /// Compile a rule set from gitignore-syntax text (newline-separated).
    /// An empty string compiles to a matcher that matches nothing.
    pub fn compile(rule_text: &str) -> anyhow::Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for line in rule_text.lines() {
            builder
                .add_line(None, line)
                .map_err(|e| anyhow::anyhow!("invalid ignore rule {:?}: {e}", line))?;
        }
        let inner = builder.build()?;
        Ok(Self { inner })
    }

    /// An empty rule set — matches nothing.
    pub fn empty() -> Self {
        Self {
            inner: Gitignore::empty(),
        }
    }

    /// Returns whether `relative_path` is ignored by this rule set alone
    /// (no parent-directory inheritance — that is `Node::should_ignore`'s
    /// job in the `tree` module).
    pub fn matches(&self, relative_path: &str, is_directory: bool) -> bool {
        self.inner.matched(relative_path, is_directory).is_ignore()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rules_match_nothing() {
        let rules = PathRules::empty();
        assert!(!rules.matches("anything.txt", false));
    }

    #[test]
    fn basic_glob_matches() {
        let rules = PathRules::compile("*.log\ntemp/\n").unwrap();
        assert!(rules.matches("debug.log", false));
        assert!(!rules.matches("readme.txt", false));
        assert!(rules.matches("temp", true));
        assert!(!rules.matches("temp", false)); // trailing-slash rule: dirs only
    }

    #[test]
    fn later_negation_overrides_earlier_ignore() {
        let rules = PathRules::compile("*.log\n!important.log\n").unwrap();
        assert!(rules.matches("debug.log", false));
        assert!(!rules.matches("important.log", false));
    }

    #[test]
    fn anchored_leading_slash() {
        let rules = PathRules::compile("/build\n").unwrap();
        assert!(rules.matches("build", true));
        // anchored: must not match a nested "build" directory
        assert!(!rules.matches("sub/build", true));
    }

    #[test]
    fn doublestar_crosses_segments_single_star_does_not() {
        let rules = PathRules::compile("**/*.tmp\n").unwrap();
        assert!(rules.matches("a/b/c.tmp", false));
        assert!(rules.matches("c.tmp", false));

        let rules = PathRules::compile("*.tmp\n").unwrap();
        assert!(rules.matches("c.tmp", false));
        // a single `*` does not cross `/`, but gitignore rules without a
        // slash apply at every depth, so this still matches — the
        // "does not cross /" property shows up within one segment instead.
        assert!(rules.matches("a/c.tmp", false));
        assert!(!rules.matches("a/c.tmp.bak", false));
    }
}
