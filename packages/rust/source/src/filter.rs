//! Path filters (narrow what is downloaded) and path predicates (decide what
//! is kept by the transform stage).

use regex::Regex;
use tracing::warn;

use treedump_shared::{Result, TreeDumpError};

// ---------------------------------------------------------------------------
// PathFilter
// ---------------------------------------------------------------------------

/// Included and excluded subtrees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    /// Subtree roots to include. Empty means the whole tree.
    pub included_paths: Vec<String>,
    /// Subtree roots to exclude, taking precedence over inclusions.
    pub excluded_paths: Vec<String>,
}

impl PathFilter {
    pub fn new(included_paths: Vec<String>, excluded_paths: Vec<String>) -> Self {
        Self {
            included_paths,
            excluded_paths,
        }
    }

    /// True if `path` lies in an included subtree and in no excluded one.
    pub fn matches(&self, path: &str) -> bool {
        if self.excluded_paths.iter().any(|root| in_subtree(root, path)) {
            return false;
        }
        self.included_paths.is_empty() || self.included_paths.iter().any(|root| in_subtree(root, path))
    }
}

/// True if `path` is `root` or one of its descendants.
fn in_subtree(root: &str, path: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return true;
    }
    match path.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// PathPredicate
// ---------------------------------------------------------------------------

/// Decides whether the entry at a path is eligible for the output.
pub trait PathPredicate: Send + Sync {
    fn test(&self, path: &str) -> bool;
}

impl<F> PathPredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn test(&self, path: &str) -> bool {
        self(path)
    }
}

/// A predicate that keeps every path.
pub fn accept_all() -> impl PathPredicate {
    |_: &str| true
}

/// Glob-based predicate. `*` matches within one path element, `**` across
/// elements, `?` one character.
#[derive(Debug, Clone)]
pub struct GlobPredicate {
    /// If non-empty, a path must match at least one of these.
    include: Vec<Regex>,
    /// A path matching any of these is rejected.
    exclude: Vec<Regex>,
}

impl GlobPredicate {
    /// Compile include and exclude patterns. Invalid patterns are a config error.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
        })
    }

    /// Only exclusions.
    pub fn excluding(exclude: &[String]) -> Result<Self> {
        Self::new(&[], exclude)
    }
}

impl PathPredicate for GlobPredicate {
    fn test(&self, path: &str) -> bool {
        if self.exclude.iter().any(|p| p.is_match(path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.is_match(path))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            glob_to_regex(p).ok_or_else(|| {
                warn!(pattern = %p, "invalid path glob");
                TreeDumpError::config(format!("invalid path glob '{p}'"))
            })
        })
        .collect()
}

/// Convert a glob-like pattern to a regex.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_matching_respects_element_boundaries() {
        assert!(in_subtree("/content", "/content"));
        assert!(in_subtree("/content", "/content/site"));
        assert!(!in_subtree("/content", "/contents"));
        assert!(in_subtree("/", "/anything"));
        assert!(in_subtree("/content/", "/content/a"));
    }

    #[test]
    fn filter_exclusions_take_precedence() {
        let filter = PathFilter::new(
            vec!["/content".into()],
            vec!["/content/archive".into()],
        );
        assert!(filter.matches("/content/site/page"));
        assert!(!filter.matches("/content/archive/2019"));
        assert!(!filter.matches("/apps/x"));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(PathFilter::default().matches("/a/b"));
    }

    #[test]
    fn glob_predicate_excludes() {
        let pred = GlobPredicate::excluding(&["/hidden/**".into(), "/tmp/*".into()]).unwrap();
        assert!(!pred.test("/hidden/x"));
        assert!(!pred.test("/hidden/x/y"));
        assert!(!pred.test("/tmp/a"));
        assert!(pred.test("/tmp/a/b"));
        assert!(pred.test("/content"));
    }

    #[test]
    fn glob_predicate_includes() {
        let pred = GlobPredicate::new(&["/content/**".into()], &[]).unwrap();
        assert!(pred.test("/content/a"));
        assert!(!pred.test("/apps/a"));
    }

    #[test]
    fn closures_are_predicates() {
        let pred = |path: &str| !path.starts_with("/hidden");
        assert!(pred.test("/visible"));
        assert!(!PathPredicate::test(&pred, "/hidden/x"));
        assert!(accept_all().test("/whatever"));
    }
}
