//! Dotted state paths (`"user.profile.name"`, `"items.0"`).
//!
//! The empty path is the root. Prefix relations are segment-aware:
//! `"user"` is an ancestor of `"user.name"` but not of `"username"`.
//! Empty segments are dropped on construction, so `"a..b"`, `".a.b"` and
//! `"a.b."` all name the node `"a.b"`.

use std::fmt;
use std::sync::Arc;

/// Location inside a state tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatePath(Arc<str>);

impl StatePath {
    pub fn root() -> Self {
        Self(Arc::from(""))
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        let raw = path.as_ref();
        if raw.split('.').all(|s| !s.is_empty()) {
            return Self(Arc::from(raw));
        }
        let normalized: Vec<&str> = raw.split('.').filter(|s| !s.is_empty()).collect();
        Self(Arc::from(normalized.join(".")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path segments; empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|s| !s.is_empty())
    }

    /// Enclosing path; `None` for the root.
    pub fn parent(&self) -> Option<StatePath> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('.') {
            Some(i) => StatePath::new(&self.0[..i]),
            None => StatePath::root(),
        })
    }

    pub fn join(&self, segment: &str) -> StatePath {
        if self.is_root() {
            StatePath::new(segment)
        } else {
            StatePath::new(format!("{}.{}", self.0, segment))
        }
    }

    /// Strict ancestor test. The root is an ancestor of every other path.
    pub fn is_ancestor_of(&self, other: &StatePath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&*self.0)
            && other.0.as_bytes()[self.0.len()] == b'.'
    }

    pub fn is_same_or_descendant_of(&self, other: &StatePath) -> bool {
        self == other || other.is_ancestor_of(self)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StatePath {
    fn from(s: &str) -> Self {
        StatePath::new(s)
    }
}

impl From<String> for StatePath {
    fn from(s: String) -> Self {
        StatePath::new(s)
    }
}

impl From<&StatePath> for StatePath {
    fn from(p: &StatePath) -> Self {
        p.clone()
    }
}

impl AsRef<str> for StatePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestry_is_segment_aware() {
        let user = StatePath::new("user");
        assert!(user.is_ancestor_of(&"user.name".into()));
        assert!(!user.is_ancestor_of(&"username".into()));
        assert!(!user.is_ancestor_of(&"user".into()));
        assert!(StatePath::root().is_ancestor_of(&user));
        assert!(StatePath::new("user.name").is_same_or_descendant_of(&user));
    }

    #[test]
    fn test_parent_and_join() {
        let p = StatePath::new("a.b.c");
        assert_eq!(p.parent(), Some(StatePath::new("a.b")));
        assert_eq!(StatePath::new("a").parent(), Some(StatePath::root()));
        assert_eq!(StatePath::root().parent(), None);
        assert_eq!(StatePath::root().join("x").join("0"), StatePath::new("x.0"));
        assert_eq!(p.segments().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_segments_are_normalized() {
        assert_eq!(StatePath::new("a..b"), StatePath::new("a.b"));
        assert_eq!(StatePath::new(".a"), StatePath::new("a"));
        assert_eq!(StatePath::from("a.".to_string()), StatePath::new("a"));
        assert!(StatePath::new("..").is_root());
        assert_eq!(StatePath::new("a..b").parent(), Some(StatePath::new("a")));
        assert!(StatePath::new("a").is_ancestor_of(&StatePath::new("a..b")));
        assert_eq!(StatePath::new("a").join(".b."), StatePath::new("a.b"));
    }
}
