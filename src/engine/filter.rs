//! Compile-only eligibility filter
//!
//! Parsed from a comma-separated list of name fragments. Fragments prefixed
//! with `~` exclude, all others include. A name is eligible when it contains
//! at least one include fragment (or the include list is empty) and no
//! exclude fragment.

use tracing::warn;

/// Parsed include/exclude lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOnlyFilter {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl CompileOnlyFilter {
    /// Filter that accepts every name
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Parse a `foo,~bar` style list
    pub fn parse(list: &str) -> Self {
        let mut filter = Self::default();
        for fragment in list.split(',').map(str::trim) {
            if fragment.is_empty() || fragment == "~" {
                warn!(list, "ignoring empty compile-only fragment");
                continue;
            }
            match fragment.strip_prefix('~') {
                Some(excluded) => filter.excludes.push(excluded.to_string()),
                None => filter.includes.push(fragment.to_string()),
            }
        }
        filter
    }

    /// Build from explicit lists
    pub fn from_lists(includes: &[&str], excludes: &[&str]) -> Self {
        Self {
            includes: includes.iter().map(|s| s.to_string()).collect(),
            excludes: excludes.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether a unit with this display name may be compiled
    pub fn accepts(&self, name: &str) -> bool {
        let included =
            self.includes.is_empty() || self.includes.iter().any(|inc| name.contains(inc.as_str()));
        included && !self.excludes.iter().any(|exc| name.contains(exc.as_str()))
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }
}
