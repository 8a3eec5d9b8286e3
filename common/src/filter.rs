//! Exclusion rules applied while walking a directory tree
//!
//! Every entry name encountered during a recursive transfer is checked against a list of glob
//! patterns. The default list hides macOS resource-fork sidecars (`._*`), which show up on shared
//! volumes and are never meant to be copied.
//!
//! # Pattern Syntax
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/`
//! - `?` matches a single character
//! - `[...]` character classes
//! - Leading `/` anchors the pattern to the transfer root
//! - Trailing `/` matches only directories
//!
//! ```
//! use common::filter::{FilterResult, FilterSettings};
//! use std::path::Path;
//!
//! let settings = FilterSettings::with_default_excludes();
//! assert!(matches!(
//!     settings.check(Path::new("._tempfile"), false),
//!     FilterResult::Excluded(_)
//! ));
//! assert!(matches!(
//!     settings.check(Path::new("plainfile.txt"), false),
//!     FilterResult::Included
//! ));
//! ```

use anyhow::{Context, anyhow};
use std::path::Path;

/// Patterns excluded unless the user opts out.
pub const DEFAULT_EXCLUDES: &[&str] = &["._*"];

/// A compiled exclusion pattern
#[derive(Debug, Clone)]
pub struct FilterPattern {
    /// pattern as given by the user, used in log output
    pub original: String,
    matcher: globset::GlobMatcher,
    /// pattern ends with `/`
    pub dir_only: bool,
    /// pattern starts with `/`
    pub anchored: bool,
    /// pattern has a `/` between its markers and must match the whole relative path
    nested: bool,
}

impl FilterPattern {
    pub fn parse(pattern: &str) -> anyhow::Result<Self> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let core = pattern.trim_start_matches('/').trim_end_matches('/');
        if core.is_empty() {
            return Err(anyhow!("pattern '{pattern}' has no glob left after stripping '/'"));
        }
        let matcher = globset::GlobBuilder::new(core)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern: {pattern}"))?
            .compile_matcher();
        Ok(Self {
            original: pattern.to_string(),
            matcher,
            dir_only: pattern.ends_with('/'),
            anchored: pattern.starts_with('/'),
            nested: core.contains('/'),
        })
    }
    /// `relative_path` is relative to the transfer root; for a single-level check pass just the
    /// entry name.
    pub fn matches(&self, relative_path: &Path, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.matcher.is_match(relative_path) {
            return true;
        }
        if self.anchored || self.nested {
            return false;
        }
        relative_path
            .file_name()
            .is_some_and(|name| self.matcher.is_match(Path::new(name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    Included,
    /// carries the original text of the matching pattern
    Excluded(String),
}

/// Ordered list of exclusion patterns
#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
    pub excludes: Vec<FilterPattern>,
}

impl FilterSettings {
    /// Empty filter; nothing is excluded.
    pub fn new() -> Self {
        Self::default()
    }
    /// Filter preloaded with [`DEFAULT_EXCLUDES`].
    pub fn with_default_excludes() -> Self {
        let excludes = DEFAULT_EXCLUDES
            .iter()
            .filter_map(|p| FilterPattern::parse(p).ok())
            .collect();
        Self { excludes }
    }
    /// Builds the filter from command-line input.
    pub fn from_args<S: AsRef<str>>(extra: &[S], default_excludes: bool) -> anyhow::Result<Self> {
        let mut settings = if default_excludes {
            Self::with_default_excludes()
        } else {
            Self::new()
        };
        for pattern in extra {
            settings.add_exclude(pattern.as_ref())?;
        }
        Ok(settings)
    }
    pub fn add_exclude(&mut self, pattern: &str) -> anyhow::Result<()> {
        self.excludes.push(FilterPattern::parse(pattern)?);
        Ok(())
    }
    pub fn is_empty(&self) -> bool {
        self.excludes.is_empty()
    }
    pub fn check(&self, relative_path: &Path, is_dir: bool) -> FilterResult {
        self.excludes
            .iter()
            .find(|p| p.matches(relative_path, is_dir))
            .map_or(FilterResult::Included, |p| {
                FilterResult::Excluded(p.original.clone())
            })
    }
    /// Convenience wrapper around [`FilterSettings::check`].
    pub fn is_excluded(&self, relative_path: &Path, is_dir: bool) -> bool {
        matches!(self.check(relative_path, is_dir), FilterResult::Excluded(_))
    }
}
