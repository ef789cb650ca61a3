//! Path relevance filtering.
//!
//! The [`Silencer`] decides whether a root-relative path is worth looking at.
//! It holds two pattern sets:
//!
//! - **ignore**: paths matching any pattern are silenced. Unless replaced,
//!   this set starts with [`DEFAULT_IGNORE`] (VCS and bundler directories,
//!   editor swap and backup files).
//! - **only**: when non-empty, a file must match one of these patterns.
//!   Directories are never subject to `only`, so that matching files deep in
//!   the tree remain reachable.
//!
//! A path inside an ignored directory is ignored as well.
//!
//! Additional rules can be layered on through the [`PathFilter`] trait;
//! a silencer built [`with_filter`](Silencer::with_filter) consults the
//! extra filter after its own patterns.
//!
//! # Examples
//!
//! ```
//! use hark_core::ListenOptions;
//! use hark_watcher::{EntryKind, Silencer};
//!
//! let silencer = Silencer::from_options(&ListenOptions::default()).unwrap();
//!
//! assert!(silencer.is_relevant("lib/a.rb", EntryKind::File));
//! assert!(!silencer.is_relevant("lib/a.rb.tmp", EntryKind::File));
//! assert!(!silencer.is_relevant(".git", EntryKind::Dir));
//! assert!(!silencer.is_relevant(".git/HEAD", EntryKind::File));
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Regex, RegexSet};
use smallvec::SmallVec;

use hark_core::{ConfigError, ListenOptions};

/// Ignore patterns applied unless replaced through `ignore!`.
pub const DEFAULT_IGNORE: &[&str] = &[
    r"^(?:\.bundle|\.git|\.hg|\.rbx|\.svn|bundle|log|tmp|vendor/ruby)(?:/|$)",
    r"(?:^|/)\.DS_Store$",
    r"\.tmp$",
    r"~$",
    r"\.sw[px]$",
    r"(?:^|/)\.#",
];

/// Kind of entry being checked for relevance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
}

/// A compiled list of regular expressions with their source text.
#[derive(Debug, Clone)]
struct PatternSet {
    sources: SmallVec<[String; 8]>,
    set: RegexSet,
}

impl PatternSet {
    fn compile<I>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let sources: SmallVec<[String; 8]> = patterns.into_iter().collect();

        // Compile individually first so the error names the bad pattern.
        for pattern in &sources {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        let set = RegexSet::new(&sources).map_err(|source| ConfigError::InvalidPattern {
            pattern: sources.join(" | "),
            source,
        })?;

        Ok(Self { sources, set })
    }

    #[inline]
    fn is_match(&self, text: &str) -> bool {
        self.set.is_match(text)
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// A relevance predicate over root-relative paths.
///
/// Implementations are consulted from change workers and the record walker,
/// so they must be [`Send`] and [`Sync`].
///
/// # Examples
///
/// ```
/// use hark_watcher::{EntryKind, PathFilter};
///
/// struct NoGenerated;
///
/// impl PathFilter for NoGenerated {
///     fn is_relevant(&self, relative: &str, _kind: EntryKind) -> bool {
///         !relative.starts_with("generated/")
///     }
/// }
///
/// assert!(!NoGenerated.is_relevant("generated/api.rs", EntryKind::File));
/// ```
pub trait PathFilter: Send + Sync + 'static {
    /// Returns `true` if changes to `relative` should be reported.
    fn is_relevant(&self, relative: &str, kind: EntryKind) -> bool;
}

/// A filter that combines multiple filters with AND logic.
///
/// An empty composite accepts everything.
///
/// # Examples
///
/// ```
/// use hark_watcher::{CompositeFilter, EntryKind, PathFilter};
///
/// struct NoVendor;
/// impl PathFilter for NoVendor {
///     fn is_relevant(&self, relative: &str, _kind: EntryKind) -> bool {
///         !relative.starts_with("vendor")
///     }
/// }
///
/// struct RustOnly;
/// impl PathFilter for RustOnly {
///     fn is_relevant(&self, relative: &str, kind: EntryKind) -> bool {
///         kind == EntryKind::Dir || relative.ends_with(".rs")
///     }
/// }
///
/// let filter = CompositeFilter::new().and(NoVendor).and(RustOnly);
/// assert!(filter.is_relevant("src/main.rs", EntryKind::File));
/// assert!(!filter.is_relevant("vendor/lib.rs", EntryKind::File));
/// assert!(!filter.is_relevant("README.md", EntryKind::File));
/// ```
#[derive(Default)]
pub struct CompositeFilter {
    filters: Vec<Box<dyn PathFilter>>,
}

impl CompositeFilter {
    /// Creates a new empty composite filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter to the composite.
    #[must_use]
    pub fn and<F: PathFilter>(mut self, filter: F) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Returns the number of combined filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if no filter was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl std::fmt::Debug for CompositeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeFilter")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl PathFilter for CompositeFilter {
    fn is_relevant(&self, relative: &str, kind: EntryKind) -> bool {
        self.filters.iter().all(|f| f.is_relevant(relative, kind))
    }
}

impl<F: PathFilter + ?Sized> PathFilter for Box<F> {
    fn is_relevant(&self, relative: &str, kind: EntryKind) -> bool {
        (**self).is_relevant(relative, kind)
    }
}

impl<F: PathFilter + ?Sized> PathFilter for Arc<F> {
    fn is_relevant(&self, relative: &str, kind: EntryKind) -> bool {
        (**self).is_relevant(relative, kind)
    }
}

/// Immutable ignore/only filter over root-relative paths.
#[derive(Clone)]
pub struct Silencer {
    ignore: PatternSet,
    only: PatternSet,
    extra: Option<Arc<dyn PathFilter>>,
}

impl std::fmt::Debug for Silencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silencer")
            .field("ignore", &self.ignore.sources)
            .field("only", &self.only.sources)
            .field("extra", &self.extra.is_some())
            .finish()
    }
}

impl Silencer {
    /// Builds a silencer from listener options.
    ///
    /// The effective ignore set is [`DEFAULT_IGNORE`] (or the `ignore!`
    /// replacement when set) followed by `ignore`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if any pattern fails to compile.
    pub fn from_options(options: &ListenOptions) -> Result<Self, ConfigError> {
        let base: Vec<String> = match &options.replace_ignore {
            Some(replacement) => replacement.clone(),
            None => DEFAULT_IGNORE.iter().map(|p| (*p).to_owned()).collect(),
        };
        let ignore = base.into_iter().chain(options.ignore.iter().cloned());

        Ok(Self {
            ignore: PatternSet::compile(ignore)?,
            only: PatternSet::compile(options.only.iter().cloned())?,
            extra: None,
        })
    }

    /// Layers `filter` on top of the pattern sets.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn PathFilter>) -> Self {
        self.extra = Some(filter);
        self
    }

    /// Returns `true` if changes to `relative` should be reported.
    ///
    /// `relative` is `/`-separated and relative to its watch root. The root
    /// itself (the empty string) is always relevant.
    #[must_use]
    pub fn is_relevant(&self, relative: &str, kind: EntryKind) -> bool {
        if relative.is_empty() {
            return true;
        }

        let mut ancestors = relative.match_indices('/').map(|(i, _)| &relative[..i]);
        if ancestors.any(|dir| self.dir_ignored(dir)) {
            return false;
        }

        let matched = match kind {
            EntryKind::Dir => !self.dir_ignored(relative),
            EntryKind::File => {
                !self.ignore.is_match(relative)
                    && (self.only.is_empty() || self.only.is_match(relative))
            }
        };
        matched
            && self
                .extra
                .as_ref()
                .is_none_or(|filter| filter.is_relevant(relative, kind))
    }

    /// Returns `true` if the path should be dropped.
    #[inline]
    #[must_use]
    pub fn is_silenced(&self, relative: &str, kind: EntryKind) -> bool {
        !self.is_relevant(relative, kind)
    }

    /// Returns the source text of the active ignore patterns.
    #[must_use]
    pub fn ignore_patterns(&self) -> &[String] {
        &self.ignore.sources
    }

    /// Returns the source text of the active only-patterns.
    #[must_use]
    pub fn only_patterns(&self) -> &[String] {
        &self.only.sources
    }

    // Directory patterns are written either as `^tmp(/|$)` or `^tmp/`.
    fn dir_ignored(&self, dir: &str) -> bool {
        self.ignore.is_match(dir) || self.ignore.is_match(&format!("{dir}/"))
    }
}

impl PathFilter for Silencer {
    fn is_relevant(&self, relative: &str, kind: EntryKind) -> bool {
        Self::is_relevant(self, relative, kind)
    }
}

/// The slot holding the current [`Silencer`].
///
/// Readers take a cheap snapshot with [`current`](Self::current); pattern
/// setters swap in a freshly compiled silencer with
/// [`replace`](Self::replace). In-flight signals finish against the snapshot
/// they took.
#[derive(Debug)]
pub struct SilencerSlot {
    current: RwLock<Arc<Silencer>>,
}

impl SilencerSlot {
    /// Creates a slot holding `silencer`.
    #[must_use]
    pub fn new(silencer: Silencer) -> Self {
        Self {
            current: RwLock::new(Arc::new(silencer)),
        }
    }

    /// Returns the current silencer.
    #[must_use]
    pub fn current(&self) -> Arc<Silencer> {
        Arc::clone(&self.current.read())
    }

    /// Atomically replaces the silencer.
    pub fn replace(&self, silencer: Silencer) {
        *self.current.write() = Arc::new(silencer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Silencer {
        Silencer::from_options(&ListenOptions::default()).unwrap()
    }

    #[test]
    fn test_default_ignores_vcs_directories() {
        let silencer = defaults();
        for dir in [".git", ".hg", ".svn", ".bundle", "tmp", "log", "vendor/ruby"] {
            assert!(silencer.is_silenced(dir, EntryKind::Dir), "{dir}");
            assert!(
                silencer.is_silenced(&format!("{dir}/file"), EntryKind::File),
                "{dir}/file"
            );
        }
        assert!(silencer.is_relevant("vendor", EntryKind::Dir));
        assert!(silencer.is_relevant("lib/log.rb", EntryKind::File));
        assert!(silencer.is_relevant("tmpfile.rb", EntryKind::File));
    }

    #[test]
    fn test_default_ignores_editor_files() {
        let silencer = defaults();
        for file in [
            "a.txt.tmp",
            "a.txt~",
            ".a.txt.swp",
            ".a.txt.swx",
            ".DS_Store",
            "lib/.DS_Store",
            ".#a.txt",
            "lib/.#a.txt",
        ] {
            assert!(silencer.is_silenced(file, EntryKind::File), "{file}");
        }
        assert!(silencer.is_relevant("a.txt", EntryKind::File));
        assert!(silencer.is_relevant("lib/a#b.txt", EntryKind::File));
    }

    #[test]
    fn test_ignore_appends_to_defaults() {
        let options = ListenOptions {
            ignore: vec![r"\.log$".to_owned()],
            ..ListenOptions::default()
        };
        let silencer = Silencer::from_options(&options).unwrap();
        assert!(silencer.is_silenced("server.log", EntryKind::File));
        assert!(silencer.is_silenced("a.tmp", EntryKind::File));
        assert_eq!(silencer.ignore_patterns().len(), DEFAULT_IGNORE.len() + 1);
    }

    #[test]
    fn test_replace_ignore_drops_defaults() {
        let options = ListenOptions {
            replace_ignore: Some(vec![r"\.rb$".to_owned()]),
            ..ListenOptions::default()
        };
        let silencer = Silencer::from_options(&options).unwrap();
        assert!(silencer.is_relevant("a.tmp", EntryKind::File));
        assert!(silencer.is_relevant(".git", EntryKind::Dir));
        assert!(silencer.is_silenced("lib/a.rb", EntryKind::File));
    }

    #[test]
    fn test_only_applies_to_files() {
        let options = ListenOptions {
            only: vec![r"\.rb$".to_owned()],
            ..ListenOptions::default()
        };
        let silencer = Silencer::from_options(&options).unwrap();
        assert!(silencer.is_relevant("lib", EntryKind::Dir));
        assert!(silencer.is_relevant("lib/a.rb", EntryKind::File));
        assert!(silencer.is_silenced("lib/a.txt", EntryKind::File));
    }

    #[test]
    fn test_ignore_wins_over_only() {
        let options = ListenOptions {
            only: vec![r"\.rb$".to_owned()],
            ignore: vec![r"^spec/".to_owned()],
            ..ListenOptions::default()
        };
        let silencer = Silencer::from_options(&options).unwrap();
        assert!(silencer.is_silenced("spec", EntryKind::Dir));
        assert!(silencer.is_silenced("spec/a.rb", EntryKind::File));
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let options = ListenOptions {
            ignore: vec!["ok".to_owned(), "(unclosed".to_owned()],
            ..ListenOptions::default()
        };
        let err = Silencer::from_options(&options).unwrap_err();
        match err {
            ConfigError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "(unclosed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_root_is_always_relevant() {
        let options = ListenOptions {
            replace_ignore: Some(vec![".*".to_owned()]),
            ..ListenOptions::default()
        };
        let silencer = Silencer::from_options(&options).unwrap();
        assert!(silencer.is_relevant("", EntryKind::Dir));
        assert!(silencer.is_silenced("a", EntryKind::File));
    }

    struct Deny(&'static str);

    impl PathFilter for Deny {
        fn is_relevant(&self, relative: &str, _kind: EntryKind) -> bool {
            !relative.contains(self.0)
        }
    }

    #[test]
    fn test_extra_filter_is_consulted() {
        let silencer = defaults().with_filter(Arc::new(Deny("generated")));
        assert!(silencer.is_silenced("src/generated.rs", EntryKind::File));
        assert!(silencer.is_relevant("src/main.rs", EntryKind::File));
        // Patterns still apply.
        assert!(silencer.is_silenced("src/main.rs.tmp", EntryKind::File));
    }

    #[test]
    fn test_composite_filter() {
        let empty = CompositeFilter::new();
        assert!(empty.is_empty());
        assert!(empty.is_relevant("anything", EntryKind::File));

        let filter = CompositeFilter::new().and(Deny("a")).and(Deny("b"));
        assert_eq!(filter.len(), 2);
        assert!(filter.is_relevant("c.rs", EntryKind::File));
        assert!(!filter.is_relevant("a.rs", EntryKind::File));
        assert!(!filter.is_relevant("b.rs", EntryKind::File));

        let boxed: Box<dyn PathFilter> = Box::new(filter);
        assert!(!boxed.is_relevant("a.rs", EntryKind::File));
    }

    #[test]
    fn test_slot_replace() {
        let accept_all = ListenOptions {
            replace_ignore: Some(Vec::new()),
            ..ListenOptions::default()
        };
        let slot = SilencerSlot::new(Silencer::from_options(&accept_all).unwrap());
        let before = slot.current();
        slot.replace(defaults());
        assert!(before.is_relevant("a.tmp", EntryKind::File));
        assert!(slot.current().is_silenced("a.tmp", EntryKind::File));
    }
}
