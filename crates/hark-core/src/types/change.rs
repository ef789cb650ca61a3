//! Change classification and batches.
//!
//! A [`ChangeSet`] is the open batch that change workers write into. It maps
//! each absolute path to exactly one [`ChangeKind`], so a path can never sit
//! in two categories at once. A later classification for the same path
//! replaces the earlier one, except that a modification of a path added in
//! the same batch leaves it `added`: the consumer has never seen the earlier
//! content.
//!
//! When the debounce window elapses the set is frozen into [`Changes`], the
//! three sorted, root-relative path lists handed to the user callback.
//!
//! ```
//! use camino::Utf8PathBuf;
//! use hark_core::{ChangeKind, ChangeSet, WatchRoots};
//!
//! let roots = WatchRoots::from_canonical(vec![Utf8PathBuf::from("/srv/lib")]);
//! let mut batch = ChangeSet::new();
//! batch.record(Utf8PathBuf::from("/srv/lib/a.txt"), ChangeKind::Added);
//! batch.record(Utf8PathBuf::from("/srv/lib/a.txt"), ChangeKind::Removed);
//!
//! let changes = batch.into_changes(&roots);
//! assert!(changes.added.is_empty());
//! assert_eq!(changes.removed, vec!["a.txt".to_owned()]);
//! ```

use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::hash::FxHashMap;
use crate::types::roots::WatchRoots;

/// How a path changed relative to the last known snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The path existed and its content signature differs.
    Modified,
    /// The path was not known and now exists.
    Added,
    /// The path was known and no longer exists.
    Removed,
}

impl ChangeKind {
    /// Returns a short lowercase label for this kind.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Modified => "modified",
            Self::Added => "added",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An open batch of classified changes, keyed by absolute path.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    entries: FxHashMap<Utf8PathBuf, ChangeKind>,
}

impl ChangeSet {
    /// Creates a new empty batch.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a classification for `path`, replacing any earlier one.
    ///
    /// `Added` followed by `Modified` stays `Added`. Returns the
    /// classification that was replaced, if any.
    pub fn record(&mut self, path: Utf8PathBuf, kind: ChangeKind) -> Option<ChangeKind> {
        let merged = match (self.entries.get(&path), kind) {
            (Some(ChangeKind::Added), ChangeKind::Modified) => ChangeKind::Added,
            _ => kind,
        };
        self.entries.insert(path, merged)
    }

    /// Returns the number of distinct paths in the batch.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the batch is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards every recorded change.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Freezes the batch into sorted, root-relative path lists.
    ///
    /// Paths outside every root are dropped. Relative paths do not name
    /// their root, so the same file name under two roots appears twice in
    /// one list.
    #[must_use]
    pub fn into_changes(self, roots: &WatchRoots) -> Changes {
        let mut changes = Changes::default();

        for (path, kind) in self.entries {
            let Some(relative) = roots.relative(&path) else {
                continue;
            };
            match kind {
                ChangeKind::Modified => changes.modified.push(relative),
                ChangeKind::Added => changes.added.push(relative),
                ChangeKind::Removed => changes.removed.push(relative),
            }
        }

        changes.modified.sort_unstable();
        changes.added.sort_unstable();
        changes.removed.sort_unstable();
        changes
    }
}

/// A flushed batch: the three path lists delivered to the callback.
///
/// Immutable once produced. Each list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changes {
    /// Paths whose content changed.
    pub modified: Vec<String>,
    /// Paths that appeared.
    pub added: Vec<String>,
    /// Paths that disappeared.
    pub removed: Vec<String>,
}

impl Changes {
    /// Returns `true` if no path changed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Returns the total number of changed paths.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.modified.len() + self.added.len() + self.removed.len()
    }

    /// Returns the paths of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: ChangeKind) -> &[String] {
        match kind {
            ChangeKind::Modified => &self.modified,
            ChangeKind::Added => &self.added,
            ChangeKind::Removed => &self.removed,
        }
    }
}
