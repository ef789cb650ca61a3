//! The set of watched directories.
//!
//! This module provides [`WatchRoots`], an ordered, de-duplicated sequence
//! of absolute UTF-8 directory paths. Paths that exist are canonicalized;
//! paths that do not exist yet are made absolute so that a later
//! reachability check can report them.

use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Ordered set of absolute directories being watched.
///
/// Fixed at listener construction.
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use hark_core::WatchRoots;
///
/// let roots = WatchRoots::from_canonical(vec!["/srv/app/lib".into(), "/srv/app".into()]);
/// assert_eq!(
///     roots.relative(Utf8Path::new("/srv/app/lib/deep/a.txt")).as_deref(),
///     Some("deep/a.txt"),
/// );
/// assert_eq!(roots.relative(Utf8Path::new("/elsewhere/a.txt")), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRoots {
    dirs: Vec<Utf8PathBuf>,
}

impl WatchRoots {
    /// Resolves the given directories into absolute, canonical UTF-8 paths.
    ///
    /// Duplicates (after canonicalization) are dropped, keeping the first
    /// occurrence. Directories that do not exist are kept as absolute paths.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPath`] if a path is not valid UTF-8 or
    /// cannot be made absolute.
    pub fn resolve<I, P>(dirs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut resolved: Vec<Utf8PathBuf> = Vec::new();

        for dir in dirs {
            let dir = dir.as_ref();
            let absolute = match dir.canonicalize() {
                Ok(path) => path,
                Err(_) => std::path::absolute(dir)
                    .map_err(|e| ConfigError::invalid_path(dir, e.to_string()))?,
            };
            let utf8 = Utf8PathBuf::from_path_buf(absolute)
                .map_err(|path| ConfigError::invalid_path(path, "path is not valid UTF-8"))?;

            if !resolved.contains(&utf8) {
                resolved.push(utf8);
            }
        }

        Ok(Self { dirs: resolved })
    }

    /// Wraps directories that are already absolute and canonical.
    #[must_use]
    pub fn from_canonical(dirs: Vec<Utf8PathBuf>) -> Self {
        Self { dirs }
    }

    /// Returns the subset of roots that currently exist as directories.
    #[must_use]
    pub fn reachable(&self) -> Self {
        Self {
            dirs: self.dirs.iter().filter(|d| d.is_dir()).cloned().collect(),
        }
    }

    /// Returns the roots as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[Utf8PathBuf] {
        &self.dirs
    }

    /// Returns an iterator over the roots.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Utf8Path> {
        self.dirs.iter().map(Utf8PathBuf::as_path)
    }

    /// Returns the number of roots.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Returns `true` if there are no roots.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Returns the most specific root containing `path`.
    #[must_use]
    pub fn root_of(&self, path: &Utf8Path) -> Option<&Utf8Path> {
        self.dirs
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.as_str().len())
            .map(Utf8PathBuf::as_path)
    }

    /// Returns `path` relative to its most specific root, `/`-separated.
    ///
    /// A root itself maps to the empty string. Paths outside every root map
    /// to `None`.
    #[must_use]
    pub fn relative(&self, path: &Utf8Path) -> Option<String> {
        let root = self.root_of(path)?;
        let rest = path.strip_prefix(root).ok()?;
        let parts: Vec<&str> = rest.components().map(|c| c.as_str()).collect();
        Some(parts.join("/"))
    }
}

impl<'a> IntoIterator for &'a WatchRoots {
    type Item = &'a Utf8PathBuf;
    type IntoIter = std::slice::Iter<'a, Utf8PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.dirs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_resolve_canonicalizes_existing_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let lib = temp.path().join("lib");
        fs::create_dir(&lib).unwrap();

        let dotted = temp.path().join("lib").join("..").join("lib");
        let roots = WatchRoots::resolve([&dotted]).unwrap();

        assert_eq!(roots.len(), 1);
        let expected = Utf8PathBuf::from_path_buf(lib.canonicalize().unwrap()).unwrap();
        assert_eq!(roots.as_slice(), &[expected]);
    }

    #[test]
    fn test_resolve_dedups_and_keeps_order() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        let roots = WatchRoots::resolve([&b, &a, &b]).unwrap();
        assert_eq!(roots.len(), 2);
        assert!(roots.as_slice()[0].ends_with("b"));
        assert!(roots.as_slice()[1].ends_with("a"));
    }

    #[test]
    fn test_reachable_drops_missing_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("missing");

        let roots = WatchRoots::resolve([temp.path(), missing.as_path()]).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.reachable().len(), 1);
    }

    #[test]
    fn test_relative_uses_most_specific_root() {
        let roots = WatchRoots::from_canonical(vec![
            Utf8PathBuf::from("/srv"),
            Utf8PathBuf::from("/srv/app"),
        ]);
        assert_eq!(
            roots.relative(Utf8Path::new("/srv/app/src/main.rs")).as_deref(),
            Some("src/main.rs")
        );
        assert_eq!(
            roots.relative(Utf8Path::new("/srv/other.txt")).as_deref(),
            Some("other.txt")
        );
        assert_eq!(roots.relative(Utf8Path::new("/srv/app")).as_deref(), Some(""));
    }

    #[test]
    fn test_root_of_requires_component_boundary() {
        let roots = WatchRoots::from_canonical(vec![Utf8PathBuf::from("/srv/app")]);
        assert!(roots.root_of(Utf8Path::new("/srv/application/x")).is_none());
    }
}
