//! The last known state of every watched file.
//!
//! [`Record`] maps absolute file paths to a [`FileMeta`] signature. It is
//! built by walking the watch roots and afterwards kept current by the change
//! workers, each of which only ever writes the paths routed to it.
//!
//! # Safety Pattern
//!
//! The map is a [`DashMap`]. To avoid shard deadlocks the record never
//! exposes `Ref` types, copies values out on [`get`](Record::get), and never
//! holds a ref across another map operation.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use ignore::WalkBuilder;

use hark_core::{FxHashMap, WatchRoots};

use crate::error::ListenError;
use crate::silencer::{EntryKind, Silencer};

/// How long after a file's mtime a digest must have been taken before an
/// unchanged mtime is trusted to mean unchanged content. Covers filesystems
/// whose timestamps only advance once per scheduler tick.
const MTIME_SETTLE: Duration = Duration::from_secs(1);

/// Content signature of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Last modification time, if the platform reports one.
    pub mtime: Option<SystemTime>,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// BLAKE3 digest of the content.
    pub digest: blake3::Hash,
    /// When the digest was computed.
    pub hashed_at: SystemTime,
}

impl FileMeta {
    /// Reads the signature of the file at `path`.
    ///
    /// Returns `Ok(None)` if the path does not exist or is not a regular
    /// file. Symlinks are not followed. When `previous` has the same size,
    /// mode, and mtime, and its digest was taken well after that mtime, the
    /// previous signature is reused without reading the content.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than `NotFound`.
    pub fn read(path: &Utf8Path, previous: Option<&Self>) -> io::Result<Option<Self>> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        if !metadata.is_file() {
            return Ok(None);
        }

        let mtime = metadata.modified().ok();
        let size = metadata.len();
        let mode = mode_of(&metadata);

        if let Some(previous) = previous.filter(|p| p.unchanged_since(mtime, size, mode)) {
            return Ok(Some(*previous));
        }

        let hashed_at = SystemTime::now();
        let digest = match digest_file(path) {
            Ok(digest) => digest,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(Some(Self {
            mtime,
            size,
            mode,
            digest,
            hashed_at,
        }))
    }

    /// Returns `true` if `other` has the same content and permissions.
    ///
    /// Timestamps are ignored, so touching a file is not a change.
    #[inline]
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.size == other.size && self.mode == other.mode && self.digest == other.digest
    }

    fn unchanged_since(&self, mtime: Option<SystemTime>, size: u64, mode: u32) -> bool {
        let Some(mtime) = mtime else {
            return false;
        };
        self.mtime == Some(mtime)
            && self.size == size
            && self.mode == mode
            && self
                .hashed_at
                .duration_since(mtime)
                .is_ok_and(|age| age >= MTIME_SETTLE)
    }
}

fn digest_file(path: &Utf8Path) -> io::Result<blake3::Hash> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    u32::from(metadata.permissions().readonly())
}

/// Snapshot of every relevant file under the watch roots.
#[derive(Debug, Default)]
pub struct Record {
    roots: WatchRoots,
    entries: DashMap<Utf8PathBuf, FileMeta>,
}

impl Record {
    /// Creates an empty record for `roots`.
    #[must_use]
    pub fn new(roots: WatchRoots) -> Self {
        Self {
            roots,
            entries: DashMap::new(),
        }
    }

    /// Returns the roots this record covers.
    #[inline]
    #[must_use]
    pub fn roots(&self) -> &WatchRoots {
        &self.roots
    }

    /// Walks every root and replaces the record's contents.
    ///
    /// Entries the silencer rejects are skipped, and ignored directories are
    /// not descended into. Entries that vanish or cannot be read during the
    /// walk are skipped. Returns the number of files recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ListenError::Walk`] or [`ListenError::Io`] for any other
    /// failure.
    pub fn build(&self, silencer: &Arc<Silencer>) -> Result<usize, ListenError> {
        let mut fresh: FxHashMap<Utf8PathBuf, FileMeta> = FxHashMap::default();

        for root in &self.roots {
            for result in self.walker(root, silencer) {
                let entry = match result {
                    Ok(entry) => entry,
                    Err(err) => match err.io_error().map(io::Error::kind) {
                        Some(io::ErrorKind::NotFound) => continue,
                        Some(io::ErrorKind::PermissionDenied) => {
                            tracing::warn!(error = %err, "Skipping unreadable entry");
                            continue;
                        }
                        _ => return Err(err.into()),
                    },
                };

                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    continue;
                }
                let Some(path) = Utf8Path::from_path(entry.path()) else {
                    tracing::warn!(path = %entry.path().display(), "Skipping non-UTF-8 path");
                    continue;
                };

                let previous = self.get(path);
                match FileMeta::read(path, previous.as_ref()) {
                    Ok(Some(meta)) => {
                        fresh.insert(path.to_owned(), meta);
                    }
                    Ok(None) => {}
                    Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                        tracing::warn!(path = %path, error = %err, "Skipping unreadable file");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let count = fresh.len();
        self.entries.retain(|path, _| fresh.contains_key(path));
        for (path, meta) in fresh {
            self.entries.insert(path, meta);
        }

        tracing::debug!(files = count, roots = self.roots.len(), "Record built");
        Ok(count)
    }

    fn walker(&self, root: &Utf8Path, silencer: &Arc<Silencer>) -> ignore::Walk {
        let roots = self.roots.clone();
        let silencer = Arc::clone(silencer);

        WalkBuilder::new(root)
            // Report every file; relevance is the silencer's call
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let Some(path) = Utf8Path::from_path(entry.path()) else {
                    return false;
                };
                let Some(relative) = roots.relative(path) else {
                    return false;
                };
                let kind = if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                };
                silencer.is_relevant(&relative, kind)
            })
            .build()
    }

    /// Returns a copy of the signature recorded for `path`.
    #[must_use]
    pub fn get(&self, path: &Utf8Path) -> Option<FileMeta> {
        self.entries.get(path).map(|r| *r)
    }

    /// Returns `true` if `path` is recorded.
    #[must_use]
    pub fn contains(&self, path: &Utf8Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Stores `meta` for `path`, or forgets the path when `meta` is `None`.
    pub fn update(&self, path: &Utf8Path, meta: Option<FileMeta>) {
        match meta {
            Some(meta) => {
                self.entries.insert(path.to_owned(), meta);
            }
            None => self.remove(path),
        }
    }

    /// Forgets `path`.
    pub fn remove(&self, path: &Utf8Path) {
        self.entries.remove(path);
    }

    /// Forgets every recorded file `silencer` no longer considers relevant.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self, silencer: &Silencer) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| {
            self.roots
                .relative(path)
                .is_some_and(|relative| silencer.is_relevant(&relative, EntryKind::File))
        });
        before.saturating_sub(self.entries.len())
    }

    /// Returns every recorded file strictly below `dir`.
    #[must_use]
    pub fn file_paths_under(&self, dir: &Utf8Path) -> Vec<Utf8PathBuf> {
        self.entries
            .iter()
            .filter(|r| r.key().starts_with(dir) && r.key() != dir)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Returns `true` if any recorded file lies strictly below `dir`.
    #[must_use]
    pub fn has_files_under(&self, dir: &Utf8Path) -> bool {
        self.entries
            .iter()
            .any(|r| r.key().starts_with(dir) && r.key() != dir)
    }

    /// Returns every recorded path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<Utf8PathBuf> {
        let mut paths: Vec<Utf8PathBuf> = self.entries.iter().map(|r| r.key().clone()).collect();
        paths.sort_unstable();
        paths
    }

    /// Returns the number of recorded files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no file is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
