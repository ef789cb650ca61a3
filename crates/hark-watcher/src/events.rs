//! Raw change signals.
//!
//! A [`RawSignal`] is the unit of work handed from the adapter to the change
//! workers: "something may have changed at this path". Signals carry no
//! classification. Workers compare the path against the record to decide
//! what, if anything, happened.
//!
//! # Event Flow
//!
//! ```text
//! notify::Event (native or polling backend)
//!        │
//!        ▼
//!   signals_from_event()  ── one RawSignal per path, access events dropped
//!        │
//!        ▼
//!   ChangePool::route()   ── partitioned by path
//! ```

use camino::Utf8PathBuf;
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind};
use smallvec::SmallVec;

use crate::error::ListenError;

/// What kind of entry a signal refers to, as far as the backend knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
    /// The backend did not say; the worker resolves it.
    Unknown,
}

/// A hint that a path may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSignal {
    /// Absolute path of the entry.
    pub path: Utf8PathBuf,

    /// Entry kind reported by the backend.
    pub kind: SignalKind,

    /// For directories: rescan the whole subtree rather than only the
    /// immediate children.
    pub recursive: bool,
}

impl RawSignal {
    /// Creates a new non-recursive signal.
    #[inline]
    #[must_use]
    pub fn new(path: Utf8PathBuf, kind: SignalKind) -> Self {
        Self {
            path,
            kind,
            recursive: false,
        }
    }

    /// Creates a signal for a file.
    #[inline]
    #[must_use]
    pub fn file(path: Utf8PathBuf) -> Self {
        Self::new(path, SignalKind::File)
    }

    /// Creates a signal for a directory.
    #[inline]
    #[must_use]
    pub fn dir(path: Utf8PathBuf) -> Self {
        Self::new(path, SignalKind::Dir)
    }

    /// Marks the signal as covering the whole subtree.
    #[inline]
    #[must_use]
    pub const fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

/// Maps a backend event to the entry kind it refers to.
///
/// Returns `None` for events that can never change content.
#[must_use]
pub fn signal_kind(kind: &EventKind) -> Option<SignalKind> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
            Some(SignalKind::Dir)
        }
        EventKind::Create(CreateKind::File)
        | EventKind::Remove(RemoveKind::File)
        | EventKind::Modify(ModifyKind::Data(_)) => Some(SignalKind::File),
        _ => Some(SignalKind::Unknown),
    }
}

/// Converts a backend event into one signal per affected path.
///
/// Non-UTF-8 paths are logged and skipped. New directories are marked
/// recursive, since files may already exist inside them by the time the
/// event is seen.
pub fn signals_from_event(event: &notify::Event) -> SmallVec<[RawSignal; 2]> {
    let mut signals = SmallVec::new();
    let Some(kind) = signal_kind(&event.kind) else {
        return signals;
    };
    let recursive = matches!(event.kind, EventKind::Create(CreateKind::Folder));

    for path in &event.paths {
        match Utf8PathBuf::from_path_buf(path.clone()) {
            Ok(path) => {
                let mut signal = RawSignal::new(path, kind);
                signal.recursive = recursive;
                signals.push(signal);
            }
            Err(path) => {
                let err = ListenError::non_utf8_path(path);
                tracing::warn!(error = %err, "Skipping path");
            }
        }
    }

    signals
}
