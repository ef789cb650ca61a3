//! Change classification and batching.
//!
//! Raw signals are routed to a fixed pool of change workers by hashing the
//! path, so every signal for one path is handled by one worker in arrival
//! order. A worker:
//!
//! 1. drops paths the current [`Silencer`](crate::silencer::Silencer) rejects,
//! 2. expands directory signals into signals for their entries (re-routed
//!    through the pool),
//! 3. compares a file against the [`Record`] and classifies it as added,
//!    removed, or modified, updating the record,
//! 4. merges the classification into the open batch and arms the debounce
//!    timer.
//!
//! The [`Dispatcher`] waits for the batch to stay quiet for the debounce
//! window, then hands it to the user callback.
//!
//! ```text
//! Adapter ──route──► [inbox 0] ──► ChangeWorker 0 ─┐
//!         ──route──► [inbox 1] ──► ChangeWorker 1 ─┼──► ChangeSet ──► Dispatcher ──► callback
//!         ──route──► [inbox n] ──► ChangeWorker n ─┘      (Mutex)      (debounce)
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use hark_core::{ChangeKind, ChangeSet, FxHashSet, WatchRoots, partition_of};

use crate::error::{BoxError, ListenError};
use crate::events::{RawSignal, SignalKind};
use crate::record::{FileMeta, Record};
use crate::silencer::{EntryKind, SilencerSlot};

/// User callback invoked with `(modified, added, removed)`.
pub type Callback =
    Box<dyn FnMut(&[String], &[String], &[String]) -> Result<(), BoxError> + Send + 'static>;

/// The callback slot shared between the listener and the dispatcher.
pub type SharedCallback = Arc<Mutex<Option<Callback>>>;

/// State shared by every change worker and the dispatcher.
#[derive(Debug)]
pub struct ChangeContext {
    /// Watch roots, for relativizing paths.
    pub roots: WatchRoots,
    /// Last known file signatures.
    pub record: Arc<Record>,
    /// Current ignore/only filter.
    pub silencer: Arc<SilencerSlot>,
    /// The open batch.
    pub batch: Arc<Mutex<ChangeSet>>,
    /// Wakes the dispatcher whenever the batch grows.
    pub armed: Arc<Notify>,
    /// Emit a debug event per classification.
    pub debug: bool,
}

/// Sending half of the change pool.
///
/// Cheap to clone. Routing never blocks.
#[derive(Debug, Clone)]
pub struct ChangePool {
    senders: Arc<[mpsc::UnboundedSender<RawSignal>]>,
}

/// Receiving half of one worker's queue.
///
/// The receiver outlives individual worker runs, so a restarted worker picks
/// up where the faulted one left off.
#[derive(Debug, Clone)]
pub struct WorkerInbox {
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RawSignal>>>,
}

impl WorkerInbox {
    #[cfg(test)]
    pub(crate) async fn recv(&self) -> Option<RawSignal> {
        self.receiver.lock().await.recv().await
    }
}

impl ChangePool {
    /// Creates a pool of `size` queues (at least one) and their inboxes.
    #[must_use]
    pub fn new(size: usize) -> (Self, Vec<WorkerInbox>) {
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                let inbox = WorkerInbox {
                    receiver: Arc::new(tokio::sync::Mutex::new(rx)),
                };
                (tx, inbox)
            })
            .unzip();

        (
            Self {
                senders: senders.into(),
            },
            inboxes,
        )
    }

    /// Returns the number of workers.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.senders.len()
    }

    /// Returns the worker that owns `path`.
    #[inline]
    #[must_use]
    pub fn partition(&self, path: &Utf8Path) -> usize {
        partition_of(path.as_str(), self.size())
    }

    /// Queues `signal` on the worker that owns its path.
    ///
    /// # Errors
    ///
    /// Returns [`ListenError::ChannelClosed`] if the pool has shut down.
    pub fn route(&self, signal: RawSignal) -> Result<(), ListenError> {
        let index = self.partition(&signal.path);
        self.senders
            .get(index)
            .ok_or(ListenError::ChannelClosed)?
            .send(signal)
            .map_err(|_| ListenError::ChannelClosed)
    }
}

/// One member of the change pool.
#[derive(Debug)]
pub struct ChangeWorker {
    name: String,
    inbox: WorkerInbox,
    context: Arc<ChangeContext>,
    pool: ChangePool,
}

impl ChangeWorker {
    /// Creates a worker draining `inbox`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        inbox: WorkerInbox,
        context: Arc<ChangeContext>,
        pool: ChangePool,
    ) -> Self {
        Self {
            name: name.into(),
            inbox,
            context,
            pool,
        }
    }

    /// Processes signals until cancelled.
    ///
    /// On cancellation the signals already queued are drained before the
    /// worker returns, so the record reflects everything that arrived before
    /// `stop`.
    ///
    /// # Errors
    ///
    /// Returns an error if processing a signal fails or panics. The queue is
    /// left intact for the next run.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ListenError> {
        let mut inbox = self.inbox.receiver.lock().await;
        tracing::debug!(worker = %self.name, "Change worker started");

        loop {
            let signal = tokio::select! {
                biased;
                signal = inbox.recv() => signal,
                () = cancel.cancelled() => break,
            };
            let Some(signal) = signal else {
                return Ok(());
            };
            self.process(signal).await?;
        }

        while let Ok(signal) = inbox.try_recv() {
            self.process(signal).await?;
        }

        tracing::debug!(worker = %self.name, "Change worker stopped");
        Ok(())
    }

    async fn process(&self, signal: RawSignal) -> Result<(), ListenError> {
        let context = Arc::clone(&self.context);
        let pool = self.pool.clone();

        // File I/O and hashing run on the blocking pool.
        match tokio::task::spawn_blocking(move || handle_signal(&context, &pool, signal)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(ListenError::worker_fault(
                self.name.clone(),
                "panicked while processing a signal",
            )),
            Err(err) => Err(ListenError::worker_fault(self.name.clone(), err.to_string())),
        }
    }
}

/// Handles one signal: filter, expand or classify, record.
pub(crate) fn handle_signal(
    context: &ChangeContext,
    pool: &ChangePool,
    signal: RawSignal,
) -> Result<(), ListenError> {
    let Some(relative) = context.roots.relative(&signal.path) else {
        tracing::trace!(path = %signal.path, "Signal outside watch roots");
        return Ok(());
    };

    let kind = resolve_kind(context, &signal);
    let entry_kind = match kind {
        SignalKind::Dir => EntryKind::Dir,
        SignalKind::File | SignalKind::Unknown => EntryKind::File,
    };
    if context.silencer.current().is_silenced(&relative, entry_kind) {
        tracing::trace!(path = %signal.path, "Silenced");
        forget_silenced(context, &signal.path, entry_kind);
        return Ok(());
    }

    match kind {
        SignalKind::Dir => expand_dir(context, pool, &signal),
        SignalKind::File | SignalKind::Unknown => classify_file(context, signal.path),
    }
}

/// Drops record entries for a path that is now silenced, without reporting
/// them. Entries survive this long only if the patterns changed since they
/// were recorded.
fn forget_silenced(context: &ChangeContext, path: &Utf8Path, kind: EntryKind) {
    if kind == EntryKind::Dir {
        for known in context.record.file_paths_under(path) {
            context.record.remove(&known);
        }
    }
    context.record.remove(path);
}

fn resolve_kind(context: &ChangeContext, signal: &RawSignal) -> SignalKind {
    match signal.kind {
        SignalKind::Unknown if signal.path.is_dir() => SignalKind::Dir,
        SignalKind::Unknown if context.record.has_files_under(&signal.path) => SignalKind::Dir,
        SignalKind::Unknown | SignalKind::File => SignalKind::File,
        SignalKind::Dir => SignalKind::Dir,
    }
}

/// Re-routes a directory signal as signals for its entries.
///
/// Children on disk are signalled directly. Recorded files whose top-level
/// entry under `dir` no longer exists are signalled so their removal is
/// noticed.
/// Subdirectories are only descended into when the signal is recursive or
/// the subdirectory is not yet known.
fn expand_dir(
    context: &ChangeContext,
    pool: &ChangePool,
    signal: &RawSignal,
) -> Result<(), ListenError> {
    let dir = &signal.path;
    let recursive = signal.recursive || !context.record.has_files_under(dir);

    // A recorded file replaced by a directory.
    if context.record.contains(dir) {
        pool.route(RawSignal::file(dir.clone()))?;
    }

    let mut on_disk: FxHashSet<Utf8PathBuf> = FxHashSet::default();
    match dir.read_dir_utf8() {
        Ok(entries) => {
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                        tracing::warn!(dir = %dir, error = %err, "Skipping non-UTF-8 entry");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                let path = entry.path().to_owned();
                let is_dir = entry.file_type().is_ok_and(|ft| ft.is_dir());
                if is_dir {
                    if recursive || !context.record.has_files_under(&path) {
                        pool.route(RawSignal::dir(path.clone()).recursive())?;
                    }
                } else {
                    pool.route(RawSignal::file(path.clone()))?;
                }
                on_disk.insert(path);
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    for known in context.record.file_paths_under(dir) {
        let Ok(rest) = known.strip_prefix(dir) else {
            continue;
        };
        let Some(first) = rest.components().next() else {
            continue;
        };
        if !on_disk.contains(&dir.join(first.as_str())) {
            pool.route(RawSignal::file(known))?;
        }
    }

    Ok(())
}

/// Compares a file with the record and merges the result into the batch.
fn classify_file(context: &ChangeContext, path: Utf8PathBuf) -> Result<(), ListenError> {
    let previous = context.record.get(&path);
    let current = FileMeta::read(&path, previous.as_ref())?;

    let kind = match (&previous, &current) {
        (None, None) => return Ok(()),
        (None, Some(_)) => ChangeKind::Added,
        (Some(_), None) => ChangeKind::Removed,
        (Some(before), Some(after)) if before.same_content(after) => {
            context.record.update(&path, current);
            return Ok(());
        }
        (Some(_), Some(_)) => ChangeKind::Modified,
    };

    context.record.update(&path, current);
    if context.debug {
        tracing::debug!(path = %path, kind = %kind, "Change classified");
    }
    context.batch.lock().record(path, kind);
    context.armed.notify_one();
    Ok(())
}

/// Flushes the batch to the callback once it has been quiet for the
/// debounce window.
#[derive(Clone)]
pub struct Dispatcher {
    context: Arc<ChangeContext>,
    window: Duration,
    callback: SharedCallback,
    paused: Arc<AtomicBool>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("window", &self.window)
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        context: Arc<ChangeContext>,
        window: Duration,
        callback: SharedCallback,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            context,
            window,
            callback,
            paused,
        }
    }

    /// Runs until cancelled. A batch still open at cancellation is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ListenError::Callback`] if the callback fails or panics.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ListenError> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = self.context.armed.notified() => {}
            }

            // Restart the window on every new change.
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = self.context.armed.notified() => {}
                    () = tokio::time::sleep(self.window) => break,
                }
            }

            self.flush().await?;
        }
    }

    async fn flush(&self) -> Result<(), ListenError> {
        let batch = std::mem::take(&mut *self.context.batch.lock());
        if batch.is_empty() {
            return Ok(());
        }
        if self.paused.load(Ordering::Acquire) {
            tracing::debug!(paths = batch.len(), "Paused, discarding batch");
            return Ok(());
        }

        let changes = batch.into_changes(&self.context.roots);
        if changes.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            modified = changes.modified.len(),
            added = changes.added.len(),
            removed = changes.removed.len(),
            "Dispatching batch"
        );

        let callback = Arc::clone(&self.callback);
        let paused = Arc::clone(&self.paused);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut slot = callback.lock();
            // `pause` may have landed while the previous batch held the lock.
            if paused.load(Ordering::Acquire) {
                tracing::debug!("Paused before delivery, discarding batch");
                return Ok(());
            }
            match slot.as_mut() {
                Some(callback) => callback(&changes.modified, &changes.added, &changes.removed),
                None => Ok(()),
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ListenError::Callback(err)),
            Err(err) => Err(ListenError::Callback(Box::new(err))),
        }
    }
}
