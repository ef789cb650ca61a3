//! The public listener.
//!
//! A [`Listener`] ties the engine together. [`start`](Listener::start)
//! snapshots the watched trees into the [`Record`] and launches the
//! supervised units:
//!
//! - the [`Adapter`], bridging OS notifications into raw signals,
//! - a pool of [`ChangeWorker`]s, classifying signals against the record,
//! - the [`Dispatcher`], debouncing batches into the user callback.
//!
//! # Examples
//!
//! ```no_run
//! use hark_core::ListenOptions;
//! use hark_watcher::{Listener, shutdown_token};
//!
//! # async fn example() -> Result<(), hark_watcher::ListenError> {
//! let mut listener = Listener::new(["app", "lib"], ListenOptions::default())?
//!     .with_callback(|modified, added, removed| {
//!         println!("modified: {modified:?} added: {added:?} removed: {removed:?}");
//!         Ok(())
//!     });
//!
//! listener.start(shutdown_token()).await?;
//! listener.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use hark_core::{ChangeSet, ConfigError, ListenOptions, WatchRoots};

use crate::adapter::{Adapter, AdapterState, Backend};
use crate::change::{ChangeContext, ChangePool, ChangeWorker, Dispatcher, SharedCallback};
use crate::error::{BoxError, ListenError};
use crate::record::Record;
use crate::silencer::{PathFilter, Silencer, SilencerSlot};
use crate::supervisor::Supervisor;

/// A running set of supervised units.
#[derive(Debug)]
struct Session {
    cancel: CancellationToken,
    supervisor: Supervisor,
    fatal_rx: mpsc::UnboundedReceiver<ListenError>,
}

/// Watches directory trees and reports batched file changes.
pub struct Listener {
    roots: WatchRoots,
    options: ListenOptions,
    filter: Option<Arc<dyn PathFilter>>,
    silencer: Arc<SilencerSlot>,
    record: Arc<Record>,
    batch: Arc<Mutex<ChangeSet>>,
    callback: SharedCallback,
    paused: Arc<AtomicBool>,
    adapter: Arc<AdapterState>,
    session: Option<Session>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("roots", &self.roots)
            .field("options", &self.options)
            .field("paused", &self.is_paused())
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Creates a listener over `dirs`.
    ///
    /// Directories are canonicalized here. Missing directories are accepted
    /// and skipped with a warning by [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `dirs` is empty, an option is out of
    /// range, or an ignore/only pattern does not compile.
    pub fn new<I, P>(dirs: I, options: ListenOptions) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        options.validate()?;
        let roots = WatchRoots::resolve(dirs)?;
        if roots.is_empty() {
            return Err(ConfigError::NoDirectories);
        }
        let silencer = Silencer::from_options(&options)?;

        Ok(Self {
            record: Arc::new(Record::new(roots.clone())),
            roots,
            options,
            filter: None,
            silencer: Arc::new(SilencerSlot::new(silencer)),
            batch: Arc::new(Mutex::new(ChangeSet::new())),
            callback: Arc::new(Mutex::new(None)),
            paused: Arc::new(AtomicBool::new(false)),
            adapter: Arc::new(AdapterState::default()),
            session: None,
        })
    }

    /// Sets the callback invoked with `(modified, added, removed)`.
    ///
    /// Each list holds paths relative to their watch root, sorted. An error
    /// returned by the callback stops the listener.
    ///
    /// Paths do not name their root. With several roots, files at the same
    /// relative location under different roots are reported as the same
    /// string, once per root. Watch a common parent instead if the
    /// distinction matters.
    #[must_use]
    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: FnMut(&[String], &[String], &[String]) -> Result<(), BoxError> + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
        self
    }

    /// Layers an extra relevance filter on top of the ignore/only patterns.
    ///
    /// The filter survives later [`ignore`](Self::ignore),
    /// [`replace_ignore`](Self::replace_ignore) and [`only`](Self::only)
    /// calls.
    #[must_use]
    pub fn with_filter<F: PathFilter>(mut self, filter: F) -> Self {
        let filter: Arc<dyn PathFilter> = Arc::new(filter);
        let silencer = (*self.silencer.current())
            .clone()
            .with_filter(Arc::clone(&filter));
        self.silencer.replace(silencer);
        self.filter = Some(filter);
        self
    }

    /// Snapshots the watched trees and starts listening.
    ///
    /// Cancelling `cancel` stops the listener. Calling `start` on a running
    /// listener does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoDirectories`] if none of the directories
    /// exist, or an error from the initial walk.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), ListenError> {
        if self.session.is_some() {
            tracing::warn!("Listener already started");
            return Ok(());
        }

        let roots = self.roots.reachable();
        for dir in &self.roots {
            if !roots.as_slice().contains(dir) {
                tracing::warn!(path = %dir, "Directory does not exist, skipping");
            }
        }
        if roots.is_empty() {
            return Err(ConfigError::NoDirectories.into());
        }

        let token = cancel.child_token();
        let (mut supervisor, fatal_rx) = Supervisor::new(token.clone(), self.options.restart);
        let (pool, inboxes) = ChangePool::new(self.options.worker_count());

        // Watch before walking so nothing changed during the walk is missed.
        self.adapter.begin_session();
        let adapter = Adapter::new(
            roots.clone(),
            &self.options,
            pool.clone(),
            Arc::clone(&self.adapter),
        );
        supervisor.add("adapter", move |token| adapter.clone().run(token));

        let record = Arc::new(Record::new(roots.clone()));
        match build_record(&record, self.silencer.current()).await {
            Ok(files) => tracing::debug!(files, "Record built"),
            Err(err) => {
                supervisor.shutdown().await;
                return Err(err);
            }
        }
        self.record = record;
        self.batch.lock().clear();
        self.paused.store(false, Ordering::Release);

        let context = Arc::new(ChangeContext {
            roots: roots.clone(),
            record: Arc::clone(&self.record),
            silencer: Arc::clone(&self.silencer),
            batch: Arc::clone(&self.batch),
            armed: Arc::new(Notify::new()),
            debug: self.options.debug,
        });

        let inboxes: Arc<[_]> = inboxes.into();
        let workers = inboxes.len();
        {
            let context = Arc::clone(&context);
            supervisor.pool("change", workers, move |index, token| {
                ChangeWorker::new(
                    format!("change-{index}"),
                    inboxes[index].clone(),
                    Arc::clone(&context),
                    pool.clone(),
                )
                .run(token)
            });
        }

        let dispatcher = Dispatcher::new(
            context,
            self.options.debounce_window(),
            Arc::clone(&self.callback),
            Arc::clone(&self.paused),
        );
        supervisor.add("dispatcher", move |token| dispatcher.clone().run(token));

        tracing::debug!(units = ?supervisor.unit_names().collect::<Vec<_>>(), "Units supervised");
        tracing::info!(
            roots = roots.len(),
            workers,
            files = self.record.len(),
            "Listener started"
        );

        self.session = Some(Session {
            cancel: token,
            supervisor,
            fatal_rx,
        });
        Ok(())
    }

    /// Waits until the listener is cancelled or fails, then stops it.
    ///
    /// Returns immediately if the listener is not running.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the listener: a callback
    /// failure, or a unit that exhausted its restarts.
    pub async fn wait(&mut self) -> Result<(), ListenError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let outcome = tokio::select! {
            () = session.cancel.cancelled() => Ok(()),
            Some(err) = session.fatal_rx.recv() => Err(err),
        };

        self.stop().await;
        outcome
    }

    /// Stops every unit and drops the pending batch.
    ///
    /// Does nothing if the listener is not running. The listener can be
    /// started again afterwards.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.supervisor.shutdown().await;
        self.batch.lock().clear();
        tracing::info!("Listener stopped");
    }

    /// Suppresses callbacks. Changes keep being tracked in the record.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::debug!("Listener paused");
    }

    /// Resumes callbacks.
    ///
    /// The record is rebuilt from disk first, so changes made while paused
    /// are never reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the record walk fails.
    pub async fn unpause(&self) -> Result<(), ListenError> {
        build_record(&self.record, self.silencer.current()).await?;
        self.batch.lock().clear();
        self.paused.store(false, Ordering::Release);
        tracing::debug!("Listener unpaused");
        Ok(())
    }

    /// Returns `true` while callbacks are suppressed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Returns `true` while started and not paused.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.session.is_some() && !self.is_paused()
    }

    /// Appends ignore patterns.
    ///
    /// Recorded files the new patterns silence are forgotten without being
    /// reported. Files that become relevant through a pattern change are
    /// reported as added on their first change.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] and keeps the current filter
    /// if a pattern does not compile.
    pub fn ignore<I, S>(&mut self, patterns: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = self.options.clone();
        options.ignore.extend(patterns.into_iter().map(Into::into));
        self.apply_patterns(options)
    }

    /// Replaces every ignore pattern, defaults included. Clears `only`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] and keeps the current filter
    /// if a pattern does not compile.
    pub fn replace_ignore<I, S>(&mut self, patterns: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = self.options.clone();
        options.replace_ignore = Some(patterns.into_iter().map(Into::into).collect());
        options.ignore.clear();
        options.only.clear();
        self.apply_patterns(options)
    }

    /// Restricts reported files to those matching `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] and keeps the current filter
    /// if a pattern does not compile.
    pub fn only<I, S>(&mut self, patterns: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = self.options.clone();
        options.only = patterns.into_iter().map(Into::into).collect();
        self.apply_patterns(options)
    }

    fn apply_patterns(&mut self, options: ListenOptions) -> Result<(), ConfigError> {
        let mut silencer = Silencer::from_options(&options)?;
        if let Some(filter) = &self.filter {
            silencer = silencer.with_filter(Arc::clone(filter));
        }

        // Files the new patterns silence would otherwise linger in the record.
        let pruned = self.record.prune(&silencer);
        tracing::debug!(
            ignore = silencer.ignore_patterns().len(),
            only = silencer.only_patterns().len(),
            pruned,
            "Silencer rebuilt"
        );
        self.silencer.replace(silencer);
        self.options = options;
        Ok(())
    }

    /// Returns the effective options.
    #[must_use]
    pub fn options(&self) -> &ListenOptions {
        &self.options
    }

    /// Returns the configured directories, reachable or not.
    #[must_use]
    pub fn directories(&self) -> &WatchRoots {
        &self.roots
    }

    /// Returns the backend currently delivering events.
    #[must_use]
    pub fn backend(&self) -> Option<Backend> {
        self.adapter.active()
    }

    /// Returns the current record.
    #[must_use]
    pub fn record(&self) -> Arc<Record> {
        Arc::clone(&self.record)
    }

    /// Returns the current silencer.
    #[must_use]
    pub fn silencer(&self) -> Arc<Silencer> {
        self.silencer.current()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

async fn build_record(record: &Arc<Record>, silencer: Arc<Silencer>) -> Result<usize, ListenError> {
    let record = Arc::clone(record);
    tokio::task::spawn_blocking(move || record.build(&silencer))
        .await
        .map_err(|err| ListenError::worker_fault("record", err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::silencer::EntryKind;
    use camino::Utf8PathBuf;
    use std::fs;

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().canonicalize().unwrap()).unwrap();
        (temp, root)
    }

    #[test]
    fn test_new_requires_directories() {
        let err = Listener::new(Vec::<&str>::new(), ListenOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigError::NoDirectories));
    }

    #[test]
    fn test_new_rejects_bad_pattern() {
        let (_temp, root) = temp_root();
        let options = ListenOptions {
            ignore: vec!["(".to_owned()],
            ..ListenOptions::default()
        };
        let err = Listener::new([&root], options).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_pattern_setters() {
        let (_temp, root) = temp_root();
        let mut listener = Listener::new([&root], ListenOptions::default()).unwrap();

        listener.ignore([r"\.log$"]).unwrap();
        assert!(listener.silencer().is_silenced("a.log", EntryKind::File));
        assert!(listener.silencer().is_silenced("a.tmp", EntryKind::File));

        listener.only([r"\.rb$"]).unwrap();
        assert!(listener.silencer().is_silenced("a.txt", EntryKind::File));
        assert!(listener.silencer().is_relevant("a.rb", EntryKind::File));

        listener.replace_ignore([r"\.rb$"]).unwrap();
        assert!(listener.options().only.is_empty());
        assert!(listener.silencer().is_relevant("a.tmp", EntryKind::File));
        assert!(listener.silencer().is_silenced("a.rb", EntryKind::File));
    }

    #[test]
    fn test_bad_pattern_keeps_previous_filter() {
        let (_temp, root) = temp_root();
        let mut listener = Listener::new([&root], ListenOptions::default()).unwrap();

        assert!(listener.ignore(["["]).is_err());
        assert!(listener.options().ignore.is_empty());
        assert!(listener.silencer().is_relevant("a.txt", EntryKind::File));
    }

    struct NoSecrets;

    impl PathFilter for NoSecrets {
        fn is_relevant(&self, relative: &str, _kind: EntryKind) -> bool {
            !relative.ends_with(".key")
        }
    }

    #[test]
    fn test_filter_survives_pattern_changes() {
        let (_temp, root) = temp_root();
        let mut listener = Listener::new([&root], ListenOptions::default())
            .unwrap()
            .with_filter(NoSecrets);
        assert!(listener.silencer().is_silenced("id.key", EntryKind::File));

        listener.replace_ignore(Vec::<String>::new()).unwrap();
        assert!(listener.silencer().is_silenced("id.key", EntryKind::File));
        assert!(listener.silencer().is_relevant("a.tmp", EntryKind::File));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_stop_lifecycle() {
        let (_temp, root) = temp_root();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("b.tmp"), "b").unwrap();

        let mut listener = Listener::new([&root], ListenOptions::default()).unwrap();
        assert!(!listener.is_listening());
        assert!(!listener.is_paused());

        listener.start(CancellationToken::new()).await.unwrap();
        assert!(listener.is_listening());
        assert_eq!(listener.record().len(), 1);
        assert!(listener.record().contains(&root.join("a.txt")));

        // Starting again is a no-op.
        listener.start(CancellationToken::new()).await.unwrap();
        assert!(listener.is_listening());

        listener.pause();
        assert!(listener.is_paused());
        assert!(!listener.is_listening());
        listener.unpause().await.unwrap();
        assert!(listener.is_listening());

        listener.stop().await;
        assert!(!listener.is_listening());
        // Stopping twice is a no-op.
        listener.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ignore_prunes_running_record() {
        let (_temp, root) = temp_root();
        fs::write(root.join("a.log"), "a").unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();

        let mut listener = Listener::new([&root], ListenOptions::default()).unwrap();
        listener.start(CancellationToken::new()).await.unwrap();
        assert_eq!(listener.record().len(), 2);

        listener.ignore([r"\.log$"]).unwrap();
        assert_eq!(listener.record().paths(), vec![root.join("b.txt")]);

        let fresh = Record::new(listener.record().roots().clone());
        fresh.build(&listener.silencer()).unwrap();
        assert_eq!(listener.record().paths(), fresh.paths());
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_without_reachable_directories() {
        let (temp, root) = temp_root();
        let missing = root.join("missing");
        let mut listener = Listener::new([&missing], ListenOptions::default()).unwrap();
        drop(temp);

        let err = listener.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ListenError::Config(ConfigError::NoDirectories)));
        assert!(!listener.is_listening());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_skips_missing_directory() {
        let (_temp, root) = temp_root();
        let present = root.join("present");
        fs::create_dir(&present).unwrap();
        fs::write(present.join("a.txt"), "a").unwrap();

        let mut listener =
            Listener::new([present.clone(), root.join("absent")], ListenOptions::default())
                .unwrap();
        assert_eq!(listener.directories().len(), 2);

        listener.start(CancellationToken::new()).await.unwrap();
        assert!(listener.is_listening());
        assert_eq!(listener.record().roots().len(), 1);
        listener.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_returns_on_cancel() {
        let (_temp, root) = temp_root();
        let cancel = CancellationToken::new();
        let mut listener = Listener::new([&root], ListenOptions::default()).unwrap();
        listener.start(cancel.clone()).await.unwrap();

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(10), listener.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn test_wait_without_start_returns() {
        let (_temp, root) = temp_root();
        let mut listener = Listener::new([&root], ListenOptions::default()).unwrap();
        listener.wait().await.unwrap();
    }
}
