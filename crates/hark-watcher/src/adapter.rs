//! Bridge from OS change notifications to raw signals.
//!
//! The [`Adapter`] owns one `notify` watcher covering every watch root and
//! turns each backend event into [`RawSignal`]s routed into the change pool.
//! It does no classification and no filtering.
//!
//! # Backend selection
//!
//! ```text
//! force_polling? ──yes──────────────────────────────► PollWatcher
//!       │ no
//!       ▼
//! native facility? ──no──► fallback warning ────────► PollWatcher
//!       │ yes
//!       ▼
//! RecommendedWatcher ──init fails──► fallback warning ► PollWatcher
//! ```
//!
//! The fallback warning is emitted at most once per listener.
//!
//! The watcher delivers events on its own thread. Routing is a non-blocking
//! send on an unbounded channel, so a slow change stage never stalls the
//! backend.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::{PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hark_core::{ListenOptions, PollingFallbackMessage, WatchRoots};

use crate::change::ChangePool;
use crate::error::ListenError;
use crate::events::{RawSignal, signals_from_event};

/// A change-notification facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Linux inotify.
    Inotify,
    /// macOS `FSEvents`.
    FsEvents,
    /// BSD kqueue.
    Kqueue,
    /// Windows `ReadDirectoryChangesW`.
    ReadDirectoryChanges,
    /// Periodic rescans. Works everywhere.
    Polling,
}

impl Backend {
    /// Returns the native facility for the current platform, if any.
    #[must_use]
    pub const fn detect() -> Option<Self> {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            Some(Self::Inotify)
        } else if cfg!(target_os = "macos") {
            Some(Self::FsEvents)
        } else if cfg!(target_os = "windows") {
            Some(Self::ReadDirectoryChanges)
        } else if cfg!(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            target_os = "ios"
        )) {
            Some(Self::Kqueue)
        } else {
            None
        }
    }

    /// Returns the backend to try first.
    #[must_use]
    pub const fn select(force_polling: bool) -> Self {
        if force_polling {
            return Self::Polling;
        }
        match Self::detect() {
            Some(native) => native,
            None => Self::Polling,
        }
    }

    /// Returns `true` for OS-level notification facilities.
    #[inline]
    #[must_use]
    pub const fn is_native(self) -> bool {
        !matches!(self, Self::Polling)
    }

    /// Returns a short lowercase name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Inotify => "inotify",
            Self::FsEvents => "fsevents",
            Self::Kqueue => "kqueue",
            Self::ReadDirectoryChanges => "read-directory-changes",
            Self::Polling => "polling",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Adapter state that survives restarts.
#[derive(Debug, Default)]
pub struct AdapterState {
    active: Mutex<Option<Backend>>,
    fallback_warned: AtomicBool,
    started: AtomicBool,
}

impl AdapterState {
    /// Returns the backend currently delivering events.
    #[must_use]
    pub fn active(&self) -> Option<Backend> {
        *self.active.lock()
    }

    /// Returns `true` once the polling fallback warning has been emitted.
    #[must_use]
    pub fn fallback_warned(&self) -> bool {
        self.fallback_warned.load(Ordering::Acquire)
    }

    /// Forgets the previous session so the next run does not rescan.
    ///
    /// The fallback warning flag is kept.
    pub(crate) fn begin_session(&self) {
        self.started.store(false, Ordering::Release);
        *self.active.lock() = None;
    }
}

/// Watches the roots and routes raw signals into the change pool.
#[derive(Debug, Clone)]
pub struct Adapter {
    roots: WatchRoots,
    preferred: Backend,
    forced: bool,
    poll_interval: Duration,
    fallback_message: PollingFallbackMessage,
    pool: ChangePool,
    state: Arc<AdapterState>,
}

type BoxedWatcher = Box<dyn Watcher + Send>;

impl Adapter {
    /// Creates an adapter for `roots`.
    #[must_use]
    pub fn new(
        roots: WatchRoots,
        options: &ListenOptions,
        pool: ChangePool,
        state: Arc<AdapterState>,
    ) -> Self {
        Self {
            roots,
            preferred: Backend::select(options.force_polling),
            forced: options.force_polling,
            poll_interval: options.poll_interval(),
            fallback_message: options.polling_fallback_message.clone(),
            pool,
            state,
        }
    }

    /// Watches until cancelled.
    ///
    /// After a restart every root is rescanned, since events may have been
    /// missed while the adapter was down.
    ///
    /// # Errors
    ///
    /// Returns [`ListenError::Notify`] if no backend can be started or if the
    /// running backend reports an error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ListenError> {
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let (backend, watcher) = self.connect(&error_tx)?;
        *self.state.active.lock() = Some(backend);

        if self.state.started.swap(true, Ordering::AcqRel) {
            for root in &self.roots {
                self.pool.route(RawSignal::dir(root.clone()).recursive())?;
            }
        }
        tracing::info!(backend = %backend, roots = self.roots.len(), "Adapter started");

        let outcome = tokio::select! {
            () = cancel.cancelled() => Ok(()),
            Some(err) = error_rx.recv() => Err(ListenError::Notify(err)),
        };

        drop(watcher);
        *self.state.active.lock() = None;
        tracing::info!(backend = %backend, "Adapter stopped");
        outcome
    }

    fn connect(
        &self,
        errors: &mpsc::UnboundedSender<notify::Error>,
    ) -> Result<(Backend, BoxedWatcher), ListenError> {
        if self.preferred.is_native() {
            match self.watch(self.preferred, errors) {
                Ok(watcher) => return Ok((self.preferred, watcher)),
                Err(err) => {
                    tracing::debug!(backend = %self.preferred, error = %err, "Native backend failed");
                    self.warn_fallback();
                }
            }
        } else if !self.forced {
            self.warn_fallback();
        }

        let watcher = self.watch(Backend::Polling, errors)?;
        Ok((Backend::Polling, watcher))
    }

    fn watch(
        &self,
        backend: Backend,
        errors: &mpsc::UnboundedSender<notify::Error>,
    ) -> Result<BoxedWatcher, notify::Error> {
        let handler = self.handler(errors.clone());
        let mut watcher: BoxedWatcher = if backend.is_native() {
            Box::new(RecommendedWatcher::new(handler, notify::Config::default())?)
        } else {
            let config = notify::Config::default().with_poll_interval(self.poll_interval);
            Box::new(PollWatcher::new(handler, config)?)
        };

        for root in &self.roots {
            watcher.watch(root.as_std_path(), RecursiveMode::Recursive)?;
        }
        Ok(watcher)
    }

    fn handler(
        &self,
        errors: mpsc::UnboundedSender<notify::Error>,
    ) -> impl FnMut(notify::Result<notify::Event>) + Send + 'static {
        let pool = self.pool.clone();
        let roots = self.roots.clone();

        move |result| match result {
            Ok(event) => {
                if event.need_rescan() {
                    tracing::debug!("Backend requested a rescan");
                    for root in &roots {
                        if pool.route(RawSignal::dir(root.clone()).recursive()).is_err() {
                            return;
                        }
                    }
                }
                for signal in signals_from_event(&event) {
                    if pool.route(signal).is_err() {
                        tracing::trace!("Change pool closed, dropping event");
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = errors.send(err);
            }
        }
    }

    fn warn_fallback(&self) {
        let Some(text) = self.fallback_message.text() else {
            return;
        };
        if !self.state.fallback_warned.swap(true, Ordering::AcqRel) {
            tracing::warn!("{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SignalKind;
    use camino::Utf8PathBuf;
    use std::fs;

    fn root_of(temp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().canonicalize().unwrap()).unwrap()
    }

    fn polling_options() -> ListenOptions {
        ListenOptions {
            force_polling: true,
            poll_interval_ms: 50,
            ..ListenOptions::default()
        }
    }

    #[test]
    fn test_select() {
        assert_eq!(Backend::select(true), Backend::Polling);
        assert_eq!(
            Backend::select(false),
            Backend::detect().unwrap_or(Backend::Polling)
        );
        assert!(!Backend::Polling.is_native());
        assert!(Backend::Inotify.is_native());
        assert_eq!(Backend::FsEvents.to_string(), "fsevents");
    }

    #[test]
    fn test_fallback_warning_is_emitted_once() {
        let temp = tempfile::tempdir().unwrap();
        let (pool, _inboxes) = ChangePool::new(1);
        let state = Arc::new(AdapterState::default());
        let adapter = Adapter::new(
            WatchRoots::from_canonical(vec![root_of(&temp)]),
            &ListenOptions::default(),
            pool,
            Arc::clone(&state),
        );

        assert!(!state.fallback_warned());
        adapter.warn_fallback();
        adapter.warn_fallback();
        assert!(state.fallback_warned());
    }

    #[test]
    fn test_silent_fallback_is_not_recorded() {
        let temp = tempfile::tempdir().unwrap();
        let (pool, _inboxes) = ChangePool::new(1);
        let state = Arc::new(AdapterState::default());
        let options = ListenOptions {
            polling_fallback_message: PollingFallbackMessage::Silent,
            ..ListenOptions::default()
        };
        let adapter = Adapter::new(
            WatchRoots::from_canonical(vec![root_of(&temp)]),
            &options,
            pool,
            Arc::clone(&state),
        );

        adapter.warn_fallback();
        assert!(!state.fallback_warned());
    }

    #[tokio::test]
    async fn test_forced_polling_routes_signals() {
        let temp = tempfile::tempdir().unwrap();
        let root = root_of(&temp);
        let (pool, inboxes) = ChangePool::new(1);
        let state = Arc::new(AdapterState::default());
        let adapter = Adapter::new(
            WatchRoots::from_canonical(vec![root.clone()]),
            &polling_options(),
            pool,
            Arc::clone(&state),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(adapter.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(state.active(), Some(Backend::Polling));
        // Forced polling is not a fallback.
        assert!(!state.fallback_warned());

        fs::write(root.join("a.txt"), "a").unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(signal) = inboxes[0].recv().await {
                    if signal.path == root.join("a.txt") {
                        return signal;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_ne!(signal.kind, SignalKind::Dir);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(state.active(), None);
    }

    #[tokio::test]
    async fn test_restart_rescans_roots() {
        let temp = tempfile::tempdir().unwrap();
        let root = root_of(&temp);
        let (pool, inboxes) = ChangePool::new(1);
        let state = Arc::new(AdapterState::default());
        let adapter = Adapter::new(
            WatchRoots::from_canonical(vec![root.clone()]),
            &polling_options(),
            pool,
            Arc::clone(&state),
        );

        for _ in 0..2 {
            let cancel = CancellationToken::new();
            cancel.cancel();
            adapter.clone().run(cancel).await.unwrap();
        }

        let signal = tokio::time::timeout(Duration::from_secs(5), inboxes[0].recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.path, root);
        assert_eq!(signal.kind, SignalKind::Dir);
        assert!(signal.recursive);
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let temp = tempfile::tempdir().unwrap();
        let missing = root_of(&temp).join("missing");
        let (pool, _inboxes) = ChangePool::new(1);
        let adapter = Adapter::new(
            WatchRoots::from_canonical(vec![missing]),
            &polling_options(),
            pool,
            Arc::new(AdapterState::default()),
        );

        let err = adapter.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ListenError::Notify(_)));
        assert!(err.is_recoverable());
    }
}
