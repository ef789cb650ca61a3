//! Error types for the hark-watcher crate.
//!
//! This module provides the [`ListenError`] type. Every supervised unit
//! returns `Result<(), ListenError>`; the supervisor uses
//! [`ListenError::is_recoverable`] to decide between restarting the unit and
//! surfacing the error to the listener's owner.

use hark_core::ConfigError;

/// Boxed error returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while listening for changes.
///
/// # Error Recovery Strategy
///
/// - **Backend errors** ([`ListenError::Notify`]): Recoverable - the adapter is restarted
/// - **I/O errors** ([`ListenError::Io`], [`ListenError::Walk`]): Recoverable - the unit is restarted
/// - **Worker faults** ([`ListenError::WorkerFault`]): Recoverable - the unit is restarted
/// - **Non-UTF-8 path** ([`ListenError::NonUtf8Path`]): Recoverable - skip and continue
/// - **Configuration** ([`ListenError::Config`]): Fatal
/// - **Callback failure** ([`ListenError::Callback`]): Fatal - the listener stops
/// - **Restart limit** ([`ListenError::RestartLimit`]): Fatal - the listener stops
/// - **Channel closed** ([`ListenError::ChannelClosed`]): Fatal
///
/// # Examples
///
/// ```
/// use hark_watcher::ListenError;
///
/// fn handle_error(err: &ListenError) {
///     if err.is_fatal() {
///         eprintln!("listener stopped: {err}");
///     } else {
///         eprintln!("warning: {err}");
///     }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The notification backend failed to initialize or operate.
    #[error("notify backend error: {0}")]
    Notify(#[from] notify::Error),

    /// An I/O error occurred while inspecting a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Walking a watched directory failed.
    #[error("failed to walk directory: {0}")]
    Walk(#[from] ignore::Error),

    /// A path is not valid UTF-8.
    ///
    /// Paths are UTF-8 throughout. A non-UTF-8 path in an event is logged
    /// and skipped.
    #[error("path is not valid UTF-8: {}", _0.display())]
    NonUtf8Path(std::path::PathBuf),

    /// A supervised unit panicked or otherwise faulted.
    #[error("unit '{unit}' faulted: {reason}")]
    WorkerFault {
        /// Name of the faulting unit.
        unit: String,
        /// Description of the fault.
        reason: String,
    },

    /// A unit faulted more often than its restart policy allows.
    #[error("unit '{unit}' exceeded its restart limit")]
    RestartLimit {
        /// Name of the unit that gave up.
        unit: String,
        /// The fault that triggered the final restart attempt.
        #[source]
        source: Box<ListenError>,
    },

    /// The user callback returned an error or panicked.
    #[error("callback failed: {0}")]
    Callback(#[source] BoxError),

    /// An internal channel closed unexpectedly.
    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
}

impl ListenError {
    /// Creates a new [`ListenError::WorkerFault`] error.
    #[inline]
    pub fn worker_fault(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerFault {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new [`ListenError::NonUtf8Path`] error.
    #[inline]
    pub fn non_utf8_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self::NonUtf8Path(path.into())
    }

    /// Returns `true` if the failing unit may be restarted.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Notify(_)
                | Self::Io(_)
                | Self::Walk(_)
                | Self::NonUtf8Path(_)
                | Self::WorkerFault { .. }
        )
    }

    /// Returns `true` if this error must stop the listener.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns the name of the unit this error is attributed to, if any.
    #[must_use]
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::WorkerFault { unit, .. } | Self::RestartLimit { unit, .. } => Some(unit),
            Self::Config(_)
            | Self::Notify(_)
            | Self::Io(_)
            | Self::Walk(_)
            | Self::NonUtf8Path(_)
            | Self::Callback(_)
            | Self::ChannelClosed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn test_worker_fault_is_recoverable() {
        let err = ListenError::worker_fault("change-2", "panicked");
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(err.unit(), Some("change-2"));
        assert_eq!(err.to_string(), "unit 'change-2' faulted: panicked");
    }

    #[test]
    fn test_io_is_recoverable() {
        let err = ListenError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "access denied",
        ));
        assert!(err.is_recoverable());
        assert!(err.unit().is_none());
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_non_utf8_is_recoverable() {
        let err = ListenError::non_utf8_path(PathBuf::from("test"));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("not valid UTF-8"));
    }

    #[test]
    fn test_restart_limit_is_fatal_and_keeps_source() {
        let err = ListenError::RestartLimit {
            unit: "adapter".to_owned(),
            source: Box::new(ListenError::worker_fault("adapter", "boom")),
        };
        assert!(err.is_fatal());
        assert_eq!(err.unit(), Some("adapter"));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("unit 'adapter' faulted: boom"));
    }

    #[test]
    fn test_callback_error_is_fatal() {
        let err = ListenError::Callback("disk full".into());
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "callback failed: disk full");
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err = ListenError::from(ConfigError::NoDirectories);
        assert!(err.is_fatal());
        assert!(err.to_string().starts_with("no watchable directories"));
    }

    #[test]
    fn test_channel_closed() {
        let err = ListenError::ChannelClosed;
        assert!(err.is_fatal());
        assert!(err.to_string().contains("channel closed"));
    }
}
