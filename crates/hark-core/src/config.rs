//! Listener configuration.
//!
//! This module provides [`ListenOptions`], the immutable set of options a
//! listener is constructed with. Every field has a documented default, so an
//! options file only needs to name the keys it overrides.
//!
//! # Debounce Window
//!
//! `latency_ms` overrides `wait_for_delay_ms` when set. The resolved window
//! is available through [`ListenOptions::debounce_window`].
//!
//! ```
//! use std::time::Duration;
//! use hark_core::ListenOptions;
//!
//! let options = ListenOptions::default();
//! assert_eq!(options.debounce_window(), Duration::from_millis(100));
//!
//! let options = ListenOptions { latency_ms: Some(250), ..ListenOptions::default() };
//! assert_eq!(options.debounce_window(), Duration::from_millis(250));
//! ```

use std::borrow::Cow;
use std::num::NonZeroUsize;
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default debounce window in milliseconds.
pub const DEFAULT_WAIT_FOR_DELAY_MS: u64 = 100;

/// Default rescan interval of the polling backend in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Upper bound for the automatically sized change worker pool.
const MAX_DEFAULT_WORKERS: usize = 8;

/// Diagnostic emitted when the listener falls back to the polling backend.
const DEFAULT_FALLBACK_MESSAGE: &str = "hark: native change notification is unavailable on this \
     system, falling back to polling. Changes may take up to one poll interval to be noticed.";

/// What to say when the native backend is unavailable and polling is used.
///
/// # Examples
///
/// ```
/// use hark_core::PollingFallbackMessage;
///
/// assert!(PollingFallbackMessage::Default.text().is_some());
/// assert_eq!(PollingFallbackMessage::Silent.text(), None);
/// assert_eq!(
///     PollingFallbackMessage::Custom("slow disk".to_owned()).text().as_deref(),
///     Some("slow disk"),
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingFallbackMessage {
    /// Emit the built-in warning.
    #[default]
    Default,
    /// Emit the given text instead of the built-in warning.
    Custom(String),
    /// Emit nothing.
    Silent,
}

impl PollingFallbackMessage {
    /// Returns the diagnostic text, or `None` when suppressed.
    #[must_use]
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Default => Some(Cow::Borrowed(DEFAULT_FALLBACK_MESSAGE)),
            Self::Custom(text) => Some(Cow::Borrowed(text.as_str())),
            Self::Silent => None,
        }
    }
}

/// Restart bounds for supervised units.
///
/// A unit may be restarted at most `max_restarts` times within any window of
/// `within_ms` milliseconds. One more failure inside the window is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Maximum restarts tolerated inside the window.
    pub max_restarts: u32,

    /// Length of the sliding window in milliseconds.
    pub within_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            within_ms: 5000,
        }
    }
}

impl RestartConfig {
    /// Returns the sliding window as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.within_ms)
    }
}

/// Options recognized by a listener.
///
/// Resolved once at construction. Unspecified keys take the defaults below.
///
/// | key                        | default                |
/// |----------------------------|------------------------|
/// | `debug`                    | `false`                |
/// | `latency_ms`               | `None`                 |
/// | `wait_for_delay_ms`        | `100`                  |
/// | `force_polling`            | `false`                |
/// | `polling_fallback_message` | `default`              |
/// | `poll_interval_ms`         | `1000`                 |
/// | `ignore`                   | `[]`                   |
/// | `ignore!`                  | unset                  |
/// | `only`                     | `[]`                   |
/// | `workers`                  | available parallelism  |
/// | `restart`                  | 3 restarts within 5 s  |
///
/// # Examples
///
/// ```
/// use hark_core::ListenOptions;
///
/// let options: ListenOptions =
///     serde_json::from_str(r#"{"force_polling": true, "ignore!": ["\\.log$"]}"#).unwrap();
/// assert!(options.force_polling);
/// assert_eq!(options.replace_ignore.as_deref(), Some(&["\\.log$".to_owned()][..]));
/// assert_eq!(options.wait_for_delay_ms, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Log every classified change at debug level.
    pub debug: bool,

    /// Debounce window override in milliseconds.
    pub latency_ms: Option<u64>,

    /// Default debounce window in milliseconds.
    pub wait_for_delay_ms: u64,

    /// Skip native backend detection and always poll.
    pub force_polling: bool,

    /// Diagnostic used when falling back to polling.
    pub polling_fallback_message: PollingFallbackMessage,

    /// Rescan interval of the polling backend in milliseconds.
    pub poll_interval_ms: u64,

    /// Ignore patterns appended to the active ignore set.
    pub ignore: Vec<String>,

    /// Ignore patterns replacing the built-in defaults.
    ///
    /// Serialized as `ignore!`. When set, the default ignore patterns are not
    /// applied.
    #[serde(rename = "ignore!")]
    pub replace_ignore: Option<Vec<String>>,

    /// Only-patterns; when non-empty, only matching files are reported.
    pub only: Vec<String>,

    /// Size of the change worker pool.
    /// `None` means use the available parallelism, capped at 8.
    pub workers: Option<usize>,

    /// Restart bounds for supervised units.
    pub restart: RestartConfig,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            debug: false,
            latency_ms: None,
            wait_for_delay_ms: DEFAULT_WAIT_FOR_DELAY_MS,
            force_polling: false,
            polling_fallback_message: PollingFallbackMessage::Default,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ignore: Vec::new(),
            replace_ignore: None,
            only: Vec::new(),
            workers: None,
            restart: RestartConfig::default(),
        }
    }
}

impl ListenOptions {
    /// Loads options from a JSON file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON, and any error from
    /// [`validate`](Self::validate).
    pub fn from_json_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks that every option holds a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for a zero debounce window, a
    /// zero poll interval, or an empty worker pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_window().is_zero() {
            let option = if self.latency_ms.is_some() {
                "latency_ms"
            } else {
                "wait_for_delay_ms"
            };
            return Err(ConfigError::invalid_option(option, "must be greater than zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid_option(
                "poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::invalid_option(
                "workers",
                "the change pool needs at least one worker",
            ));
        }
        Ok(())
    }

    /// Returns the debounce window: `latency_ms` if set, else `wait_for_delay_ms`.
    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.latency_ms.unwrap_or(self.wait_for_delay_ms))
    }

    /// Returns the polling backend's rescan interval.
    #[inline]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the resolved change worker pool size (at least one).
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map_or(1, NonZeroUsize::get)
                .min(MAX_DEFAULT_WORKERS)
        })
        .max(1)
    }
}
