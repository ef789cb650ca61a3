//! Error types for the hark-core crate.
//!
//! This module provides the [`ConfigError`] type for configuration failures.
//! These are always fatal and are surfaced synchronously, either when a
//! listener is constructed, when it is started, or when one of its pattern
//! setters is called.

use std::path::PathBuf;

/// Errors that can occur while resolving listener configuration.
///
/// # Examples
///
/// ```
/// use hark_core::ConfigError;
///
/// let error = ConfigError::NoDirectories;
/// assert!(error.to_string().contains("no watchable directories"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// None of the configured directories exists or is a directory.
    #[error("no watchable directories: every configured path is missing or not a directory")]
    NoDirectories,

    /// A configured directory could not be resolved.
    #[error("invalid path '{}': {reason}", path.display())]
    InvalidPath {
        /// The offending path, as given.
        path: PathBuf,
        /// Explanation of why the path is invalid.
        reason: String,
    },

    /// An ignore/only pattern is not a valid regular expression.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The pattern source text.
        pattern: String,
        /// The underlying compilation error.
        #[source]
        source: regex::Error,
    },

    /// A configuration option has an invalid value.
    #[error("invalid configuration option '{option}': {reason}")]
    InvalidOption {
        /// The name of the invalid option.
        option: String,
        /// Explanation of why the option is invalid.
        reason: String,
    },

    /// An I/O error occurred while reading configuration.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an options file.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates a new [`ConfigError::InvalidPath`] error.
    #[inline]
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new [`ConfigError::InvalidOption`] error.
    #[inline]
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}
