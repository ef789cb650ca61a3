//! Core types, configuration, and errors for the hark change listener.
//!
//! This crate provides the foundational types shared by the listener engine
//! and the command-line front end:
//!
//! - [`ListenOptions`] - The recognized listener options and their defaults
//! - [`ConfigError`] - Synchronous configuration failures
//! - [`WatchRoots`] - The canonical set of watched directories
//! - [`ChangeSet`] / [`Changes`] - An open batch of classified changes and its
//!   frozen, callback-ready form
//! - Type aliases for `FxHashMap`/`FxHashSet` and path partitioning helpers

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::{ListenOptions, PollingFallbackMessage, RestartConfig};
pub use error::ConfigError;
pub use hash::{partition_of, FxHashMap, FxHashSet};
pub use types::{ChangeKind, ChangeSet, Changes, WatchRoots};
