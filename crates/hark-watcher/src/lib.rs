//! Directory change listening with batched, classified callbacks.
//!
//! This crate watches one or more directory trees and reports, after a quiet
//! period, which files were modified, added, or removed. Notifications come
//! from the platform facility through `notify` (inotify, `FSEvents`, kqueue,
//! `ReadDirectoryChangesW`), or from periodic polling when none is usable.
//!
//! # Overview
//!
//! Backend events are only hints. Every signal is verified against a
//! [`Record`] of file signatures (mtime, size, mode, and a BLAKE3 digest), so:
//!
//! - rewriting a file with identical content reports nothing,
//! - a path is reported at most once per batch,
//! - the record converges to what is on disk once activity settles.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Supervisor (restart loop)                     │
//! │                                                                      │
//! │  ┌───────────┐  route   ┌──────────────┐  record  ┌──────────────┐   │
//! │  │ Adapter   │ ───────► │ ChangeWorker │ ───────► │ ChangeSet    │   │
//! │  │ (notify)  │  by path │ pool (n)     │          │ (open batch) │   │
//! │  └───────────┘          └──────┬───────┘          └──────┬───────┘   │
//! │                                │ compare/update          │ debounce  │
//! │                                ▼                         ▼           │
//! │                         ┌──────────────┐          ┌──────────────┐   │
//! │                         │ Record       │          │ Dispatcher   │ ──┼──► callback
//! │                         │ (DashMap)    │          │              │   │
//! │                         └──────────────┘          └──────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Crate Dependencies
//!
//! ```text
//! hark-cli ──► hark-watcher ──► hark-core
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use hark_core::ListenOptions;
//! use hark_watcher::{Listener, shutdown_token};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ListenOptions {
//!         ignore: vec![r"\.log$".to_owned()],
//!         ..ListenOptions::default()
//!     };
//!
//!     let mut listener = Listener::new(["app", "lib"], options)?
//!         .with_callback(|modified, added, removed| {
//!             println!("{modified:?} {added:?} {removed:?}");
//!             Ok(())
//!         });
//!
//!     listener.start(shutdown_token()).await?;
//!     listener.wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Configuration problems surface synchronously from [`Listener::new`] as
//! [`hark_core::ConfigError`]. Runtime problems are [`ListenError`]s:
//! recoverable ones restart the failing unit, fatal ones end
//! [`Listener::wait`].
//!
//! ```
//! use hark_watcher::ListenError;
//!
//! fn describe(err: &ListenError) -> &'static str {
//!     if err.is_fatal() { "listener stopped" } else { "unit restarted" }
//! }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod adapter;
pub mod change;
pub mod error;
pub mod events;
pub mod listener;
pub mod record;
pub mod shutdown;
pub mod silencer;
pub mod supervisor;

pub use adapter::{Adapter, AdapterState, Backend};
pub use change::{Callback, ChangeContext, ChangePool, ChangeWorker, Dispatcher};
pub use error::{BoxError, ListenError};
pub use events::{RawSignal, SignalKind};
pub use listener::Listener;
pub use record::{FileMeta, Record};
pub use shutdown::shutdown_token;
pub use silencer::{CompositeFilter, DEFAULT_IGNORE, EntryKind, PathFilter, Silencer};
pub use supervisor::{RestartPolicy, Supervisor};
