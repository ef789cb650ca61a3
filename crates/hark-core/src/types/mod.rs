//! Domain types for the hark change listener.
//!
//! # Module Organization
//!
//! - [`roots`] - The canonical set of watched directories
//! - [`change`] - Change classification and batches
//!
//! All public types are re-exported here and at the crate root:
//!
//! ```
//! use hark_core::{ChangeKind, ChangeSet, Changes, WatchRoots};
//! ```

pub mod change;
pub mod roots;

pub use change::{ChangeKind, ChangeSet, Changes};
pub use roots::WatchRoots;
