//! Reconciles a local file tree with the files recorded by a [`Store`](crate::store::Store).
//!
//! A sync run hashes every non-ignored file under the root, diffs the result
//! against the store's `external_id -> hash` snapshot, then uploads changed
//! files and deletes vanished ones under a single concurrency limit. [`watch`]
//! follows that pass with per-file updates driven by filesystem events.

mod debouncer;
pub mod executor;
pub mod files;
pub mod plan;
pub mod upload;
pub mod watch;

use std::path::PathBuf;

use thiserror::Error;

pub use executor::{initial_sync, SyncOptions};
pub use files::IgnoreFileSystem;
pub use watch::watch;

/// Default cap on in-flight upload/delete tasks.
pub const DEFAULT_CONCURRENCY: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend refused work because of plan limits; the whole run stops.
    #[error("{0}")]
    QuotaExceeded(String),

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("file watcher failed")]
    Watch(#[from] notify::Error),
}

impl SyncError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

/// Cumulative counters handed to the progress callback after each task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub processed: usize,
    pub uploaded: usize,
    pub deleted: usize,
    pub errors: usize,
    pub total: usize,
    pub file_path: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub processed: usize,
    pub uploaded: usize,
    pub deleted: usize,
    pub errors: usize,
    pub total: usize,
}
