//! Continuous sync: one full pass, then per-file updates driven by
//! filesystem events.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::debouncer::Debouncer;
use super::executor::{initial_sync, ProgressFn, SyncOptions};
use super::files::FileSystem;
use super::plan::{external_id_for, is_subpath};
use super::upload::{classify, upload_file};
use super::SyncError;
use crate::store::chunker::is_blank;
use crate::store::Store;

const EVENT_BUFFER: usize = 100;
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Uploaded,
    Deleted,
    Skipped,
}

/// Per-path event handling for one watched root.
pub struct WatchSession<'a> {
    store: &'a dyn Store,
    fs: &'a dyn FileSystem,
    store_id: &'a str,
    root: PathBuf,
    dry_run: bool,
    debouncer: Debouncer,
}

impl<'a> WatchSession<'a> {
    pub fn new(
        store: &'a dyn Store,
        fs: &'a dyn FileSystem,
        store_id: &'a str,
        root: &Path,
        dry_run: bool,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            fs,
            store_id,
            root: root.to_path_buf(),
            dry_run,
            debouncer: Debouncer::new(debounce),
        }
    }

    /// Writes are debounced; removals are applied at once.
    pub async fn handle_event(&mut self, event: Event) -> Result<(), SyncError> {
        let kind = event.kind;
        for path in event.paths {
            if !self.is_tracked(&path) {
                continue;
            }
            match &kind {
                EventKind::Modify(ModifyKind::Metadata(_)) => {}
                EventKind::Create(_) | EventKind::Modify(_) => self.debouncer.record(path),
                EventKind::Remove(_) => {
                    self.debouncer.remove(&path);
                    self.apply(&path).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Apply every change that has settled.
    pub async fn flush(&mut self) -> Result<(), SyncError> {
        if !self.debouncer.has_pending() {
            return Ok(());
        }
        for path in self.debouncer.take_ready() {
            self.apply(&path).await?;
        }
        Ok(())
    }

    fn is_tracked(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        let hidden = relative.components().any(|c| {
            matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with('.'))
        });
        is_subpath(&self.root, path) && !hidden && !self.fs.is_ignored(path, &self.root)
    }

    /// Per-file failures are logged and the watch goes on; quota stops it.
    async fn apply(&self, path: &Path) -> Result<(), SyncError> {
        match self.sync_path(path).await {
            Ok(outcome) => {
                debug!(path = %path.display(), ?outcome, "applied change");
                Ok(())
            }
            Err(err) if err.is_quota() => Err(err),
            Err(err) => {
                let message = format!("{:#}", anyhow::Error::new(err));
                warn!(path = %path.display(), error = %message, "change not applied");
                Ok(())
            }
        }
    }

    async fn sync_path(&self, path: &Path) -> Result<WatchOutcome, SyncError> {
        let external_id = external_id_for(path);
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => return Ok(WatchOutcome::Skipped),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return self.delete(&external_id).await;
            }
            Err(source) => {
                return Err(SyncError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let bytes = tokio::fs::read(path).await.map_err(|source| SyncError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if is_blank(&String::from_utf8_lossy(&bytes)) {
            return self.delete(&external_id).await;
        }

        if self.dry_run {
            info!(path = %external_id, "dry run: would upload");
            return Ok(WatchOutcome::Uploaded);
        }
        if upload_file(self.store, self.store_id, path).await? {
            Ok(WatchOutcome::Uploaded)
        } else {
            Ok(WatchOutcome::Skipped)
        }
    }

    async fn delete(&self, external_id: &str) -> Result<WatchOutcome, SyncError> {
        if self.dry_run {
            info!(path = %external_id, "dry run: would delete");
        } else {
            self.store
                .delete_file(self.store_id, external_id)
                .await
                .map_err(classify)?;
        }
        Ok(WatchOutcome::Deleted)
    }
}

/// Sync `repo_root` once, then keep the store current until interrupted.
#[instrument(skip(store, fs, on_progress), fields(root = %repo_root.display()))]
pub async fn watch(
    store: &dyn Store,
    fs: &dyn FileSystem,
    store_id: &str,
    repo_root: &Path,
    options: SyncOptions,
    debounce: Duration,
    on_progress: ProgressFn<'_>,
) -> Result<(), SyncError> {
    let result = initial_sync(store, fs, store_id, repo_root, options, on_progress).await?;
    info!(?result, "initial sync done; watching for changes");

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.blocking_send(res);
    })?;
    watcher.watch(repo_root, RecursiveMode::Recursive)?;

    let mut session = WatchSession::new(store, fs, store_id, repo_root, options.dry_run, debounce);
    let mut tick = tokio::time::interval(TICK);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Ok(event)) => session.handle_event(event).await?,
                Some(Err(err)) => warn!(error = %err, "file watch error"),
                None => return Ok(()),
            },
            _ = tick.tick() => session.flush().await?,
            _ = &mut shutdown => {
                info!("interrupted; stopping watch");
                return Ok(());
            }
        }
    }
}
