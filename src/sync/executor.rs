use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use super::files::FileSystem;
use super::plan::{external_id_for, list_store_file_hashes, LocalFile, LocalState, SyncPlan};
use super::upload::{classify, upload_file};
use super::{SyncError, SyncProgress, SyncResult, DEFAULT_CONCURRENCY};
use crate::hash::content_hash;
use crate::store::chunker::is_blank;
use crate::store::Store;

pub type ProgressFn<'a> = &'a (dyn Fn(&SyncProgress) + Send + Sync);

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Count the work without touching the store.
    pub dry_run: bool,
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Bring the store in line with every non-ignored file under `repo_root`.
///
/// Per-file failures are counted and reported through `on_progress`; the run
/// carries on. A quota failure stops new work, waits for in-flight tasks and
/// then surfaces as [`SyncError::QuotaExceeded`].
#[instrument(skip(store, fs, on_progress), fields(root = %repo_root.display()))]
pub async fn initial_sync(
    store: &dyn Store,
    fs: &dyn FileSystem,
    store_id: &str,
    repo_root: &Path,
    options: SyncOptions,
    on_progress: ProgressFn<'_>,
) -> Result<SyncResult, SyncError> {
    let snapshot = list_store_file_hashes(store, store_id).await?;
    let files: Vec<PathBuf> = fs
        .get_files(repo_root)?
        .into_iter()
        .filter(|path| !fs.is_ignored(path, repo_root))
        .collect();

    let local: Vec<LocalFile> = stream::iter(files)
        .map(hash_local_file)
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let plan = SyncPlan::compute(&snapshot, local, repo_root);
    info!(
        upload = plan.to_upload.len(),
        delete = plan.to_delete.len(),
        unchanged = plan.unchanged,
        dry_run = options.dry_run,
        "sync plan ready"
    );

    execute(store, store_id, plan, options, on_progress).await
}

async fn hash_local_file(path: PathBuf) -> LocalFile {
    let state = match tokio::fs::read(&path).await {
        Ok(bytes) if is_blank(&String::from_utf8_lossy(&bytes)) => LocalState::Empty,
        Ok(bytes) => LocalState::Hashed(content_hash(&bytes)),
        Err(err) => LocalState::Unreadable(err.to_string()),
    };
    LocalFile { path, state }
}

/// Run a precomputed plan under one concurrency limit.
pub async fn execute(
    store: &dyn Store,
    store_id: &str,
    plan: SyncPlan,
    options: SyncOptions,
    on_progress: ProgressFn<'_>,
) -> Result<SyncResult, SyncError> {
    let tally = Tally::new(plan.total(), plan.unchanged, on_progress);
    for (path, reason) in &plan.unreadable {
        tally.record(&external_id_for(path), Outcome::Failed(reason.clone()));
    }

    let executor = Executor {
        store,
        store_id,
        dry_run: options.dry_run,
        limiter: Semaphore::new(options.concurrency.max(1)),
        quota: OnceLock::new(),
        tally,
    };

    let tasks = plan
        .to_upload
        .iter()
        .map(|path| Task::Upload(path))
        .chain(plan.to_delete.iter().map(|id| Task::Delete(id)));
    join_all(tasks.map(|task| executor.run(task))).await;

    let Executor { quota, tally, .. } = executor;
    let result = tally.finish();
    match quota.into_inner() {
        Some(message) => {
            warn!(?result, "sync stopped: {message}");
            Err(SyncError::QuotaExceeded(message))
        }
        None => {
            info!(?result, "sync finished");
            Ok(result)
        }
    }
}

#[derive(Clone, Copy)]
enum Task<'p> {
    Upload(&'p Path),
    Delete(&'p str),
}

enum Outcome {
    Uploaded,
    NotUploaded,
    Deleted,
    Failed(String),
    QuotaHit(String),
    Skipped,
}

struct Executor<'a> {
    store: &'a dyn Store,
    store_id: &'a str,
    dry_run: bool,
    limiter: Semaphore,
    quota: OnceLock<String>,
    tally: Tally<'a>,
}

impl Executor<'_> {
    async fn run(&self, task: Task<'_>) {
        // Closed only on drop, which cannot happen while tasks borrow it.
        let Ok(_permit) = self.limiter.acquire().await else {
            return;
        };

        let external_id = match task {
            Task::Upload(path) => external_id_for(path),
            Task::Delete(id) => id.to_string(),
        };
        if self.quota.get().is_some() {
            self.tally.record(&external_id, Outcome::Skipped);
            return;
        }

        let outcome = match task {
            Task::Upload(_) if self.dry_run => {
                info!(path = %external_id, "dry run: would upload");
                Outcome::Uploaded
            }
            Task::Delete(_) if self.dry_run => {
                info!(path = %external_id, "dry run: would delete");
                Outcome::Deleted
            }
            Task::Upload(path) => match upload_file(self.store, self.store_id, path).await {
                Ok(true) => Outcome::Uploaded,
                Ok(false) => Outcome::NotUploaded,
                Err(err) => self.failure(err),
            },
            Task::Delete(id) => match self.store.delete_file(self.store_id, id).await {
                Ok(()) => Outcome::Deleted,
                Err(err) => self.failure(classify(err)),
            },
        };
        self.tally.record(&external_id, outcome);
    }

    fn failure(&self, err: SyncError) -> Outcome {
        match err {
            SyncError::QuotaExceeded(message) => {
                // First writer wins; later quota errors carry the same meaning.
                let _ = self.quota.set(message.clone());
                Outcome::QuotaHit(message)
            }
            other => Outcome::Failed(format!("{:#}", anyhow::Error::new(other))),
        }
    }
}

/// Counters plus the progress callback, updated together so callbacks are serialized.
struct Tally<'a> {
    counters: Mutex<SyncResult>,
    on_progress: ProgressFn<'a>,
}

impl<'a> Tally<'a> {
    fn new(total: usize, already_processed: usize, on_progress: ProgressFn<'a>) -> Self {
        Self {
            counters: Mutex::new(SyncResult {
                processed: already_processed,
                total,
                ..SyncResult::default()
            }),
            on_progress,
        }
    }

    fn record(&self, file_path: &str, outcome: Outcome) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.processed += 1;

        let last_error = match outcome {
            Outcome::Skipped => return,
            Outcome::Uploaded => {
                counters.uploaded += 1;
                None
            }
            Outcome::NotUploaded => None,
            Outcome::Deleted => {
                counters.deleted += 1;
                None
            }
            Outcome::Failed(message) => {
                counters.errors += 1;
                Some(message)
            }
            Outcome::QuotaHit(message) => Some(message),
        };

        (self.on_progress)(&SyncProgress {
            processed: counters.processed,
            uploaded: counters.uploaded,
            deleted: counters.deleted,
            errors: counters.errors,
            total: counters.total,
            file_path: file_path.to_string(),
            last_error,
        });
    }

    fn finish(self) -> SyncResult {
        self.counters
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::store::memory::{local_store, MemoryStore};
    use crate::store::{SearchFilters, SearchOptions};
    use crate::sync::files::IgnoreFileSystem;

    fn quiet(_: &SyncProgress) {}

    fn write_files(root: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            fs::write(root.join(name), content).expect("write");
        }
    }

    fn id(root: &Path, name: &str) -> String {
        root.join(name).to_string_lossy().into_owned()
    }

    async fn sync(
        store: &dyn Store,
        root: &Path,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        initial_sync(
            store,
            &IgnoreFileSystem::default(),
            "s",
            root,
            options,
            &quiet,
        )
        .await
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("a.txt", "a\n"), ("b.txt", "b\n"), ("c.txt", "c\n")]);
        let store = MemoryStore::default();

        let first = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("first sync");
        assert_eq!(first.uploaded, 3);

        let second = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("second sync");
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.deleted, 0);
        assert_eq!(second.processed, 3);
        assert_eq!(store.upload_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn changed_file_is_reuploaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("a.txt", "v1\n")]);
        let store = MemoryStore::default();
        sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");

        write_files(dir.path(), &[("a.txt", "v2\n")]);
        let result = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");

        assert_eq!(result.uploaded, 1);
        assert_eq!(
            store.hash_of(&id(dir.path(), "a.txt")),
            Some(content_hash(b"v2\n"))
        );
    }

    #[tokio::test]
    async fn deletions_stay_inside_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("kept.txt", "k\n")]);
        let store = MemoryStore::default();
        store.insert("/other/project/a.txt", "h");
        store.insert(&id(dir.path(), "gone.txt"), "h");

        let result = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");

        assert_eq!(result.deleted, 1);
        assert!(store.hash_of("/other/project/a.txt").is_some());
        assert!(store.hash_of(&id(dir.path(), "gone.txt")).is_none());
    }

    #[tokio::test]
    async fn dry_run_counts_without_mutating() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("a.txt", "a\n"), ("b.txt", "b\n"), ("c.txt", "c\n")]);
        let store = MemoryStore::default();
        store.insert(&id(dir.path(), "stale.txt"), "h");

        let result = sync(
            &store,
            dir.path(),
            SyncOptions {
                dry_run: true,
                ..SyncOptions::default()
            },
        )
        .await
        .expect("dry run");

        assert_eq!(
            (result.uploaded, result.deleted, result.errors),
            (3, 1, 0)
        );
        assert_eq!(result.processed, result.total);
        assert_eq!(store.upload_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn quota_failure_aborts_remaining_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let names = ["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"];
        let store = MemoryStore::default();
        for name in names {
            write_files(dir.path(), &[(name, "content\n")]);
            store.fail_upload(&id(dir.path(), name), "Free tier quota exceeded");
        }

        let progress = Mutex::new(Vec::new());
        let record = |p: &SyncProgress| progress.lock().expect("lock").push(p.clone());
        let err = initial_sync(
            &store,
            &IgnoreFileSystem::default(),
            "s",
            dir.path(),
            SyncOptions {
                dry_run: false,
                concurrency: 1,
            },
            &record,
        )
        .await
        .expect_err("quota should abort");

        assert!(err.is_quota());
        assert_eq!(store.upload_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 0);

        let progress = progress.into_inner().expect("lock");
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].errors, 0);
        assert!(progress[0]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("Free tier")));
    }

    #[tokio::test]
    async fn empty_files_are_never_uploaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("empty.txt", ""), ("a.txt", "a\n")]);
        let store = MemoryStore::default();

        let first = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");
        let second = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");

        assert_eq!(first.uploaded, 1);
        assert_eq!(second.uploaded, 0);
        assert_eq!(store.upload_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_file_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("a.txt", "a\n"), ("b.txt", "b\n"), ("c.txt", "c\n")]);
        let store = MemoryStore::default();
        store.fail_upload(&id(dir.path(), "b.txt"), "connection reset");

        let progress = Mutex::new(Vec::new());
        let record = |p: &SyncProgress| progress.lock().expect("lock").push(p.clone());
        let result = initial_sync(
            &store,
            &IgnoreFileSystem::default(),
            "s",
            dir.path(),
            SyncOptions::default(),
            &record,
        )
        .await
        .expect("sync");

        assert_eq!((result.uploaded, result.errors, result.processed), (2, 1, 3));
        let failed: Vec<_> = progress
            .into_inner()
            .expect("lock")
            .into_iter()
            .filter(|p| p.last_error.is_some())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].file_path, id(dir.path(), "b.txt"));
    }

    #[tokio::test]
    async fn in_flight_tasks_never_exceed_the_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..12 {
            write_files(dir.path(), &[(format!("f{i}.txt").as_str(), format!("{i}\n").as_str())]);
        }
        let store = MemoryStore::default();
        store.set_latency(Duration::from_millis(5));

        let result = sync(
            &store,
            dir.path(),
            SyncOptions {
                dry_run: false,
                concurrency: 3,
            },
        )
        .await
        .expect("sync");

        assert_eq!(result.uploaded, 12);
        assert!(store.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn progress_counts_are_monotonic() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..8 {
            write_files(dir.path(), &[(format!("f{i}.txt").as_str(), format!("{i}\n").as_str())]);
        }
        let store = MemoryStore::default();

        let seen = Mutex::new(Vec::new());
        let record = |p: &SyncProgress| seen.lock().expect("lock").push(p.processed);
        let result = initial_sync(
            &store,
            &IgnoreFileSystem::default(),
            "s",
            dir.path(),
            SyncOptions::default(),
            &record,
        )
        .await
        .expect("sync");

        let seen = seen.into_inner().expect("lock");
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
        assert_eq!(result.processed, result.total);
    }

    #[tokio::test]
    async fn local_store_reaches_a_fixed_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("a.rs", "fn a() {}\n"), ("blank.txt", "   \n\n")]);
        fs::write(dir.path().join("menu.txt"), b"caf\xe9 menu\nprix\n").expect("write");
        let (_, store) = local_store(100);

        let first = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("first sync");
        assert_eq!((first.uploaded, first.errors, first.processed), (2, 0, 3));

        let second = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("second sync");
        assert_eq!(
            (second.uploaded, second.deleted, second.errors, second.processed),
            (0, 0, 0, 3)
        );
    }

    #[tokio::test]
    async fn emptied_file_drops_out_of_search() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(dir.path(), &[("notes.txt", "secret old content\n")]);
        let (index, store) = local_store(100);
        sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");

        write_files(dir.path(), &[("notes.txt", "  \n")]);
        let result = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");

        assert_eq!((result.uploaded, result.deleted), (0, 1));
        assert!(index
            .points_for("semindex_s", &id(dir.path(), "notes.txt"))
            .is_empty());
        let hits = store
            .search(
                "s",
                "secret old content",
                10,
                &SearchOptions::default(),
                &SearchFilters::default(),
            )
            .await
            .expect("search");
        assert!(hits.data.is_empty());

        let again = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");
        assert_eq!((again.uploaded, again.deleted, again.processed), (0, 0, 1));
    }

    #[tokio::test]
    async fn shrunk_file_keeps_only_its_new_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_files(
            dir.path(),
            &[("a.txt", "one one\ntwo two\nthree three\nfour four\n")],
        );
        let (index, store) = local_store(12);
        sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");
        let a = id(dir.path(), "a.txt");
        assert!(index.points_for("semindex_s", &a).len() > 1);

        write_files(dir.path(), &[("a.txt", "short\n")]);
        let result = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");

        assert_eq!(result.uploaded, 1);
        let points = index.points_for("semindex_s", &a);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].payload.hash, content_hash(b"short\n"));

        let again = sync(&store, dir.path(), SyncOptions::default())
            .await
            .expect("sync");
        assert_eq!(again.uploaded, 0);
    }
}
