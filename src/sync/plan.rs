use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use futures::TryStreamExt;

use crate::store::Store;

/// What the planner learned about one local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalState {
    /// Zero-length or whitespace-only; never indexed.
    Empty,
    Hashed(String),
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub state: LocalState,
}

/// Work derived from one snapshot/local-tree comparison. Never cached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub to_upload: Vec<PathBuf>,
    pub to_delete: Vec<String>,
    /// Local files that are already in sync (or empty) and need no task.
    pub unchanged: usize,
    pub unreadable: Vec<(PathBuf, String)>,
}

impl SyncPlan {
    pub fn compute(
        snapshot: &HashMap<String, Option<String>>,
        local: Vec<LocalFile>,
        repo_root: &Path,
    ) -> Self {
        let mut plan = Self::default();
        let mut local_ids = HashSet::with_capacity(local.len());

        for file in local {
            let external_id = external_id_for(&file.path);
            match file.state {
                LocalState::Empty => {
                    // Emptied since the last sync: the recorded chunks go.
                    if snapshot.contains_key(&external_id) {
                        continue;
                    }
                    plan.unchanged += 1;
                }
                LocalState::Unreadable(reason) => plan.unreadable.push((file.path, reason)),
                LocalState::Hashed(hash) => {
                    let recorded = snapshot.get(&external_id).and_then(|h| h.as_deref());
                    if recorded == Some(hash.as_str()) {
                        plan.unchanged += 1;
                    } else {
                        plan.to_upload.push(file.path);
                    }
                }
            }
            local_ids.insert(external_id);
        }

        plan.to_delete = snapshot
            .keys()
            .filter(|id| is_subpath(repo_root, Path::new(id)) && !local_ids.contains(*id))
            .cloned()
            .collect();

        plan.to_upload.sort();
        plan.to_delete.sort();
        plan
    }

    /// Local files plus deletions; every one of them is counted as processed.
    pub fn total(&self) -> usize {
        self.to_upload.len() + self.unchanged + self.unreadable.len() + self.to_delete.len()
    }
}

/// Files are keyed in the store by their path string.
pub fn external_id_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// True when `child` lies strictly below `parent`.
pub fn is_subpath(parent: &Path, child: &Path) -> bool {
    child != parent && child.starts_with(parent)
}

/// Drain the store listing into `external_id -> recorded hash`.
pub async fn list_store_file_hashes(
    store: &dyn Store,
    store_id: &str,
) -> anyhow::Result<HashMap<String, Option<String>>> {
    let mut by_external_id = HashMap::new();
    let mut files = store.list_files(store_id);
    while let Some(file) = files.try_next().await? {
        let Some(external_id) = file.external_id.filter(|id| !id.is_empty()) else {
            continue;
        };
        by_external_id.insert(external_id, file.metadata.map(|m| m.hash));
    }
    Ok(by_external_id)
}
