use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use tracing::warn;

/// Source of the local file set for a sync run.
pub trait FileSystem: Send + Sync {
    /// Every regular file below `root`, as absolute paths.
    fn get_files(&self, root: &Path) -> anyhow::Result<Vec<PathBuf>>;

    fn is_ignored(&self, path: &Path, root: &Path) -> bool;
}

/// Walks with gitignore semantics: `.gitignore` files are honoured whether or
/// not the tree is a git checkout, hidden entries are skipped and `.git` is
/// never descended into.
#[derive(Default)]
pub struct IgnoreFileSystem {
    matchers: Mutex<HashMap<PathBuf, Gitignore>>,
}

impl IgnoreFileSystem {
    fn root_matcher(&self, root: &Path) -> Gitignore {
        let mut matchers = self.matchers.lock().unwrap_or_else(PoisonError::into_inner);
        matchers
            .entry(root.to_path_buf())
            .or_insert_with(|| {
                let mut builder = GitignoreBuilder::new(root);
                let gitignore = root.join(".gitignore");
                if gitignore.is_file() {
                    if let Some(err) = builder.add(&gitignore) {
                        warn!(path = %gitignore.display(), error = %err, "invalid .gitignore entry");
                    }
                }
                builder.build().unwrap_or_else(|err| {
                    warn!(root = %root.display(), error = %err, "ignoring unreadable .gitignore");
                    Gitignore::empty()
                })
            })
            .clone()
    }
}

impl FileSystem for IgnoreFileSystem {
    fn get_files(&self, root: &Path) -> anyhow::Result<Vec<PathBuf>> {
        anyhow::ensure!(root.is_dir(), "{} is not a directory", root.display());

        let mut files: Vec<PathBuf> = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .require_git(false)
            .follow_links(false)
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .map(|entry| entry.into_path())
            .collect();

        files.sort();
        Ok(files)
    }

    fn is_ignored(&self, path: &Path, root: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name == ".git"))
        {
            return true;
        }
        self.root_matcher(root)
            .matched_path_or_any_parents(relative, false)
            .is_ignore()
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}
