mod config;
mod hash;
mod llm_client;
mod store;
mod sync;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::AppConfig;
use store::{
    build_store, CreateStoreOptions, ScoredChunk, SearchFilters, SearchOptions, Store,
};
use sync::{initial_sync, watch, IgnoreFileSystem, SyncOptions, SyncProgress};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "semindex",
    about = "Keep a semantic index of a file tree in sync and query it in natural language"
)]
struct Cli {
    /// Store to operate on; defaults to SEMINDEX_STORE or "semindex".
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload new and changed files under PATH and drop files that no longer exist.
    Sync {
        /// Root of the tree to index (defaults to the current directory).
        path: Option<PathBuf>,
        /// Report what would change without touching the store.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Sync PATH, then keep the store current as files change until interrupted.
    Watch {
        path: Option<PathBuf>,
        /// Log the changes that would be applied without touching the store.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Semantic search over indexed files below PATH.
    Search {
        query: String,
        path: Option<PathBuf>,
        /// Maximum number of results.
        #[arg(short = 'm', long = "max-count", default_value_t = 10)]
        max_count: usize,
    },
    /// Answer a question from indexed files below PATH, with citations.
    Ask {
        question: String,
        path: Option<PathBuf>,
        /// Number of chunks handed to the model.
        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
    },
    /// Show what the store currently holds.
    Info,
    /// Create the store if it does not exist yet.
    Create {
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let store_id = cli.store.unwrap_or_else(|| config.store_id.clone());
    let store = build_store(&config).context("Store initialization failed")?;
    info!(provider = %config.provider, store = %store_id, "store ready");

    match cli.command {
        Commands::Sync { path, dry_run } => {
            let root = resolve_dir(path)?;
            run_sync(store.as_ref(), &store_id, &root, &config, dry_run).await
        }
        Commands::Watch { path, dry_run } => {
            let root = resolve_dir(path)?;
            println!("Watching {} (Ctrl-C to stop)", root.display());
            watch(
                store.as_ref(),
                &IgnoreFileSystem::default(),
                &store_id,
                &root,
                SyncOptions {
                    dry_run,
                    concurrency: config.sync_concurrency,
                },
                Duration::from_millis(config.watch_debounce_ms),
                &report_progress,
            )
            .await
            .context("Watch stopped")
        }
        Commands::Search {
            query,
            path,
            max_count,
        } => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            let scope = resolve_dir(path)?;
            let response = store
                .search(
                    &store_id,
                    &query,
                    max_count,
                    &SearchOptions { rerank: true },
                    &SearchFilters::path_prefix(scope.to_string_lossy()),
                )
                .await
                .context("Failed to search")?;
            for chunk in &response.data {
                println!("{}", format_chunk(&cwd, chunk));
            }
            Ok(())
        }
        Commands::Ask {
            question,
            path,
            top_k,
        } => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            let scope = resolve_dir(path)?;
            let response = store
                .ask(
                    &store_id,
                    &question,
                    top_k,
                    &SearchOptions::default(),
                    &SearchFilters::path_prefix(scope.to_string_lossy()),
                )
                .await
                .context("Failed to answer question")?;
            println!("{}\n", response.answer);
            if !response.sources.is_empty() {
                println!("Sources:");
                for (i, chunk) in response.sources.iter().enumerate() {
                    println!("  [{i}] {}", format_chunk(&cwd, chunk));
                }
            }
            Ok(())
        }
        Commands::Info => {
            let info = store
                .retrieve(&store_id)
                .await
                .context("Failed to read store info")?;
            println!("Store: {}", info.name);
            println!("Description: {}", info.description);
            println!(
                "Pending: {}, in progress: {}",
                info.counts.pending, info.counts.in_progress
            );
            Ok(())
        }
        Commands::Create { description } => {
            let info = store
                .create(&CreateStoreOptions {
                    name: store_id.clone(),
                    description,
                })
                .await
                .context("Failed to create store")?;
            println!("Created store {}", info.name);
            Ok(())
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

fn resolve_dir(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    path.canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))
}

async fn run_sync(
    store: &dyn Store,
    store_id: &str,
    root: &Path,
    config: &AppConfig,
    dry_run: bool,
) -> anyhow::Result<()> {
    let result = initial_sync(
        store,
        &IgnoreFileSystem::default(),
        store_id,
        root,
        SyncOptions {
            dry_run,
            concurrency: config.sync_concurrency,
        },
        &report_progress,
    )
    .await
    .context("Sync aborted")?;

    let prefix = if dry_run { "Dry run: " } else { "" };
    println!(
        "{prefix}{} of {} files processed, {} uploaded, {} deleted, {} errors",
        result.processed, result.total, result.uploaded, result.deleted, result.errors
    );
    Ok(())
}

fn report_progress(progress: &SyncProgress) {
    match &progress.last_error {
        Some(err) => warn!(path = %progress.file_path, error = %err, "sync failed for file"),
        None => debug!(
            path = %progress.file_path,
            processed = progress.processed,
            total = progress.total,
            "synced"
        ),
    }
}

/// `./relative/path, lines A to B` for hits under `cwd`, absolute paths otherwise.
fn format_chunk(cwd: &Path, chunk: &ScoredChunk) -> String {
    let path = Path::new(&chunk.metadata.path);
    let shown = match path.strip_prefix(cwd) {
        Ok(relative) => format!("./{}", relative.display()),
        Err(_) => path.display().to_string(),
    };
    format!(
        "{shown}, lines {} to {}",
        chunk.start_line,
        chunk.start_line + chunk.num_lines
    )
}
