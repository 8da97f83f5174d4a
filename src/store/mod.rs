pub mod answer;
pub mod chunker;
pub mod client;
pub mod embed;
pub mod index;
pub mod local;
pub mod qdrant;
pub mod types;

#[cfg(test)]
pub(crate) mod memory;

use std::sync::Arc;

use anyhow::bail;

use crate::config::{AppConfig, Provider};

pub use client::{SharedStore, Store};
pub use types::{
    CreateStoreOptions, FileMetadata, FileSource, ScoredChunk, SearchFilters, SearchOptions,
    UploadOptions,
};

use local::LocalStore;

/// Build the store selected by `config.provider`.
pub fn build_store(config: &AppConfig) -> anyhow::Result<SharedStore> {
    match config.provider {
        Provider::Local => Ok(Arc::new(LocalStore::from_config(config)?)),
        Provider::Remote => bail!(
            "provider 'remote' needs the managed-service client, which this build does not include; \
             set SEMINDEX_PROVIDER=local"
        ),
    }
}
