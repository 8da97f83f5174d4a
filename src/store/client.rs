use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::types::{
    AskResponse, CreateStoreOptions, FileSource, SearchFilters, SearchOptions, SearchResponse,
    StoreFile, StoreInfo, UploadOptions,
};

/// Capability surface shared by every index backend.
///
/// The sync engine and the CLI only ever talk to this trait.
#[async_trait]
pub trait Store: Send + Sync {
    /// Files currently recorded for `store_id`. Each call starts a fresh listing.
    fn list_files<'a>(&'a self, store_id: &'a str)
        -> BoxStream<'a, anyhow::Result<StoreFile>>;

    /// Index `source` under `options.external_id`.
    ///
    /// Returns `false` when the content held nothing to index; with `overwrite`
    /// set, any points previously stored for the file are still removed.
    async fn upload_file(
        &self,
        store_id: &str,
        source: FileSource,
        options: &UploadOptions,
    ) -> anyhow::Result<bool>;

    async fn delete_file(&self, store_id: &str, external_id: &str) -> anyhow::Result<()>;

    async fn search(
        &self,
        store_id: &str,
        query: &str,
        top_k: usize,
        options: &SearchOptions,
        filters: &SearchFilters,
    ) -> anyhow::Result<SearchResponse>;

    async fn ask(
        &self,
        store_id: &str,
        question: &str,
        top_k: usize,
        options: &SearchOptions,
        filters: &SearchFilters,
    ) -> anyhow::Result<AskResponse>;

    async fn retrieve(&self, store_id: &str) -> anyhow::Result<StoreInfo>;

    async fn create(&self, options: &CreateStoreOptions) -> anyhow::Result<StoreInfo>;
}

pub type SharedStore = Arc<dyn Store>;
