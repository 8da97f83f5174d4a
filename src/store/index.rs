use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Collections are namespaced so several stores can share one database.
pub const COLLECTION_PREFIX: &str = "semindex_";

pub fn collection_name(store_id: &str) -> String {
    format!("{COLLECTION_PREFIX}{store_id}")
}

/// Metadata stored alongside every vector.
///
/// Field names are camelCase on the wire; `externalId` and `chunkIndex` are
/// also used as filter keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub path: String,
    pub hash: String,
    pub text: String,
    pub start_line: usize,
    pub num_lines: usize,
    pub chunk_index: usize,
    pub external_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Operations the local store needs from a vector database, scoped per collection.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection unless it already exists.
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> anyhow::Result<()>;

    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> anyhow::Result<()>;

    async fn delete_by_external_id(&self, collection: &str, external_id: &str)
        -> anyhow::Result<()>;

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        path_prefix: Option<&str>,
    ) -> anyhow::Result<Vec<SearchHit>>;

    /// Representative (`chunk_index == 0`) payload per file. Missing collections yield an empty map.
    async fn enumerate_external_ids(
        &self,
        collection: &str,
    ) -> anyhow::Result<HashMap<String, ChunkPayload>>;

    /// Point count, or `None` when the collection does not exist yet.
    async fn collection_stats(&self, collection: &str) -> anyhow::Result<Option<u64>>;
}

pub type SharedVectorIndex = Arc<dyn VectorIndex>;
