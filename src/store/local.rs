use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, error, info, instrument, warn};

use super::answer::AnswerSynthesizer;
use super::chunker::{chunk_text, is_blank, Chunk};
use super::client::Store;
use super::embed::{EmbeddingsProvider, OpenAiEmbeddingsClient};
use super::index::{collection_name, ChunkPayload, IndexPoint, SharedVectorIndex};
use super::qdrant::QdrantIndex;
use super::types::{
    AskResponse, CreateStoreOptions, FileMetadata, FileSource, ScoredChunk, SearchFilters,
    SearchOptions, SearchResponse, StoreCounts, StoreFile, StoreInfo, UploadOptions,
};
use crate::config::AppConfig;
use crate::hash::point_id;
use crate::llm_client::{OpenAiLlmClient, SharedLlmClient};

/// Store backed by a self-hosted vector database and OpenAI-compatible model endpoints.
pub struct LocalStore {
    index: SharedVectorIndex,
    embedder: Arc<dyn EmbeddingsProvider>,
    answers: AnswerSynthesizer,
    dimensions: usize,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl LocalStore {
    pub fn new(
        index: SharedVectorIndex,
        embedder: Arc<dyn EmbeddingsProvider>,
        llm: SharedLlmClient,
        config: &AppConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            answers: AnswerSynthesizer::new(llm),
            dimensions: config.embedding_dimensions,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let index = QdrantIndex::new(config)?;
        info!(
            qdrant = %config.qdrant_url,
            embedding_model = %config.embedding_model,
            llm_model = %config.llm_model,
            "using local store"
        );
        Ok(Self::new(
            Arc::new(index),
            Arc::new(OpenAiEmbeddingsClient::from_config(config)),
            OpenAiLlmClient::shared_from_config(config),
            config,
        ))
    }

    async fn index_file(
        &self,
        collection: &str,
        source: FileSource,
        options: &UploadOptions,
        path: &str,
    ) -> anyhow::Result<bool> {
        self.index
            .ensure_collection(collection, self.dimensions)
            .await?;

        let bytes = source
            .read_all()
            .await
            .context("Failed to read file content")?;
        if bytes.is_empty() {
            debug!(path, "empty file; nothing to index");
            return Ok(false);
        }
        // Legacy encodings still index; invalid sequences become U+FFFD.
        let content = String::from_utf8_lossy(&bytes);

        let chunks = if is_blank(&content) {
            Vec::new()
        } else {
            chunk_text(&content, self.chunk_size, self.chunk_overlap)
        };
        if chunks.is_empty() {
            if options.overwrite {
                self.index
                    .delete_by_external_id(collection, &options.external_id)
                    .await?;
            }
            debug!(path, "no indexable text; prior chunks cleared");
            return Ok(false);
        }

        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let vector = self.embedder.embed_one(&chunk.text).await?;
            if vector.len() != self.dimensions {
                warn!(
                    path,
                    expected = self.dimensions,
                    actual = vector.len(),
                    "embedding dimension mismatch"
                );
            }
            vectors.push(vector);
        }

        if options.overwrite {
            self.index
                .delete_by_external_id(collection, &options.external_id)
                .await?;
        }

        let hash = options
            .metadata
            .as_ref()
            .map(|m| m.hash.clone())
            .unwrap_or_default();
        let points = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| to_point(chunk, vector, &options.external_id, path, &hash))
            .collect::<Vec<_>>();

        debug!(path, chunks = points.len(), "upserting chunks");
        self.index.upsert(collection, points).await?;
        Ok(true)
    }
}

fn to_point(
    chunk: Chunk,
    vector: Vec<f32>,
    external_id: &str,
    path: &str,
    hash: &str,
) -> IndexPoint {
    IndexPoint {
        id: point_id(external_id, chunk.chunk_index),
        vector,
        payload: ChunkPayload {
            path: path.to_string(),
            hash: hash.to_string(),
            text: chunk.text,
            start_line: chunk.start_line,
            num_lines: chunk.num_lines,
            chunk_index: chunk.chunk_index,
            external_id: external_id.to_string(),
        },
    }
}

fn to_scored_chunk(score: f32, payload: ChunkPayload) -> ScoredChunk {
    ScoredChunk {
        text: payload.text,
        score,
        metadata: FileMetadata {
            path: payload.path,
            hash: payload.hash,
        },
        chunk_index: payload.chunk_index,
        start_line: payload.start_line,
        num_lines: payload.num_lines,
    }
}

#[async_trait]
impl Store for LocalStore {
    fn list_files<'a>(&'a self, store_id: &'a str) -> BoxStream<'a, anyhow::Result<StoreFile>> {
        stream::once(async move {
            self.index
                .enumerate_external_ids(&collection_name(store_id))
                .await
        })
        .map_ok(|payloads| {
            stream::iter(payloads.into_iter().map(|(external_id, payload)| {
                Ok(StoreFile {
                    external_id: Some(external_id),
                    metadata: Some(FileMetadata {
                        path: payload.path,
                        hash: payload.hash,
                    }),
                })
            }))
        })
        .try_flatten()
        .boxed()
    }

    #[instrument(level = "debug", skip(self, source, options), fields(external_id = %options.external_id))]
    async fn upload_file(
        &self,
        store_id: &str,
        source: FileSource,
        options: &UploadOptions,
    ) -> anyhow::Result<bool> {
        let collection = collection_name(store_id);
        let path = options
            .metadata
            .as_ref()
            .map(|m| m.path.clone())
            .unwrap_or_else(|| options.external_id.clone());

        let result = self.index_file(&collection, source, options, &path).await;
        if let Err(err) = &result {
            error!(path = %path, error = %err, "failed to index file");
        }
        result
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete_file(&self, store_id: &str, external_id: &str) -> anyhow::Result<()> {
        self.index
            .delete_by_external_id(&collection_name(store_id), external_id)
            .await
    }

    #[instrument(level = "debug", skip(self, options, filters))]
    async fn search(
        &self,
        store_id: &str,
        query: &str,
        top_k: usize,
        options: &SearchOptions,
        filters: &SearchFilters,
    ) -> anyhow::Result<SearchResponse> {
        if options.rerank {
            debug!("reranking is not available for the local store; using vector order");
        }
        let vector = self.embedder.embed_one(query).await?;
        let hits = self
            .index
            .search(
                &collection_name(store_id),
                vector,
                top_k,
                filters.path_prefix_value(),
            )
            .await?;

        Ok(SearchResponse {
            data: hits
                .into_iter()
                .map(|hit| to_scored_chunk(hit.score, hit.payload))
                .collect(),
        })
    }

    async fn ask(
        &self,
        store_id: &str,
        question: &str,
        top_k: usize,
        options: &SearchOptions,
        filters: &SearchFilters,
    ) -> anyhow::Result<AskResponse> {
        let sources = self
            .search(store_id, question, top_k, options, filters)
            .await?
            .data;
        self.answers.answer(question, sources).await
    }

    async fn retrieve(&self, store_id: &str) -> anyhow::Result<StoreInfo> {
        let description = match self.index.collection_stats(&collection_name(store_id)).await {
            Ok(Some(points)) => format!("Local store with {points} chunks"),
            Ok(None) => "Local store (not initialized)".to_string(),
            Err(err) => {
                warn!(error = %err, "failed to read collection stats");
                "Local store (not initialized)".to_string()
            }
        };

        let now = Utc::now();
        Ok(StoreInfo {
            name: store_id.to_string(),
            description,
            created_at: now,
            updated_at: now,
            counts: StoreCounts::default(),
        })
    }

    async fn create(&self, options: &CreateStoreOptions) -> anyhow::Result<StoreInfo> {
        self.index
            .ensure_collection(&collection_name(&options.name), self.dimensions)
            .await?;

        let now = Utc::now();
        Ok(StoreInfo {
            name: options.name.clone(),
            description: options.description.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
            counts: StoreCounts::default(),
        })
    }
}
