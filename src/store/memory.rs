//! In-memory stand-ins for the vector database, the model endpoints and a whole
//! store. Used by unit tests across the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};

use super::client::Store;
use super::embed::EmbeddingsProvider;
use super::index::{ChunkPayload, IndexPoint, SearchHit, VectorIndex};
use super::local::LocalStore;
use super::types::{
    AskResponse, CreateStoreOptions, FileMetadata, FileSource, ScoredChunk, SearchFilters,
    SearchOptions, SearchResponse, StoreCounts, StoreFile, StoreInfo, UploadOptions,
};
use crate::config::AppConfig;
use crate::llm_client::{ChatMessage, LlmClient};

#[derive(Default)]
struct Collection {
    dimensions: usize,
    points: HashMap<String, IndexPoint>,
}

/// Vector index backed by a map, with exact cosine scoring.
#[derive(Default)]
pub struct MemoryIndex {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryIndex {
    pub fn points_for(&self, collection: &str, external_id: &str) -> Vec<IndexPoint> {
        let collections = self.collections.lock().expect("lock poisoned");
        let mut points: Vec<IndexPoint> = collections
            .get(collection)
            .map(|c| {
                c.points
                    .values()
                    .filter(|p| p.payload.external_id == external_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        points.sort_by_key(|p| p.payload.chunk_index);
        points
    }

    pub fn point_count(&self, collection: &str) -> usize {
        let collections = self.collections.lock().expect("lock poisoned");
        collections.get(collection).map_or(0, |c| c.points.len())
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> anyhow::Result<()> {
        let mut collections = self.collections.lock().expect("lock poisoned");
        collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dimensions,
                points: HashMap::new(),
            });
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> anyhow::Result<()> {
        let mut collections = self.collections.lock().expect("lock poisoned");
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection {collection} not found"))?;
        for point in points {
            if point.vector.len() != target.dimensions {
                bail!(
                    "vector dimension error: expected {}, got {}",
                    target.dimensions,
                    point.vector.len()
                );
            }
            target.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn delete_by_external_id(
        &self,
        collection: &str,
        external_id: &str,
    ) -> anyhow::Result<()> {
        let mut collections = self.collections.lock().expect("lock poisoned");
        if let Some(target) = collections.get_mut(collection) {
            target
                .points
                .retain(|_, p| p.payload.external_id != external_id);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        path_prefix: Option<&str>,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let collections = self.collections.lock().expect("lock poisoned");
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<SearchHit> = target
            .points
            .values()
            .filter(|p| path_prefix.map_or(true, |prefix| p.payload.path.starts_with(prefix)))
            .map(|p| SearchHit {
                id: p.id.clone(),
                score: Self::cosine(&vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn enumerate_external_ids(
        &self,
        collection: &str,
    ) -> anyhow::Result<HashMap<String, ChunkPayload>> {
        let collections = self.collections.lock().expect("lock poisoned");
        Ok(collections
            .get(collection)
            .map(|c| {
                c.points
                    .values()
                    .filter(|p| p.payload.chunk_index == 0)
                    .map(|p| (p.payload.external_id.clone(), p.payload.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn collection_stats(&self, collection: &str) -> anyhow::Result<Option<u64>> {
        let collections = self.collections.lock().expect("lock poisoned");
        Ok(collections.get(collection).map(|c| c.points.len() as u64))
    }
}

/// Deterministic bag-of-words embedder: each whitespace token bumps one bucket.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions];
        for token in text.split_whitespace() {
            let bucket = blake3::hash(token.to_lowercase().as_bytes()).as_bytes()[0] as usize
                % self.dimensions;
            vector[bucket] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingsProvider for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// A real [`LocalStore`] over an in-memory index, 16-dimension embeddings and no overlap.
pub fn local_store(chunk_size: usize) -> (Arc<MemoryIndex>, LocalStore) {
    let config = AppConfig::from_lookup(|key| match key {
        "SEMINDEX_EMBEDDING_DIMENSIONS" => Some("16".to_string()),
        "SEMINDEX_CHUNK_SIZE" => Some(chunk_size.to_string()),
        "SEMINDEX_CHUNK_OVERLAP" => Some("0".to_string()),
        _ => None,
    })
    .expect("config");
    let index = Arc::new(MemoryIndex::default());
    let store = LocalStore::new(
        index.clone(),
        Arc::new(HashEmbedder::new(16)),
        Arc::new(RecordingLlm::replying("unused")),
        &config,
    );
    (index, store)
}

/// Chat client that records what it was asked and replies with a fixed string.
pub struct RecordingLlm {
    reply: String,
    pub calls: AtomicUsize,
    pub last_messages: Mutex<Vec<ChatMessage>>,
}

impl RecordingLlm {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmClient for RecordingLlm {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().expect("lock poisoned") = messages.to_vec();
        Ok(self.reply.clone())
    }
}

/// Whole-store fake that records operations and can be told to fail.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<String, (FileMetadata, String)>>,
    failures: Mutex<HashMap<String, String>>,
    reject_streams: AtomicBool,
    latency: Mutex<Option<Duration>>,
    pub upload_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MemoryStore {
    /// Seed an entry as if it had been uploaded earlier.
    pub fn insert(&self, external_id: &str, hash: &str) {
        self.files.lock().expect("lock poisoned").insert(
            external_id.to_string(),
            (
                FileMetadata {
                    path: external_id.to_string(),
                    hash: hash.to_string(),
                },
                String::new(),
            ),
        );
    }

    /// Every upload of `external_id` fails with `message`.
    pub fn fail_upload(&self, external_id: &str, message: &str) {
        self.failures
            .lock()
            .expect("lock poisoned")
            .insert(external_id.to_string(), message.to_string());
    }

    pub fn reject_streams(&self) {
        self.reject_streams.store(true, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("lock poisoned") = Some(latency);
    }

    pub fn hash_of(&self, external_id: &str) -> Option<String> {
        self.files
            .lock()
            .expect("lock poisoned")
            .get(external_id)
            .map(|(meta, _)| meta.hash.clone())
    }

    pub fn len(&self) -> usize {
        self.files.lock().expect("lock poisoned").len()
    }

    async fn simulate_io(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let latency = *self.latency.lock().expect("lock poisoned");
        match latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn list_files<'a>(&'a self, _store_id: &'a str) -> BoxStream<'a, anyhow::Result<StoreFile>> {
        let files: Vec<anyhow::Result<StoreFile>> = self
            .files
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(id, (meta, _))| {
                Ok(StoreFile {
                    external_id: Some(id.clone()),
                    metadata: Some(meta.clone()),
                })
            })
            .collect();
        stream::iter(files).boxed()
    }

    async fn upload_file(
        &self,
        _store_id: &str,
        source: FileSource,
        options: &UploadOptions,
    ) -> anyhow::Result<bool> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let failure = self
            .failures
            .lock()
            .expect("lock poisoned")
            .get(&options.external_id)
            .cloned();
        if let Some(message) = failure {
            bail!(message);
        }
        if matches!(source, FileSource::Stream(_)) && self.reject_streams.load(Ordering::SeqCst) {
            bail!("stream uploads are not accepted");
        }

        let bytes = source.read_all().await?;
        let metadata = options
            .metadata
            .clone()
            .ok_or_else(|| anyhow!("upload without metadata"))?;
        self.files.lock().expect("lock poisoned").insert(
            options.external_id.clone(),
            (metadata, String::from_utf8_lossy(&bytes).into_owned()),
        );
        Ok(true)
    }

    async fn delete_file(&self, _store_id: &str, external_id: &str) -> anyhow::Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;
        self.files.lock().expect("lock poisoned").remove(external_id);
        Ok(())
    }

    async fn search(
        &self,
        _store_id: &str,
        query: &str,
        top_k: usize,
        _options: &SearchOptions,
        filters: &SearchFilters,
    ) -> anyhow::Result<SearchResponse> {
        let files = self.files.lock().expect("lock poisoned");
        let data = files
            .values()
            .filter(|(meta, _)| {
                filters
                    .path_prefix_value()
                    .map_or(true, |prefix| meta.path.starts_with(prefix))
            })
            .filter(|(_, text)| text.contains(query))
            .take(top_k)
            .map(|(meta, text)| ScoredChunk {
                text: text.clone(),
                score: 1.0,
                metadata: meta.clone(),
                chunk_index: 0,
                start_line: 0,
                num_lines: text.lines().count().max(1),
            })
            .collect();
        Ok(SearchResponse { data })
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
        Ok(AskResponse {
            answer: format!("{} matching files", sources.len()),
            sources,
        })
    }

    async fn retrieve(&self, store_id: &str) -> anyhow::Result<StoreInfo> {
        Ok(StoreInfo {
            name: store_id.to_string(),
            description: format!("In-memory store with {} files", self.len()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            counts: StoreCounts::default(),
        })
    }

    async fn create(&self, options: &CreateStoreOptions) -> anyhow::Result<StoreInfo> {
        Ok(StoreInfo {
            name: options.name.clone(),
            description: options.description.clone().unwrap_or_default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            counts: StoreCounts::default(),
        })
    }
}
