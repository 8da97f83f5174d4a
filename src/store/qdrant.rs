//! Qdrant REST adapter for [`VectorIndex`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::index::{ChunkPayload, IndexPoint, SearchHit, VectorIndex};
use crate::config::AppConfig;

/// Minimal HTTP client for the parts of Qdrant's REST surface the store uses.
pub struct QdrantIndex {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    known_collections: Mutex<HashSet<String>>,
}

impl QdrantIndex {
    const SCROLL_PAGE_SIZE: usize = 100;
    const PREFIX_OVERFETCH: usize = 4;
    const MAX_SEARCH_PAGES: usize = 8;

    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.http_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Qdrant HTTP client")?;

        Ok(Self {
            http,
            base_url: config.qdrant_url.clone(),
            api_key: config.qdrant_api_key.clone(),
            known_collections: Mutex::new(HashSet::new()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.api_key {
            builder.header("api-key", key)
        } else {
            builder
        }
    }

    async fn fetch_collection(&self, collection: &str) -> anyhow::Result<Option<CollectionInfo>> {
        let path = format!("collections/{collection}");
        let response = self
            .apply_auth(self.http.get(self.endpoint(&path)))
            .send()
            .await
            .context("Qdrant collection request failed")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let info = Self::read_result::<CollectionInfo>(response, "collection info").await?;
        Ok(Some(info))
    }

    async fn create_collection(&self, collection: &str, dimensions: usize) -> anyhow::Result<()> {
        let path = format!("collections/{collection}");
        let body = json!({
            "vectors": { "size": dimensions, "distance": "Cosine" },
        });
        let response = self
            .apply_auth(self.http.put(self.endpoint(&path)))
            .json(&body)
            .send()
            .await
            .context("Qdrant create collection request failed")?;

        // Another process created it between our check and the create.
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }

        response
            .error_for_status()
            .context("Qdrant create collection returned error status")?;
        info!(collection, dimensions, "Created Qdrant collection");
        Ok(())
    }

    async fn post_points<R: DeserializeOwned>(
        &self,
        collection: &str,
        operation: &str,
        body: &Value,
    ) -> anyhow::Result<Option<R>> {
        let path = format!("collections/{collection}/points/{operation}");
        let response = self
            .apply_auth(self.http.post(self.endpoint(&path)))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Qdrant {operation} request failed"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Self::read_result(response, operation).await.map(Some)
    }

    async fn read_result<R: DeserializeOwned>(
        response: reqwest::Response,
        operation: &str,
    ) -> anyhow::Result<R> {
        let body = response
            .error_for_status()
            .with_context(|| format!("Qdrant {operation} returned error status"))?
            .json::<QdrantResponse<R>>()
            .await
            .with_context(|| format!("Failed to deserialize Qdrant {operation} response"))?;
        Ok(body.result)
    }

    fn payload_from(id: &Value, payload: Option<Value>) -> Option<ChunkPayload> {
        let payload = payload?;
        match serde_json::from_value(payload) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(?err, point = %id, "Skipping Qdrant point with unexpected payload");
                None
            }
        }
    }

    fn id_string(id: &Value) -> String {
        match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> anyhow::Result<()> {
        let mut known = self.known_collections.lock().await;
        if known.contains(collection) {
            return Ok(());
        }

        if self.fetch_collection(collection).await?.is_none() {
            self.create_collection(collection, dimensions).await?;
        }
        known.insert(collection.to_string());
        Ok(())
    }

    #[instrument(level = "debug", skip(self, points), fields(count = points.len()))]
    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> anyhow::Result<()> {
        let path = format!("collections/{collection}/points");
        self.apply_auth(self.http.put(self.endpoint(&path)))
            .query(&[("wait", "true")])
            .json(&UpsertRequest { points: &points })
            .send()
            .await
            .context("Qdrant upsert request failed")?
            .error_for_status()
            .context("Qdrant upsert returned error status")?;

        Ok(())
    }

    async fn delete_by_external_id(
        &self,
        collection: &str,
        external_id: &str,
    ) -> anyhow::Result<()> {
        let path = format!("collections/{collection}/points/delete");
        let body = json!({
            "filter": {
                "must": [{ "key": "externalId", "match": { "value": external_id } }]
            }
        });
        self.apply_auth(self.http.post(self.endpoint(&path)))
            .query(&[("wait", "true")])
            .json(&body)
            .send()
            .await
            .context("Qdrant delete request failed")?
            .error_for_status()
            .context("Qdrant delete returned error status")?;

        Ok(())
    }

    #[instrument(level = "debug", skip(self, vector))]
    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        path_prefix: Option<&str>,
    ) -> anyhow::Result<Vec<SearchHit>> {
        // `match.text` also matches the prefix mid-path, so scoped searches
        // over-fetch and page until the client-side prefix check fills `limit`.
        let page_size = match path_prefix {
            Some(_) => limit.max(1) * Self::PREFIX_OVERFETCH,
            None => limit,
        };
        let mut hits = Vec::with_capacity(limit);

        for page in 0..Self::MAX_SEARCH_PAGES {
            let mut body = json!({
                "vector": &vector,
                "limit": page_size,
                "offset": page * page_size,
                "with_payload": true,
            });
            if let Some(prefix) = path_prefix {
                body["filter"] = json!({
                    "must": [{ "key": "path", "match": { "text": prefix } }]
                });
            }

            let Some(points) = self
                .post_points::<Vec<ScoredPoint>>(collection, "search", &body)
                .await?
            else {
                debug!(collection, "Collection missing; no hits");
                return Ok(Vec::new());
            };
            let exhausted = points.len() < page_size;

            hits.extend(
                points
                    .into_iter()
                    .filter_map(|point| {
                        let payload = Self::payload_from(&point.id, point.payload)?;
                        Some(SearchHit {
                            id: Self::id_string(&point.id),
                            score: point.score,
                            payload,
                        })
                    })
                    .filter(|hit| {
                        path_prefix.map_or(true, |prefix| hit.payload.path.starts_with(prefix))
                    }),
            );

            if path_prefix.is_none() || exhausted || hits.len() >= limit {
                break;
            }
        }

        hits.truncate(limit);
        Ok(hits)
    }

    async fn enumerate_external_ids(
        &self,
        collection: &str,
    ) -> anyhow::Result<HashMap<String, ChunkPayload>> {
        let mut files = HashMap::new();
        let mut offset = Value::Null;

        loop {
            let body = json!({
                "limit": Self::SCROLL_PAGE_SIZE,
                "offset": offset,
                "with_payload": true,
                "with_vector": false,
                "filter": {
                    "must": [{ "key": "chunkIndex", "match": { "value": 0 } }]
                }
            });

            let Some(page) = self
                .post_points::<ScrollPage>(collection, "scroll", &body)
                .await?
            else {
                debug!(collection, "Collection missing; nothing indexed yet");
                return Ok(HashMap::new());
            };

            for point in page.points {
                if let Some(payload) = Self::payload_from(&point.id, point.payload) {
                    if payload.chunk_index == 0 && !payload.external_id.is_empty() {
                        files.insert(payload.external_id.clone(), payload);
                    }
                }
            }

            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = next,
                _ => break,
            }
        }

        Ok(files)
    }

    async fn collection_stats(&self, collection: &str) -> anyhow::Result<Option<u64>> {
        Ok(self
            .fetch_collection(collection)
            .await?
            .map(|info| info.points_count.unwrap_or(0)))
    }
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: &'a [IndexPoint],
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: Option<u64>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollPage {
    points: Vec<ScrollPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollPoint {
    id: Value,
    #[serde(default)]
    payload: Option<Value>,
}
