use std::fmt;
use std::path::Path;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub hash: String,
}

/// One file as recorded by a store.
#[derive(Debug, Clone)]
pub struct StoreFile {
    pub external_id: Option<String>,
    pub metadata: Option<FileMetadata>,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub external_id: String,
    pub overwrite: bool,
    pub metadata: Option<FileMetadata>,
}

/// File content handed to [`Store::upload_file`](super::Store::upload_file).
///
/// Resolved once at the call boundary; stores only ever call [`read_all`](Self::read_all).
pub enum FileSource {
    Bytes(Vec<u8>),
    Stream(Pin<Box<dyn AsyncRead + Send>>),
}

impl FileSource {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::Stream(Box::pin(file)))
    }

    pub async fn read_all(self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub rerank: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    StartsWith,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub key: String,
    pub operator: FilterOperator,
    pub value: String,
}

/// Conjunction of metadata conditions, shaped like the managed service's filter body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub all: Vec<FilterCondition>,
}

impl SearchFilters {
    pub fn path_prefix(prefix: impl Into<String>) -> Self {
        Self {
            all: vec![FilterCondition {
                key: "path".to_string(),
                operator: FilterOperator::StartsWith,
                value: prefix.into(),
            }],
        }
    }

    /// The `path starts_with` value, if one was requested.
    pub fn path_prefix_value(&self) -> Option<&str> {
        self.all
            .iter()
            .find(|c| c.key == "path" && c.operator == FilterOperator::StartsWith)
            .map(|c| c.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub text: String,
    pub score: f32,
    pub metadata: FileMetadata,
    pub chunk_index: usize,
    pub start_line: usize,
    pub num_lines: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub data: Vec<ScoredChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub sources: Vec<ScoredChunk>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreCounts {
    pub pending: u64,
    pub in_progress: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInfo {
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub counts: StoreCounts,
}

#[derive(Debug, Clone, Default)]
pub struct CreateStoreOptions {
    pub name: String,
    pub description: Option<String>,
}
