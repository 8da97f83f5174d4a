use std::env;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;

use crate::sync::DEFAULT_CONCURRENCY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Qdrant plus OpenAI-compatible embedding and chat endpoints.
    Local,
    /// Hosted managed-service store.
    Remote,
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "mixedbread" => Ok(Self::Remote),
            other => bail!("unknown provider '{other}' (expected 'local' or 'remote')"),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Process-wide settings, built once in `main` and passed down by reference.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: Provider,
    pub store_id: String,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub api_key: String,
    pub llm_url: String,
    pub llm_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub http_timeout_ms: u64,
    pub sync_concurrency: usize,
    pub watch_debounce_ms: u64,
}

impl AppConfig {
    const PROVIDER_VARS: [&'static str; 1] = ["SEMINDEX_PROVIDER"];
    const STORE_VARS: [&'static str; 1] = ["SEMINDEX_STORE"];
    const QDRANT_URL_VARS: [&'static str; 2] = ["SEMINDEX_QDRANT_URL", "QDRANT_URL"];
    const QDRANT_KEY_VARS: [&'static str; 2] = ["SEMINDEX_QDRANT_API_KEY", "QDRANT_API_KEY"];
    const EMBEDDING_URL_VARS: [&'static str; 1] = ["SEMINDEX_EMBEDDING_URL"];
    const EMBEDDING_MODEL_VARS: [&'static str; 1] = ["SEMINDEX_EMBEDDING_MODEL"];
    const EMBEDDING_DIM_VARS: [&'static str; 1] = ["SEMINDEX_EMBEDDING_DIMENSIONS"];
    const API_KEY_VARS: [&'static str; 2] = ["SEMINDEX_API_KEY", "OPENAI_API_KEY"];
    const LLM_URL_VARS: [&'static str; 1] = ["SEMINDEX_LLM_URL"];
    const LLM_MODEL_VARS: [&'static str; 1] = ["SEMINDEX_LLM_MODEL"];
    const CHUNK_SIZE_VARS: [&'static str; 1] = ["SEMINDEX_CHUNK_SIZE"];
    const CHUNK_OVERLAP_VARS: [&'static str; 1] = ["SEMINDEX_CHUNK_OVERLAP"];
    const TIMEOUT_VARS: [&'static str; 1] = ["SEMINDEX_HTTP_TIMEOUT_MS"];
    const CONCURRENCY_VARS: [&'static str; 1] = ["SEMINDEX_SYNC_CONCURRENCY"];
    const DEBOUNCE_VARS: [&'static str; 1] = ["SEMINDEX_WATCH_DEBOUNCE_MS"];

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; `from_env` is this over `std::env`.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |candidates: &[&'static str]| -> Option<String> {
            candidates
                .iter()
                .find_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        };

        let provider = match read(&Self::PROVIDER_VARS) {
            Some(value) => value.parse()?,
            None => Provider::Local,
        };
        let embedding_url =
            read(&Self::EMBEDDING_URL_VARS).unwrap_or_else(|| "http://localhost:11434".to_string());
        let llm_url = read(&Self::LLM_URL_VARS).unwrap_or_else(|| embedding_url.clone());

        let config = Self {
            provider,
            store_id: read(&Self::STORE_VARS).unwrap_or_else(|| "semindex".to_string()),
            qdrant_url: read(&Self::QDRANT_URL_VARS)
                .unwrap_or_else(|| "http://localhost:6333".to_string()),
            qdrant_api_key: read(&Self::QDRANT_KEY_VARS),
            embedding_url,
            embedding_model: read(&Self::EMBEDDING_MODEL_VARS)
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            embedding_dimensions: read(&Self::EMBEDDING_DIM_VARS)
                .and_then(|value| value.parse().ok())
                .unwrap_or(768),
            api_key: read(&Self::API_KEY_VARS).unwrap_or_else(|| "sk-local".to_string()),
            llm_url,
            llm_model: read(&Self::LLM_MODEL_VARS).unwrap_or_else(|| "llama3.2".to_string()),
            chunk_size: read(&Self::CHUNK_SIZE_VARS)
                .and_then(|value| value.parse().ok())
                .unwrap_or(1000),
            chunk_overlap: read(&Self::CHUNK_OVERLAP_VARS)
                .and_then(|value| value.parse().ok())
                .unwrap_or(200),
            http_timeout_ms: read(&Self::TIMEOUT_VARS)
                .and_then(|value| value.parse().ok())
                .unwrap_or(30_000),
            sync_concurrency: read(&Self::CONCURRENCY_VARS)
                .and_then(|value| value.parse::<usize>().ok())
                .map_or(DEFAULT_CONCURRENCY, |value| value.clamp(1, DEFAULT_CONCURRENCY)),
            watch_debounce_ms: read(&Self::DEBOUNCE_VARS)
                .and_then(|value| value.parse().ok())
                .unwrap_or(500),
        };

        if config.chunk_size == 0 {
            bail!("SEMINDEX_CHUNK_SIZE must be greater than zero");
        }
        if config.embedding_dimensions == 0 {
            bail!("SEMINDEX_EMBEDDING_DIMENSIONS must be greater than zero");
        }

        Ok(config)
    }

    /// OpenAI-style API base (`.../v1`) for a service root URL.
    pub fn api_base(url: &str) -> String {
        let trimmed = url.trim_end_matches('/');
        if trimmed.ends_with("/v1") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/v1")
        }
    }
}
