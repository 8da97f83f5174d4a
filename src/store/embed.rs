use anyhow::{ensure, Context};
use async_openai::{
    config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client as OpenAiClient,
};
use async_trait::async_trait;
use tracing::instrument;

use crate::config::AppConfig;

#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .context("Embedding response missing data")
    }
}

/// Client for any OpenAI-compatible `/v1/embeddings` endpoint (Ollama, LM Studio, vLLM, ...).
pub struct OpenAiEmbeddingsClient {
    client: OpenAiClient<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbeddingsClient {
    pub fn from_config(config: &AppConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(AppConfig::api_base(&config.embedding_url));

        Self {
            client: OpenAiClient::with_config(openai_config),
            model: config.embedding_model.clone(),
        }
    }
}

#[async_trait]
impl EmbeddingsProvider for OpenAiEmbeddingsClient {
    #[instrument(level = "debug", skip_all, fields(inputs = texts.len()))]
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(texts.to_vec())
            .build()?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .context("Embedding request failed")?;

        let mut data = response.data;
        ensure!(
            data.len() == texts.len(),
            "Invalid embedding response: expected {} vectors, got {}",
            texts.len(),
            data.len()
        );
        data.sort_by_key(|item| item.index);

        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}
