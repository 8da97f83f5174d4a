use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::{config::OpenAIConfig, Client as AsyncOpenAiClient};
use async_trait::async_trait;
use tracing::instrument;

use crate::config::AppConfig;

pub type SharedLlmClient = Arc<dyn LlmClient>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;
}

/// OpenAI-compatible chat client that can point at OpenAI, Ollama, vLLM, or any HTTP-compatible backend.
pub struct OpenAiLlmClient {
    client: AsyncOpenAiClient<OpenAIConfig>,
    model: String,
}

impl OpenAiLlmClient {
    /// Low temperature keeps answers close to the retrieved context.
    const TEMPERATURE: f32 = 0.1;

    pub fn from_config(config: &AppConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(AppConfig::api_base(&config.llm_url));

        Self {
            client: AsyncOpenAiClient::with_config(openai_config),
            model: config.llm_model.clone(),
        }
    }

    pub fn shared_from_config(config: &AppConfig) -> SharedLlmClient {
        Arc::new(Self::from_config(config))
    }

    fn to_request_message(message: &ChatMessage) -> anyhow::Result<ChatCompletionRequestMessage> {
        let converted = match message.role {
            ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(message.content.as_str())
                .build()?
                .into(),
            ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                .content(message.content.as_str())
                .build()?
                .into(),
        };
        Ok(converted)
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let messages = messages
            .iter()
            .map(Self::to_request_message)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(Self::TEMPERATURE)
            .messages(messages)
            .build()?;

        let response = self.client.chat().create(request).await?;
        let output = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(output)
    }
}
