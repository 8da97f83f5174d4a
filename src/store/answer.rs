use tracing::{debug, instrument};

use super::types::{AskResponse, ScoredChunk};
use crate::llm_client::{ChatMessage, SharedLlmClient};

pub const NO_ANSWER: &str = "No relevant information found to answer this question.";

const QA_SYSTEM_PROMPT: &str = "You answer questions using only the numbered context passages you are given.

Rules:
- Cite every claim with <cite i=\"N\" />, where N is the 0-based number of the passage it comes from.
- If the context does not contain the answer, say that you could not find it in the indexed files.
- Never invent facts, file names or code that do not appear in the context.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Turns retrieved chunks into a cited natural-language answer.
#[derive(Clone)]
pub struct AnswerSynthesizer {
    llm: SharedLlmClient,
}

impl AnswerSynthesizer {
    pub fn new(llm: SharedLlmClient) -> Self {
        Self { llm }
    }

    #[instrument(level = "debug", skip(self, sources), fields(count = sources.len()))]
    pub async fn answer(
        &self,
        question: &str,
        sources: Vec<ScoredChunk>,
    ) -> anyhow::Result<AskResponse> {
        if sources.is_empty() {
            debug!("no chunks retrieved; skipping completion");
            return Ok(AskResponse {
                answer: NO_ANSWER.to_string(),
                sources,
            });
        }

        let messages = [
            ChatMessage::system(QA_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Context:\n{}{CONTEXT_SEPARATOR}Question: {question}",
                build_context(&sources)
            )),
        ];
        let answer = self.llm.complete(&messages).await?;

        Ok(AskResponse { answer, sources })
    }
}

pub fn build_context(sources: &[ScoredChunk]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[{i}] From {}:\n{}", chunk.metadata.path, chunk.text))
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}
