// Conversation titles derived from the first user message

use crate::api::LLMApiProvider;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

const MAX_PROMPT_CHARS: usize = 500;
const MAX_TITLE_CHARS: usize = 60;

#[async_trait]
pub trait TitleGenerator: Send + Sync {
    /// Returns a short title for a conversation that starts with `first_message`.
    async fn generate_title(&self, first_message: &str) -> Result<String>;
}

/// Asks the chat backend for a title.
pub struct LlmTitleGenerator {
    provider: Arc<dyn LLMApiProvider>,
    model_id: String,
}

impl LlmTitleGenerator {
    pub fn new(provider: Arc<dyn LLMApiProvider>, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl TitleGenerator for LlmTitleGenerator {
    async fn generate_title(&self, first_message: &str) -> Result<String> {
        let excerpt: String = first_message.chars().take(MAX_PROMPT_CHARS).collect();
        let prompt = format!(
            "Generate a very short (max 4 words) title for a conversation starting with this message: \"{}\". \
             Return only the title text, no quotes.",
            excerpt
        );

        log::debug!("Requesting title from model {}", self.model_id);
        let raw = self.provider.complete(&self.model_id, &prompt).await?;
        clean_title(&raw).ok_or_else(|| anyhow!("Title model returned an empty title"))
    }
}

/// Trims quotes and whitespace, keeps the first line and caps the length.
fn clean_title(raw: &str) -> Option<String> {
    let first_line = raw.trim().lines().next().unwrap_or_default();
    let cleaned = first_line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim();
    if cleaned.is_empty() {
        return None;
    }

    if cleaned.chars().count() > MAX_TITLE_CHARS {
        let truncated: String = cleaned.chars().take(MAX_TITLE_CHARS - 3).collect();
        Some(format!("{}...", truncated.trim_end()))
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatRequest, DeltaStream};
    use std::sync::Mutex;

    struct FixedReply {
        reply: Result<String, String>,
        prompts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl LLMApiProvider for FixedReply {
        async fn stream_chat(&self, _request: &ChatRequest) -> Result<DeltaStream> {
            Err(anyhow!("not used"))
        }

        async fn complete(&self, model_id: &str, prompt: &str) -> Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push((model_id.to_string(), prompt.to_string()));
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    fn generator(reply: Result<&str, &str>) -> (Arc<FixedReply>, LlmTitleGenerator) {
        let provider = Arc::new(FixedReply {
            reply: reply.map(str::to_string).map_err(str::to_string),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = LlmTitleGenerator::new(provider.clone(), "title-model");
        (provider, generator)
    }

    #[test]
    fn clean_title_strips_quotes_and_extra_lines() {
        assert_eq!(clean_title("  \"Rust Lifetimes\"  ").as_deref(), Some("Rust Lifetimes"));
        assert_eq!(clean_title("Title\nExplanation").as_deref(), Some("Title"));
        assert_eq!(clean_title(" \"\" "), None);

        let long = "word ".repeat(30);
        let title = clean_title(&long).unwrap();
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= MAX_TITLE_CHARS);
    }

    #[tokio::test]
    async fn asks_the_title_model_with_the_first_message() {
        let (provider, generator) = generator(Ok("'Greeting Chat'"));
        let title = generator.generate_title("Hello there").await.unwrap();
        assert_eq!(title, "Greeting Chat");

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts[0].0, "title-model");
        assert!(prompts[0].1.contains("\"Hello there\""));
    }

    #[tokio::test]
    async fn backend_errors_and_blank_replies_are_errors() {
        let (_, failing) = generator(Err("offline"));
        assert!(failing.generate_title("Hello").await.is_err());

        let (_, blank) = generator(Ok("   "));
        assert!(blank.generate_title("Hello").await.is_err());
    }
}
