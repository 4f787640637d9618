// Backend clients for LLM chat APIs. A provider is built once at startup from
// validated configuration; calls only carry per-request parameters.

use crate::config::{AppConfig, ProviderKind};
use crate::models::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod gemini;
pub mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAICompatibleProvider;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// Longest silence tolerated between two reads of a response body.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

// Alias for the stream of text fragments a generation produces
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Everything a single generation needs.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model_id: String,
    /// Ordered history, ending with the user turn being answered.
    pub messages: Vec<Arc<Message>>,
    pub system_prompt: String,
}

// Trait defining the interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    /// Opens a streaming generation and returns its text fragments in arrival order.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream>;

    /// Runs a one-shot, non-streaming prompt and returns the full reply.
    async fn complete(&self, model_id: &str, prompt: &str) -> Result<String>;
}

/// Creates the provider selected by `config`, using an already-resolved API key.
pub fn build_provider(config: &AppConfig, api_key: String) -> Result<Arc<dyn LLMApiProvider>> {
    let provider: Arc<dyn LLMApiProvider> = match config.provider {
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(
            &config.api_url,
            api_key,
            config.generation.clone(),
        )?),
        ProviderKind::OpenAICompatible => Arc::new(OpenAICompatibleProvider::new(
            &config.api_url,
            api_key,
            config.generation.clone(),
        )?),
    };
    Ok(provider)
}

/// HTTP client shared by the providers. No overall timeout is set because a
/// stream may legitimately run for minutes; a stalled connection still fails
/// after `read_timeout` without data.
fn http_client(read_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(read_timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Passes successful responses through and turns anything else into an error
/// carrying the status and body.
async fn ensure_success(response: reqwest::Response, api: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_body = response
        .text()
        .await
        .unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("{} request failed with status {}: {}", api, status, error_body);
    Err(anyhow::anyhow!(
        "{} request failed with status {}: {}",
        api,
        status,
        error_body
    ))
}

/// Turns an SSE response into a fragment stream.
/// `parse` maps one event's data to `Some(text)`, `None` to skip it, or an error.
fn sse_deltas<F>(response: reqwest::Response, parse: F) -> DeltaStream
where
    F: Fn(&str) -> Result<Option<String>> + Send + 'static,
{
    let delta_stream = response
        .bytes_stream()
        .eventsource()
        .map(move |event_result| -> Result<Option<String>> {
            let event = event_result.context("Error reading stream event")?;
            parse(event.data.trim())
        })
        .filter_map(|result| async move {
            match result {
                Ok(Some(content)) => Some(Ok(content)),
                Ok(None) => None,
                Err(e) => {
                    log::error!("Error processing stream chunk: {:?}", e);
                    Some(Err(e))
                }
            }
        });

    Box::pin(delta_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn silent_server_fails_after_read_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = http_client(Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let result = client.get(server.uri()).send().await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
