// --- OpenAI Compatible Provider Implementation ---

use super::{ensure_success, http_client, sse_deltas, ChatRequest, DeltaStream, LLMApiProvider, READ_TIMEOUT};
use crate::config::GenerationOptions;
use crate::models::{Attachment, Message, Role};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct OpenAICompatibleProvider {
    client: Client,
    api_url: String,
    api_key: String,
    generation: GenerationOptions,
}

impl OpenAICompatibleProvider {
    pub fn new(api_url: &str, api_key: String, generation: GenerationOptions) -> Result<Self> {
        Ok(Self {
            client: http_client(READ_TIMEOUT)?,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            generation,
        })
    }

    fn build_request(&self, model: &str, messages: Vec<OpenAIMessage>, stream: bool) -> OpenAIRequestBody {
        OpenAIRequestBody {
            model: model.to_string(),
            messages,
            stream,
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
        }
    }

    async fn post(&self, body: &OpenAIRequestBody) -> Result<reqwest::Response> {
        let request_url = format!("{}/chat/completions", self.api_url);
        let response = self
            .client
            .post(&request_url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .context("Failed to send request to OpenAI compatible API")?;
        ensure_success(response, "OpenAI compatible").await
    }
}

#[async_trait]
impl LLMApiProvider for OpenAICompatibleProvider {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream> {
        log::info!(
            "Sending stream request to OpenAI compatible API: {} using model: {}",
            self.api_url,
            request.model_id
        );

        let mut api_messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.trim().is_empty() {
            api_messages.push(OpenAIMessage {
                role: "system",
                content: OpenAIContent::Text(request.system_prompt.clone()),
            });
        }
        api_messages.extend(request.messages.iter().map(to_api_message));

        let body = self.build_request(&request.model_id, api_messages, true);
        let response = self.post(&body).await?;

        Ok(sse_deltas(response, parse_stream_event))
    }

    async fn complete(&self, model_id: &str, prompt: &str) -> Result<String> {
        let messages = vec![OpenAIMessage {
            role: "user",
            content: OpenAIContent::Text(prompt.to_string()),
        }];
        let body = self.build_request(model_id, messages, false);
        let response = self.post(&body).await?;

        let completion: OpenAICompletion = response
            .json()
            .await
            .context("Failed to parse OpenAI compatible completion")?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .context("Completion contained no message content")
    }
}

fn to_api_message(message: &Arc<Message>) -> OpenAIMessage {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    };

    if message.attachments.is_empty() {
        return OpenAIMessage {
            role,
            content: OpenAIContent::Text(message.content.clone()),
        };
    }

    let mut parts = Vec::with_capacity(1 + message.attachments.len());
    if !message.content.is_empty() {
        parts.push(OpenAIContentPart::Text {
            text: message.content.clone(),
        });
    }
    parts.extend(message.attachments.iter().map(attachment_part));
    OpenAIMessage {
        role,
        content: OpenAIContent::Parts(parts),
    }
}

// Images go inline as data URLs; other files are only named.
fn attachment_part(attachment: &Attachment) -> OpenAIContentPart {
    if attachment.mime_type.starts_with("image/") {
        OpenAIContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", attachment.mime_type, attachment.data),
            },
        }
    } else {
        log::debug!("Sending non-image attachment {} as a text reference", attachment.name);
        OpenAIContentPart::Text {
            text: format!("[Attached file: {} ({})]", attachment.name, attachment.mime_type),
        }
    }
}

/// Parses one SSE `data:` payload of a chat completions stream.
fn parse_stream_event(event_data: &str) -> Result<Option<String>> {
    // Check for the special [DONE] message
    if event_data == "[DONE]" {
        log::info!("Stream finished with [DONE]");
        return Ok(None);
    }

    match serde_json::from_str::<OpenAIStreamChunk>(event_data) {
        Ok(chunk) => Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())),
        Err(e) => {
            // Not a chunk; skip keep-alive pings, fail on anything else.
            match serde_json::from_str::<serde_json::Value>(event_data) {
                Ok(json_value) if json_value.get("type").and_then(|t| t.as_str()) == Some("ping") => {
                    log::debug!("Received stream ping event, skipping.");
                    Ok(None)
                }
                Ok(json_value) if json_value.get("error").is_some() => Err(anyhow::anyhow!(
                    "OpenAI compatible stream error: {}",
                    json_value["error"]
                )),
                _ => {
                    log::warn!("Failed to parse stream chunk: {} - Data: {}", e, event_data);
                    Err(anyhow::Error::from(e)
                        .context(format!("Failed to parse stream chunk: {}", event_data)))
                }
            }
        }
    }
}

#[derive(Serialize, Debug)]
struct OpenAIRequestBody {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize, Debug)]
struct OpenAIMessage {
    role: &'static str,
    content: OpenAIContent,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIContentPart>),
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Debug)]
struct ImageUrl {
    url: String,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OpenAICompletion {
    choices: Vec<OpenAICompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAICompletionChoice {
    message: OpenAICompletionMessage,
}

#[derive(Deserialize, Debug)]
struct OpenAICompletionMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str) -> OpenAICompatibleProvider {
        OpenAICompatibleProvider::new(base_url, "sk-test".to_string(), GenerationOptions::default()).unwrap()
    }

    #[test]
    fn image_attachments_become_data_urls() {
        let message = Arc::new(Message::user(
            "What is this?",
            vec![Attachment {
                name: "dot.png".to_string(),
                mime_type: "image/png".to_string(),
                size: 4,
                data: "iVBO".to_string(),
            }],
        ));

        let value = serde_json::to_value(to_api_message(&message)).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "image_url");
        assert_eq!(value["content"][1]["image_url"]["url"], "data:image/png;base64,iVBO");
    }

    #[test]
    fn parse_stream_event_skips_done_and_pings() {
        assert_eq!(parse_stream_event("[DONE]").unwrap(), None);
        assert_eq!(parse_stream_event(r#"{"type":"ping"}"#).unwrap(), None);
        assert_eq!(
            parse_stream_event(r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#)
                .unwrap()
                .as_deref(),
            Some("Hi")
        );
        assert!(parse_stream_event(r#"{"error":{"message":"overloaded"}}"#).is_err());
    }

    #[tokio::test]
    async fn stream_chat_sends_system_prompt_first() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let request = ChatRequest {
            model_id: "gpt-4o-mini".to_string(),
            messages: vec![Arc::new(Message::user("Hi", Vec::new()))],
            system_prompt: "Be kind.".to_string(),
        };
        let stream = provider(&server.uri()).stream_chat(&request).await.unwrap();
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec!["Hello", " there"]);

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Be kind.");
        assert_eq!(body["messages"][1]["content"], "Hi");
    }
}
