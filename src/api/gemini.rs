// --- Gemini Provider Implementation (`generateContent` / `streamGenerateContent`) ---

use super::{ensure_success, http_client, sse_deltas, ChatRequest, DeltaStream, LLMApiProvider, READ_TIMEOUT};
use crate::config::GenerationOptions;
use crate::models::{Message, Role};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct GeminiProvider {
    client: Client,
    api_url: String,
    api_key: String,
    generation: GenerationOptions,
}

impl GeminiProvider {
    pub fn new(api_url: &str, api_key: String, generation: GenerationOptions) -> Result<Self> {
        Ok(Self {
            client: http_client(READ_TIMEOUT)?,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            generation,
        })
    }

    fn endpoint(&self, model_id: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_url, model_id, method)
    }

    fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            top_k: self.generation.top_k,
        }
    }

    fn build_request(&self, request: &ChatRequest) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: to_contents(&request.messages),
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::Text {
                    text: request.system_prompt.clone(),
                }],
            })
            .filter(|_| !request.system_prompt.trim().is_empty()),
            generation_config: self.generation_config(),
        }
    }
}

#[async_trait]
impl LLMApiProvider for GeminiProvider {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream> {
        log::info!(
            "Sending stream request to Gemini model {} ({} messages)",
            request.model_id,
            request.messages.len()
        );
        let body = self.build_request(request);

        let response = self
            .client
            .post(self.endpoint(&request.model_id, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send stream request to Gemini API")?;
        let response = ensure_success(response, "Gemini stream").await?;

        Ok(sse_deltas(response, parse_stream_event))
    }

    async fn complete(&self, model_id: &str, prompt: &str) -> Result<String> {
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::Text {
                    text: prompt.to_string(),
                }],
            }],
            system_instruction: None,
            generation_config: self.generation_config(),
        };

        let response = self
            .client
            .post(self.endpoint(model_id, "generateContent"))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Gemini API")?;
        let response = ensure_success(response, "Gemini").await?;

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;
        let text = collect_text(&parsed);
        if text.is_empty() {
            return Err(anyhow::anyhow!(
                "Gemini API returned no text in the response candidates"
            ));
        }
        Ok(text)
    }
}

/// Maps chat history onto Gemini `contents`. System turns are dropped because
/// the system prompt travels in `systemInstruction`.
fn to_contents(messages: &[Arc<Message>]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
            Role::System => continue,
        };

        let mut parts = Vec::with_capacity(1 + message.attachments.len());
        if !message.content.is_empty() {
            parts.push(Part::Text {
                text: message.content.clone(),
            });
        }
        parts.extend(message.attachments.iter().map(|attachment| Part::InlineData {
            inline_data: InlineData {
                mime_type: attachment.mime_type.clone(),
                data: attachment.data.clone(),
            },
        }));

        if parts.is_empty() {
            log::debug!("Skipping empty {} message {}", role, message.id);
            continue;
        }
        // Turns must alternate, so a skipped reply folds its neighbours together.
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }
    contents
}

/// Parses one SSE `data:` payload of a `streamGenerateContent` response.
fn parse_stream_event(data: &str) -> Result<Option<String>> {
    if let Ok(wrapper) = serde_json::from_str::<ErrorWrapper>(data) {
        return Err(anyhow::anyhow!("Gemini stream error: {}", wrapper.error));
    }

    let chunk: GenerateContentResponse = serde_json::from_str(data)
        .with_context(|| format!("Failed to parse Gemini stream chunk: {}", data))?;

    if let Some(reason) = chunk
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_deref())
    {
        return Err(anyhow::anyhow!("Gemini blocked the prompt: {}", reason));
    }

    let text = collect_text(&chunk);
    Ok((!text.is_empty()).then_some(text))
}

fn collect_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<PartResponse>,
}

#[derive(Deserialize, Debug)]
struct PartResponse {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    code: Option<i32>,
    message: Option<String>,
    status: Option<String>,
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.code.unwrap_or_default(),
            self.status.as_deref().unwrap_or("UNKNOWN"),
            self.message.as_deref().unwrap_or("no message")
        )
    }
}
