use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Title every conversation starts with until the title generator replaces it.
pub const DEFAULT_TITLE: &str = "New Conversation";

// Who authored a message. Older snapshots used "model" for assistant turns.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "model")]
    Assistant,
    System,
}

// A file attached to a user message, carried inline as base64 text
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "type", alias = "mimeType")]
    pub mime_type: String,
    pub size: u64,
    pub data: String, // Base64 encoded content
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            attachments,
        }
    }

    /// Empty assistant message that the stream controller fills in.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
        }
    }

    /// Copy of this message with `content` replaced.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }
}

// A titled thread of messages bound to one model.
// Messages are shared immutable values; updates swap in new `Arc`s so that
// observers can detect a change with `Arc::ptr_eq`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Arc<Message>>,
    pub model_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Conversation {
    pub fn new(model_id: impl Into<String>, system_prompt: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            model_id: model_id.into(),
            last_updated: Utc::now(),
            system_prompt,
        }
    }

    pub fn position(&self, message_id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: Uuid) -> Option<&Arc<Message>> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// The conversation override, else `default_prompt`.
    pub fn effective_system_prompt<'a>(&'a self, default_prompt: &'a str) -> &'a str {
        self.system_prompt.as_deref().unwrap_or(default_prompt)
    }
}

// Static catalog entry describing an LLM variant
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub description: String,
    pub capabilities: Vec<String>,
}

impl Model {
    fn entry(id: &str, name: &str, provider: &str, description: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider: provider.to_string(),
            description: description.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Catalog entry for a model id the built-in catalogs don't know.
    pub fn custom(id: &str) -> Self {
        Self::entry(id, id, "Custom", "User-configured model.", &[])
    }
}

pub fn gemini_models() -> Vec<Model> {
    vec![
        Model::entry(
            "gemini-3-flash-preview",
            "Gemini 3 Flash (Fast)",
            "Google",
            "Optimized for speed and efficiency. Best for everyday tasks.",
            &["Speed", "Reasoning", "Conciseness"],
        ),
        Model::entry(
            "gemini-3-pro-preview",
            "Gemini 3 Pro (Complex)",
            "Google",
            "Most capable model for highly complex tasks, coding, and math.",
            &["Deep Reasoning", "Coding", "Multimodal"],
        ),
        Model::entry(
            "gemini-2.5-flash-image",
            "Gemini 2.5 Flash Image",
            "Google",
            "Vision and image understanding.",
            &["Vision", "Image Editing", "Quick Analysis"],
        ),
    ]
}

pub fn openai_models() -> Vec<Model> {
    vec![
        Model::entry(
            "gpt-4o-mini",
            "GPT-4o Mini",
            "OpenAI",
            "Small, fast model for everyday chat.",
            &["Speed", "Conciseness"],
        ),
        Model::entry(
            "gpt-4o",
            "GPT-4o",
            "OpenAI",
            "Flagship multimodal model.",
            &["Reasoning", "Coding", "Vision"],
        ),
    ]
}
