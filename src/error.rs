use thiserror::Error;
use uuid::Uuid;

/// Domain errors raised by the conversation store, the controllers and startup configuration.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Invalid or missing configuration, e.g. an unresolvable API key.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("message {message_id} not found in conversation {conversation_id}")]
    MessageNotFound {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    #[error("message {0} is not an assistant message")]
    NotAnAssistantMessage(Uuid),

    #[error("unknown model: {0}")]
    UnknownModel(String),
}
