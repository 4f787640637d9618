// Commands exposed to front ends. Ids arrive as strings and every failure
// comes back as a user-facing message.

use crate::chat::{StreamOutcome, Turn};
use crate::models::{Attachment, Conversation, Message, Model};
use crate::state::AppState;
use std::sync::Arc;
use uuid::Uuid;

fn parse_id(raw: &str, what: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        let err_msg = format!("Invalid {} ID format: {}", what, raw);
        log::error!("{}", err_msg);
        err_msg
    })
}

/// Lists conversations, most recently updated first.
pub fn list_conversations(state: &AppState) -> Vec<Arc<Conversation>> {
    log::debug!("Listing conversations");
    state.chat.store().conversations_by_recency()
}

pub fn create_conversation(state: &AppState) -> Arc<Conversation> {
    state.chat.new_conversation()
}

pub fn select_conversation(state: &AppState, conversation_id: &str) -> Result<Arc<Conversation>, String> {
    let conv_uuid = parse_id(conversation_id, "conversation")?;
    state
        .chat
        .store()
        .select(conv_uuid)
        .map_err(|e| format!("Failed to open conversation: {}", e))?;
    state
        .chat
        .store()
        .get(conv_uuid)
        .ok_or_else(|| format!("Conversation {} not found", conv_uuid))
}

pub fn get_conversation_messages(state: &AppState, conversation_id: &str) -> Result<Vec<Arc<Message>>, String> {
    let conv_uuid = parse_id(conversation_id, "conversation")?;
    match state.chat.store().get(conv_uuid) {
        Some(conversation) => Ok(conversation.messages.clone()),
        None => {
            log::warn!("Messages requested for unknown conversation {}", conv_uuid);
            Err(format!("Conversation {} not found", conv_uuid))
        }
    }
}

pub fn delete_conversation(state: &AppState, conversation_id: &str) -> Result<(), String> {
    log::warn!("[CMD] Deleting conversation ID: {}", conversation_id);
    let conv_uuid = parse_id(conversation_id, "conversation")?;
    state
        .chat
        .store()
        .delete(conv_uuid)
        .map_err(|e| format!("Failed to delete conversation: {}", e))
}

pub fn rename_conversation(state: &AppState, conversation_id: &str, new_title: &str) -> Result<(), String> {
    let conv_uuid = parse_id(conversation_id, "conversation")?;
    let trimmed_title = new_title.trim();
    if trimmed_title.is_empty() {
        return Err("Conversation title cannot be empty.".to_string());
    }

    log::info!("Renaming conversation {} to: {}", conv_uuid, trimmed_title);
    state
        .chat
        .store()
        .rename(conv_uuid, trimmed_title)
        .map_err(|e| format!("Failed to rename conversation: {}", e))
}

pub fn update_conversation_model(state: &AppState, conversation_id: &str, model_id: &str) -> Result<(), String> {
    let conv_uuid = parse_id(conversation_id, "conversation")?;
    state
        .chat
        .set_conversation_model(conv_uuid, model_id.trim())
        .map_err(|e| format!("Failed to update conversation model: {}", e))
}

/// Sets the conversation's own system prompt; blank text clears it so the
/// default applies again.
pub fn update_conversation_system_prompt(
    state: &AppState,
    conversation_id: &str,
    system_prompt: &str,
) -> Result<(), String> {
    let conv_uuid = parse_id(conversation_id, "conversation")?;
    let system_prompt = Some(system_prompt.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    state
        .chat
        .store()
        .set_system_prompt(conv_uuid, system_prompt)
        .map_err(|e| format!("Failed to update system prompt: {}", e))
}

pub fn list_models(state: &AppState) -> Vec<Model> {
    state.chat.models().to_vec()
}

pub fn set_active_model(state: &AppState, model_id: &str) -> Result<Model, String> {
    state
        .chat
        .set_active_model(model_id.trim())
        .map_err(|e| format!("Failed to set model: {}", e))
}

pub fn set_system_prompt(state: &AppState, system_prompt: &str) -> Result<(), String> {
    let trimmed = system_prompt.trim();
    if trimmed.is_empty() {
        return Err("System prompt cannot be empty.".to_string());
    }
    state.chat.set_system_prompt(trimmed);
    Ok(())
}

/// Sends a message to `conversation_id`, or to the selected conversation when
/// absent. `Ok(None)` means the send was not started (empty input or a
/// response still streaming).
pub async fn send_message(
    state: &AppState,
    conversation_id: Option<&str>,
    content: &str,
    attachments: Vec<Attachment>,
) -> Result<Option<Turn>, String> {
    let conv_uuid = conversation_id
        .map(|id| parse_id(id, "conversation"))
        .transpose()?;
    if let Some(id) = conv_uuid {
        if state.chat.store().get(id).is_none() {
            return Err(format!("Conversation {} not found", id));
        }
    }

    log::info!("Sending message ({} attachments)", attachments.len());
    Ok(state.chat.send(conv_uuid, content, attachments).await)
}

pub async fn regenerate_response(
    state: &AppState,
    conversation_id: &str,
    message_id: &str,
) -> Result<Option<StreamOutcome>, String> {
    let conv_uuid = parse_id(conversation_id, "conversation")?;
    let msg_uuid = parse_id(message_id, "message")?;
    Ok(state.chat.regenerate(conv_uuid, msg_uuid).await)
}

/// Stops the stream writing `message_id`. Returns whether it was streaming.
pub fn stop_generation(state: &AppState, message_id: &str) -> Result<bool, String> {
    log::info!("Received request to stop generation for message ID: {}", message_id);
    let msg_uuid = parse_id(message_id, "message")?;
    Ok(state.chat.stop(msg_uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::tests::{controller_with, ScriptedProvider, StaticTitles};
    use crate::config::AppConfig;
    use crate::models::DEFAULT_TITLE;

    fn app(fragments: &[&str]) -> AppState {
        let provider = Arc::new(ScriptedProvider::replying(fragments));
        let chat = controller_with(provider, StaticTitles::new(Err("offline")));
        let config = AppConfig::from_lookup(|key| {
            (key == "PARLEY_DB_PATH").then(|| "/tmp/parley-test.sqlite".to_string())
        })
        .unwrap();
        AppState::new(chat, config)
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let state = app(&[]);
        let err = delete_conversation(&state, "not-a-uuid").unwrap_err();
        assert!(err.contains("Invalid conversation ID"));
        assert!(stop_generation(&state, "??").is_err());
    }

    #[test]
    fn rename_trims_and_rejects_blank_titles() {
        let state = app(&[]);
        let conversation = create_conversation(&state);
        let id = conversation.id.to_string();

        assert!(rename_conversation(&state, &id, "   ").is_err());
        rename_conversation(&state, &id, "  Trip plans ").unwrap();
        let renamed = select_conversation(&state, &id).unwrap();
        assert_eq!(renamed.title, "Trip plans");
    }

    #[test]
    fn conversation_system_prompt_can_be_cleared() {
        let state = app(&[]);
        let id = create_conversation(&state).id.to_string();

        update_conversation_system_prompt(&state, &id, "Answer in French").unwrap();
        let conversation = select_conversation(&state, &id).unwrap();
        assert_eq!(conversation.system_prompt.as_deref(), Some("Answer in French"));

        update_conversation_system_prompt(&state, &id, "  ").unwrap();
        assert_eq!(select_conversation(&state, &id).unwrap().system_prompt, None);
    }

    #[test]
    fn model_commands_use_the_catalog() {
        let state = app(&[]);
        assert_eq!(list_models(&state).len(), 3);
        assert!(set_active_model(&state, "nope").is_err());
        assert_eq!(set_active_model(&state, "gemini-3-pro-preview").unwrap().id, "gemini-3-pro-preview");
        assert_eq!(create_conversation(&state).model_id, "gemini-3-pro-preview");

        let id = create_conversation(&state).id.to_string();
        update_conversation_model(&state, &id, "gemini-2.5-flash-image").unwrap();
        assert_eq!(select_conversation(&state, &id).unwrap().model_id, "gemini-2.5-flash-image");
        assert!(update_conversation_model(&state, &id, "nope").is_err());
    }

    #[tokio::test]
    async fn send_and_list_round_trip() {
        let state = app(&["Hi ", "there"]);
        let turn = send_message(&state, None, "Hello", Vec::new())
            .await
            .unwrap()
            .expect("send accepted");
        turn.title_task.unwrap().await.unwrap();

        let conversations = list_conversations(&state);
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].title, DEFAULT_TITLE);

        let messages = get_conversation_messages(&state, &turn.conversation_id.to_string()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hi there");

        let outcome = regenerate_response(
            &state,
            &turn.conversation_id.to_string(),
            &turn.assistant_message_id.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Some(StreamOutcome::Completed));
        assert!(!stop_generation(&state, &turn.assistant_message_id.to_string()).unwrap());
    }

    #[tokio::test]
    async fn send_to_unknown_conversation_is_an_error() {
        let state = app(&["x"]);
        let missing = Uuid::new_v4().to_string();
        assert!(send_message(&state, Some(&missing), "Hi", Vec::new()).await.is_err());
        assert!(get_conversation_messages(&state, &missing).is_err());
    }

    #[test]
    fn deleting_selected_conversation_clears_selection() {
        let state = app(&[]);
        let id = create_conversation(&state).id.to_string();
        delete_conversation(&state, &id).unwrap();
        assert!(list_conversations(&state).is_empty());
        assert_eq!(state.chat.store().selected(), None);
        assert!(delete_conversation(&state, &id).is_err());
    }
}
