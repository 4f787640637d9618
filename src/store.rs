// In-memory conversation store. Mutations never edit values in place: each one
// publishes a new StoreState, so subscribers can spot changes with Arc::ptr_eq.

use crate::error::ChatError;
use crate::models::{Attachment, Conversation, Message, Role, DEFAULT_TITLE};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// One immutable snapshot of the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreState {
    pub conversations: Vec<Arc<Conversation>>,
    pub selected: Option<Uuid>,
}

impl StoreState {
    pub fn conversation(&self, conversation_id: Uuid) -> Option<&Arc<Conversation>> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn selected_conversation(&self) -> Option<&Arc<Conversation>> {
        self.selected.and_then(|id| self.conversation(id))
    }

    fn position(&self, conversation_id: Uuid) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == conversation_id)
    }
}

/// Where an assistant message lives: its identity plus the index it was last
/// seen at. The index is only a hint; lookups always confirm the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageSlot {
    pub message_id: Uuid,
    pub index: usize,
}

#[derive(Clone)]
pub struct ConversationStore {
    state: Arc<watch::Sender<Arc<StoreState>>>,
}

impl ConversationStore {
    /// Starts from previously persisted conversations; nothing is selected.
    pub fn new(conversations: Vec<Conversation>) -> Self {
        let state = StoreState {
            conversations: conversations.into_iter().map(Arc::new).collect(),
            selected: None,
        };
        Self {
            state: Arc::new(watch::Sender::new(Arc::new(state))),
        }
    }

    pub fn snapshot(&self) -> Arc<StoreState> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreState>> {
        self.state.subscribe()
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<Arc<Conversation>> {
        self.state.borrow().conversation(conversation_id).cloned()
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.state.borrow().selected
    }

    /// Conversations ordered for a history list, most recently used first.
    pub fn conversations_by_recency(&self) -> Vec<Arc<Conversation>> {
        let mut conversations = self.snapshot().conversations.clone();
        conversations.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        conversations
    }

    /// Creates an empty conversation, puts it first and selects it.
    pub fn create(&self, model_id: &str, system_prompt: Option<String>) -> Arc<Conversation> {
        let conversation = Arc::new(Conversation::new(model_id, system_prompt));
        self.state.send_modify(|state| {
            let mut conversations = Vec::with_capacity(state.conversations.len() + 1);
            conversations.push(conversation.clone());
            conversations.extend(state.conversations.iter().cloned());
            *state = Arc::new(StoreState {
                conversations,
                selected: Some(conversation.id),
            });
        });
        log::info!("Created conversation {} using model {}", conversation.id, model_id);
        conversation
    }

    /// Removes a conversation. Deleting the selected one leaves nothing selected.
    pub fn delete(&self, conversation_id: Uuid) -> Result<(), ChatError> {
        let removed = self.state.send_if_modified(|state| {
            let Some(pos) = state.position(conversation_id) else {
                return false;
            };
            let mut conversations = state.conversations.clone();
            conversations.remove(pos);
            let selected = state.selected.filter(|id| *id != conversation_id);
            *state = Arc::new(StoreState {
                conversations,
                selected,
            });
            true
        });

        if !removed {
            log::warn!("Attempted to delete non-existent conversation: {}", conversation_id);
            return Err(ChatError::ConversationNotFound(conversation_id));
        }
        log::info!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    pub fn select(&self, conversation_id: Uuid) -> Result<(), ChatError> {
        let mut found = false;
        self.state.send_if_modified(|state| {
            found = state.position(conversation_id).is_some();
            if !found || state.selected == Some(conversation_id) {
                return false;
            }
            *state = Arc::new(StoreState {
                conversations: state.conversations.clone(),
                selected: Some(conversation_id),
            });
            true
        });
        if found {
            Ok(())
        } else {
            Err(ChatError::ConversationNotFound(conversation_id))
        }
    }

    pub fn rename(&self, conversation_id: Uuid, title: &str) -> Result<(), ChatError> {
        self.update(conversation_id, |conversation| {
            if conversation.title == title {
                return Ok((None, ()));
            }
            let mut next = conversation.clone();
            next.title = title.to_string();
            Ok((Some(next), ()))
        })?;
        log::info!("Renamed conversation {} to: {}", conversation_id, title);
        Ok(())
    }

    /// Applies an automatically generated title. Only a conversation that still
    /// carries the default title is renamed; returns whether it was.
    pub fn apply_generated_title(&self, conversation_id: Uuid, title: &str) -> Result<bool, ChatError> {
        let (_, applied) = self.update(conversation_id, |conversation| {
            if conversation.title != DEFAULT_TITLE || title.trim().is_empty() {
                return Ok((None, false));
            }
            let mut next = conversation.clone();
            next.title = title.to_string();
            Ok((Some(next), true))
        })?;
        Ok(applied)
    }

    pub fn set_model(&self, conversation_id: Uuid, model_id: &str) -> Result<(), ChatError> {
        self.update(conversation_id, |conversation| {
            let mut next = conversation.clone();
            next.model_id = model_id.to_string();
            Ok((Some(next), ()))
        })?;
        Ok(())
    }

    pub fn set_system_prompt(&self, conversation_id: Uuid, system_prompt: Option<String>) -> Result<(), ChatError> {
        self.update(conversation_id, |conversation| {
            let mut next = conversation.clone();
            next.system_prompt = system_prompt;
            Ok((Some(next), ()))
        })?;
        Ok(())
    }

    /// Appends a user turn and bumps `last_updated`. Returns the conversation
    /// as it is right after the append.
    pub fn append_user_message(
        &self,
        conversation_id: Uuid,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Arc<Conversation>, ChatError> {
        let message = Arc::new(Message::user(text, attachments));
        let (conversation, ()) = self.update(conversation_id, |conversation| {
            let mut next = conversation.clone();
            next.messages.push(message.clone());
            next.last_updated = Utc::now();
            Ok((Some(next), ()))
        })?;
        log::debug!("Appended user message {} to conversation {}", message.id, conversation_id);
        Ok(conversation)
    }

    /// Appends an empty assistant message for a stream to fill.
    pub fn append_assistant_placeholder(&self, conversation_id: Uuid) -> Result<MessageSlot, ChatError> {
        let message = Arc::new(Message::assistant_placeholder());
        let (_, slot) = self.update(conversation_id, |conversation| {
            let mut next = conversation.clone();
            next.messages.push(message.clone());
            let slot = MessageSlot {
                message_id: message.id,
                index: next.messages.len() - 1,
            };
            Ok((Some(next), slot))
        })?;
        Ok(slot)
    }

    /// Replaces the assistant message content with everything received so far.
    pub fn merge_assistant_chunk(
        &self,
        conversation_id: Uuid,
        slot: MessageSlot,
        accumulated: &str,
    ) -> Result<MessageSlot, ChatError> {
        log::trace!("Merging {} bytes into message {}", accumulated.len(), slot.message_id);
        self.replace_assistant(conversation_id, slot, |message| {
            (message.content != accumulated).then(|| message.with_content(accumulated))
        })
    }

    /// Writes the final text of a finished stream.
    pub fn finalize_assistant(
        &self,
        conversation_id: Uuid,
        slot: MessageSlot,
        text: &str,
    ) -> Result<MessageSlot, ChatError> {
        self.replace_assistant(conversation_id, slot, |message| {
            (message.content != text).then(|| message.with_content(text))
        })
    }

    /// Replaces whatever the stream produced with a user-facing error text.
    pub fn fail_assistant(
        &self,
        conversation_id: Uuid,
        slot: MessageSlot,
        error_text: &str,
    ) -> Result<MessageSlot, ChatError> {
        self.replace_assistant(conversation_id, slot, |message| Some(message.with_content(error_text)))
    }

    /// Clears an assistant message for regeneration and restamps it.
    pub fn reset_assistant(&self, conversation_id: Uuid, message_id: Uuid) -> Result<MessageSlot, ChatError> {
        let slot = MessageSlot { message_id, index: 0 };
        self.replace_assistant(conversation_id, slot, |message| {
            Some(Message {
                content: String::new(),
                timestamp: Utc::now(),
                ..message.clone()
            })
        })
    }

    fn replace_assistant<F>(
        &self,
        conversation_id: Uuid,
        slot: MessageSlot,
        replace: F,
    ) -> Result<MessageSlot, ChatError>
    where
        F: FnOnce(&Message) -> Option<Message>,
    {
        let (_, slot) = self.update(conversation_id, |conversation| {
            let index = locate(conversation, slot)?;
            let current = &conversation.messages[index];
            if current.role != Role::Assistant {
                return Err(ChatError::NotAnAssistantMessage(current.id));
            }
            let slot = MessageSlot {
                message_id: current.id,
                index,
            };
            let Some(message) = replace(current) else {
                return Ok((None, slot));
            };
            let mut next = conversation.clone();
            next.messages[index] = Arc::new(message);
            Ok((Some(next), slot))
        })?;
        Ok(slot)
    }

    /// Runs `f` against one conversation inside a single store step.
    /// `f` returns the replacement conversation (`None` for "unchanged") and a
    /// value to hand back together with the resulting conversation.
    fn update<T, F>(&self, conversation_id: Uuid, f: F) -> Result<(Arc<Conversation>, T), ChatError>
    where
        F: FnOnce(&Conversation) -> Result<(Option<Conversation>, T), ChatError>,
    {
        let mut outcome = Err(ChatError::ConversationNotFound(conversation_id));
        self.state.send_if_modified(|state| {
            let Some(pos) = state.position(conversation_id) else {
                return false;
            };
            match f(&state.conversations[pos]) {
                Ok((Some(next), value)) => {
                    let next = Arc::new(next);
                    let mut conversations = state.conversations.clone();
                    conversations[pos] = next.clone();
                    *state = Arc::new(StoreState {
                        conversations,
                        selected: state.selected,
                    });
                    outcome = Ok((next, value));
                    true
                }
                Ok((None, value)) => {
                    outcome = Ok((state.conversations[pos].clone(), value));
                    false
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }
}

fn locate(conversation: &Conversation, slot: MessageSlot) -> Result<usize, ChatError> {
    match conversation.messages.get(slot.index) {
        Some(message) if message.id == slot.message_id => Ok(slot.index),
        _ => conversation
            .position(slot.message_id)
            .ok_or(ChatError::MessageNotFound {
                conversation_id: conversation.id,
                message_id: slot.message_id,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_conversation() -> (ConversationStore, Uuid) {
        let store = ConversationStore::new(Vec::new());
        let conversation = store.create("gemini-3-flash-preview", None);
        (store, conversation.id)
    }

    #[test]
    fn create_prepends_and_selects() {
        let (store, first) = store_with_conversation();
        let second = store.create("gemini-3-pro-preview", Some("sys".to_string())).id;

        let state = store.snapshot();
        assert_eq!(state.conversations[0].id, second);
        assert_eq!(state.conversations[1].id, first);
        assert_eq!(state.selected, Some(second));
        assert_eq!(state.conversations[0].title, DEFAULT_TITLE);
    }

    #[test]
    fn delete_selected_clears_selection() {
        let (store, id) = store_with_conversation();
        store.delete(id).unwrap();
        assert_eq!(store.selected(), None);
        assert!(store.snapshot().conversations.is_empty());
        assert!(matches!(store.delete(id), Err(ChatError::ConversationNotFound(_))));
    }

    #[test]
    fn delete_other_keeps_selection() {
        let (store, first) = store_with_conversation();
        let second = store.create("m", None).id;
        store.delete(first).unwrap();
        assert_eq!(store.selected(), Some(second));
    }

    #[test]
    fn select_unknown_conversation_fails() {
        let (store, id) = store_with_conversation();
        assert!(store.select(Uuid::new_v4()).is_err());
        assert_eq!(store.selected(), Some(id));
    }

    #[test]
    fn mutations_replace_rather_than_edit() {
        let (store, id) = store_with_conversation();
        let before = store.snapshot();
        let conversation = store.append_user_message(id, "Hello", Vec::new()).unwrap();

        let after = store.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.conversation(id).unwrap().messages.is_empty());
        assert!(Arc::ptr_eq(after.conversation(id).unwrap(), &conversation));
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn append_user_message_bumps_last_updated() {
        let (store, id) = store_with_conversation();
        let created = store.get(id).unwrap().last_updated;
        let conversation = store.append_user_message(id, "Hello", Vec::new()).unwrap();
        assert!(conversation.last_updated >= created);
        assert_eq!(conversation.messages[0].role, Role::User);
    }

    #[test]
    fn merge_finalize_and_fail_target_the_slot() {
        let (store, id) = store_with_conversation();
        store.append_user_message(id, "Q", Vec::new()).unwrap();
        let slot = store.append_assistant_placeholder(id).unwrap();
        assert_eq!(slot.index, 1);

        store.merge_assistant_chunk(id, slot, "Hel").unwrap();
        store.merge_assistant_chunk(id, slot, "Hello").unwrap();
        assert_eq!(store.get(id).unwrap().messages[1].content, "Hello");

        let unchanged = store.snapshot();
        store.finalize_assistant(id, slot, "Hello").unwrap();
        assert!(Arc::ptr_eq(&unchanged, &store.snapshot()));

        store.fail_assistant(id, slot, "oops").unwrap();
        assert_eq!(store.get(id).unwrap().messages[1].content, "oops");
    }

    #[test]
    fn stale_index_still_finds_message_by_id() {
        let (store, id) = store_with_conversation();
        store.append_user_message(id, "Q", Vec::new()).unwrap();
        let slot = store.append_assistant_placeholder(id).unwrap();

        let stale = MessageSlot { index: 7, ..slot };
        let found = store.merge_assistant_chunk(id, stale, "A").unwrap();
        assert_eq!(found, slot);
    }

    #[test]
    fn content_writes_refuse_user_messages() {
        let (store, id) = store_with_conversation();
        let conversation = store.append_user_message(id, "Q", Vec::new()).unwrap();
        let user_slot = MessageSlot {
            message_id: conversation.messages[0].id,
            index: 0,
        };
        assert!(matches!(
            store.merge_assistant_chunk(id, user_slot, "x"),
            Err(ChatError::NotAnAssistantMessage(_))
        ));
        assert_eq!(store.get(id).unwrap().messages[0].content, "Q");
    }

    #[test]
    fn reset_assistant_clears_content() {
        let (store, id) = store_with_conversation();
        store.append_user_message(id, "Q", Vec::new()).unwrap();
        let slot = store.append_assistant_placeholder(id).unwrap();
        store.finalize_assistant(id, slot, "A").unwrap();
        let old_timestamp = store.get(id).unwrap().messages[1].timestamp;

        let reset = store.reset_assistant(id, slot.message_id).unwrap();
        assert_eq!(reset, slot);
        let message = store.get(id).unwrap().messages[1].clone();
        assert_eq!(message.content, "");
        assert!(message.timestamp >= old_timestamp);
        assert_eq!(message.id, slot.message_id);
    }

    #[test]
    fn generated_title_does_not_override_a_rename() {
        let (store, id) = store_with_conversation();
        assert!(store.apply_generated_title(id, "Rust Questions").unwrap());
        assert_eq!(store.get(id).unwrap().title, "Rust Questions");

        let (store, id) = store_with_conversation();
        store.rename(id, "Mine").unwrap();
        assert!(!store.apply_generated_title(id, "Rust Questions").unwrap());
        assert_eq!(store.get(id).unwrap().title, "Mine");
    }

    #[test]
    fn subscribers_observe_every_mutation() {
        let (store, id) = store_with_conversation();
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store.rename(id, "Renamed").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().conversation(id).unwrap().title, "Renamed");

        store.rename(id, "Renamed").unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn history_list_orders_by_recency() {
        let store = ConversationStore::new(Vec::new());
        let older = store.create("m", None).id;
        let newer = store.create("m", None).id;
        store.append_user_message(older, "bump", Vec::new()).unwrap();

        let ids: Vec<Uuid> = store.conversations_by_recency().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![older, newer]);
    }
}
