// Stream and regeneration controller

use crate::api::{ChatRequest, LLMApiProvider};
use crate::error::ChatError;
use crate::gate::{StreamGate, StreamPermit, StreamStatus};
use crate::models::{Attachment, Conversation, Message, Model, Role};
use crate::store::{ConversationStore, MessageSlot};
use crate::title::TitleGenerator;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const SEND_ERROR_TEXT: &str =
    "Sorry, I encountered an error while processing your request. Please try again.";
pub const REGENERATE_ERROR_TEXT: &str =
    "Sorry, I couldn't regenerate this response. Please try again.";

/// Title seed used when the first message only carries attachments.
const ATTACHMENT_ONLY_TITLE_SEED: &str = "File Analysis";

/// How a generation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// The backend failed; the message holds the error text.
    Failed,
    /// Stopped on request; the message keeps the partial text.
    Cancelled,
    /// The target message or conversation disappeared mid-stream.
    Abandoned,
}

/// Result of an accepted send.
#[derive(Debug)]
pub struct Turn {
    pub conversation_id: Uuid,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub outcome: StreamOutcome,
    /// Present when this send started a conversation and kicked off title generation.
    pub title_task: Option<JoinHandle<()>>,
}

/// Global defaults applied to new conversations.
#[derive(Clone, Debug)]
pub struct ChatSettings {
    pub active_model: Model,
    pub system_prompt: String,
}

pub struct ChatController {
    store: ConversationStore,
    provider: Arc<dyn LLMApiProvider>,
    titles: Arc<dyn TitleGenerator>,
    models: Vec<Model>,
    settings: RwLock<ChatSettings>,
    gate: StreamGate,
    /// Stop signals of running streams, keyed by the message being written.
    cancel_signals: DashMap<Uuid, Arc<Notify>>,
}

impl ChatController {
    pub fn new(
        store: ConversationStore,
        provider: Arc<dyn LLMApiProvider>,
        titles: Arc<dyn TitleGenerator>,
        models: Vec<Model>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            provider,
            titles,
            models,
            settings: RwLock::new(settings),
            gate: StreamGate::new(),
            cancel_signals: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn gate(&self) -> &StreamGate {
        &self.gate
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn settings(&self) -> ChatSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Selects the model used by conversations created from now on.
    pub fn set_active_model(&self, model_id: &str) -> Result<Model, ChatError> {
        let model = self.find_model(model_id)?;
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .active_model = model.clone();
        log::info!("Active model set to {}", model.id);
        Ok(model)
    }

    /// Replaces the process-wide default system prompt.
    pub fn set_system_prompt(&self, system_prompt: &str) {
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .system_prompt = system_prompt.to_string();
    }

    /// Switches an existing conversation to another catalog model for future sends.
    pub fn set_conversation_model(&self, conversation_id: Uuid, model_id: &str) -> Result<(), ChatError> {
        let model = self.find_model(model_id)?;
        self.store.set_model(conversation_id, &model.id)
    }

    /// Creates and selects a conversation bound to the active model and the
    /// current default system prompt.
    pub fn new_conversation(&self) -> Arc<Conversation> {
        let settings = self.settings();
        self.store
            .create(&settings.active_model.id, Some(settings.system_prompt))
    }

    /// Sends a user message and streams the reply into a new assistant message.
    ///
    /// `conversation_id` defaults to the selected conversation; with nothing
    /// selected a conversation is created first. Returns `None` without side
    /// effects when the message is empty, another stream is running, or the
    /// conversation does not exist.
    pub async fn send(
        &self,
        conversation_id: Option<Uuid>,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Option<Turn> {
        if text.trim().is_empty() && attachments.is_empty() {
            log::debug!("Ignoring empty message");
            return None;
        }
        let Some(permit) = self.gate.try_acquire() else {
            log::warn!("A response is still being generated, ignoring send");
            return None;
        };

        let conversation_id = match conversation_id.or_else(|| self.store.selected()) {
            Some(id) => id,
            None => self.new_conversation().id,
        };

        let conversation = match self.store.append_user_message(conversation_id, text, attachments) {
            Ok(conversation) => conversation,
            Err(e) => {
                log::warn!("Cannot send message: {}", e);
                return None;
            }
        };
        let user_message_id = conversation.messages.last()?.id;

        let title_task = (conversation.messages.len() == 1).then(|| {
            let seed = if text.trim().is_empty() {
                ATTACHMENT_ONLY_TITLE_SEED
            } else {
                text
            };
            self.spawn_title_generation(conversation_id, seed.to_string())
        });

        let slot = match self.store.append_assistant_placeholder(conversation_id) {
            Ok(slot) => slot,
            Err(e) => {
                log::warn!("Conversation {} vanished before streaming: {}", conversation_id, e);
                return None;
            }
        };

        let request = self.build_request(&conversation, conversation.messages.clone());
        let outcome = self
            .drive_stream(permit, conversation_id, slot, request, SEND_ERROR_TEXT)
            .await;

        Some(Turn {
            conversation_id,
            user_message_id,
            assistant_message_id: slot.message_id,
            outcome,
            title_task,
        })
    }

    /// Re-runs generation for an existing assistant message in place.
    ///
    /// The message must be an assistant message directly preceded by a user
    /// message. Everything before it is resent; its own old content is not.
    /// Returns `None` without side effects when any precondition fails.
    pub async fn regenerate(&self, conversation_id: Uuid, message_id: Uuid) -> Option<StreamOutcome> {
        let Some(permit) = self.gate.try_acquire() else {
            log::warn!("A response is still being generated, ignoring regenerate");
            return None;
        };
        let Some(conversation) = self.store.get(conversation_id) else {
            log::warn!("Cannot regenerate in unknown conversation {}", conversation_id);
            return None;
        };
        let Some(index) = conversation.position(message_id) else {
            log::warn!("Message {} not found in conversation {}", message_id, conversation_id);
            return None;
        };

        let follows_user_turn = index > 0 && conversation.messages[index - 1].role == Role::User;
        if conversation.messages[index].role != Role::Assistant || !follows_user_turn {
            log::warn!(
                "Message {} is not an assistant reply to a user message, not regenerating",
                message_id
            );
            return None;
        }

        let history = conversation.messages[..index].to_vec();
        let slot = match self.store.reset_assistant(conversation_id, message_id) {
            Ok(slot) => slot,
            Err(e) => {
                log::warn!("Cannot reset message {}: {}", message_id, e);
                return None;
            }
        };

        log::info!("Regenerating message {} in conversation {}", message_id, conversation_id);
        let request = self.build_request(&conversation, history);
        Some(
            self.drive_stream(permit, conversation_id, slot, request, REGENERATE_ERROR_TEXT)
                .await,
        )
    }

    /// Stops the stream writing `message_id` without waiting for the backend
    /// to send anything else. Returns false when that message is not
    /// currently streaming.
    pub fn stop(&self, message_id: Uuid) -> bool {
        match self.gate.status() {
            StreamStatus::Streaming { message_id: active, .. } if active == message_id => {
                let Some(signal) = self.cancel_signals.get(&message_id) else {
                    return false;
                };
                // notify_one keeps a permit if the stream is not waiting yet.
                signal.notify_one();
                log::info!("Cancellation signal set for message ID: {}", message_id);
                true
            }
            _ => false,
        }
    }

    /// Stops whatever is streaming right now.
    pub fn stop_active(&self) -> bool {
        match self.gate.status() {
            StreamStatus::Streaming { message_id, .. } => self.stop(message_id),
            _ => false,
        }
    }

    fn find_model(&self, model_id: &str) -> Result<Model, ChatError> {
        self.models
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
            .ok_or_else(|| ChatError::UnknownModel(model_id.to_string()))
    }

    fn build_request(&self, conversation: &Conversation, messages: Vec<Arc<Message>>) -> ChatRequest {
        let settings = self.settings();
        ChatRequest {
            model_id: conversation.model_id.clone(),
            messages,
            system_prompt: conversation
                .effective_system_prompt(&settings.system_prompt)
                .to_string(),
        }
    }

    fn spawn_title_generation(&self, conversation_id: Uuid, seed: String) -> JoinHandle<()> {
        let store = self.store.clone();
        let titles = self.titles.clone();
        tokio::spawn(async move {
            match titles.generate_title(&seed).await {
                Ok(title) => match store.apply_generated_title(conversation_id, &title) {
                    Ok(true) => log::info!("Conversation {} titled: {}", conversation_id, title),
                    Ok(false) => log::debug!("Conversation {} already renamed, keeping title", conversation_id),
                    Err(e) => log::debug!("Dropping generated title: {}", e),
                },
                Err(e) => log::warn!("Title generation failed for {}: {:#}", conversation_id, e),
            }
        })
    }

    /// Streams `request` into the assistant message at `slot`. The permit is
    /// held for the whole generation and released on every exit path.
    async fn drive_stream(
        &self,
        permit: StreamPermit,
        conversation_id: Uuid,
        slot: MessageSlot,
        request: ChatRequest,
        error_text: &str,
    ) -> StreamOutcome {
        let cancel = Arc::new(Notify::new());
        self.cancel_signals.insert(slot.message_id, cancel.clone());
        permit.bind(conversation_id, slot.message_id);
        let outcome = self
            .pump(conversation_id, slot, &request, error_text, &cancel)
            .await;
        self.cancel_signals.remove(&slot.message_id);
        log::info!(
            "Stream for message {} in conversation {} finished: {:?}",
            slot.message_id,
            conversation_id,
            outcome
        );
        drop(permit);
        outcome
    }

    async fn pump(
        &self,
        conversation_id: Uuid,
        mut slot: MessageSlot,
        request: &ChatRequest,
        error_text: &str,
        cancel: &Notify,
    ) -> StreamOutcome {
        log::info!(
            "Starting stream for message {} with model {} ({} messages of history)",
            slot.message_id,
            request.model_id,
            request.messages.len()
        );
        let opened = tokio::select! {
            biased;
            _ = cancel.notified() => {
                log::warn!("Cancellation requested for message {} before the stream opened", slot.message_id);
                return StreamOutcome::Cancelled;
            }
            opened = self.provider.stream_chat(request) => opened,
        };
        let mut delta_stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to initiate stream for message {}: {:#}", slot.message_id, e);
                return self.fail(conversation_id, slot, error_text);
            }
        };

        let mut accumulated = String::new();
        loop {
            let delta_result = tokio::select! {
                biased;
                _ = cancel.notified() => {
                    log::warn!("Cancellation requested for message {}. Stopping stream.", slot.message_id);
                    return StreamOutcome::Cancelled;
                }
                next = delta_stream.next() => match next {
                    Some(delta_result) => delta_result,
                    None => break,
                },
            };

            match delta_result {
                Ok(delta) => {
                    log::debug!("Received chunk of {} bytes for message {}", delta.len(), slot.message_id);
                    accumulated.push_str(&delta);
                    slot = match self.store.merge_assistant_chunk(conversation_id, slot, &accumulated) {
                        Ok(slot) => slot,
                        Err(e) => {
                            log::warn!("Stopping stream, target message is gone: {}", e);
                            return StreamOutcome::Abandoned;
                        }
                    };
                }
                Err(e) => {
                    log::error!("Error receiving stream delta for message {}: {:#}", slot.message_id, e);
                    return self.fail(conversation_id, slot, error_text);
                }
            }
        }

        match self.store.finalize_assistant(conversation_id, slot, &accumulated) {
            Ok(_) => StreamOutcome::Completed,
            Err(e) => {
                log::warn!("Could not finalize message {}: {}", slot.message_id, e);
                StreamOutcome::Abandoned
            }
        }
    }

    fn fail(&self, conversation_id: Uuid, slot: MessageSlot, error_text: &str) -> StreamOutcome {
        match self.store.fail_assistant(conversation_id, slot, error_text) {
            Ok(_) => StreamOutcome::Failed,
            Err(e) => {
                log::warn!("Could not record failure on message {}: {}", slot.message_id, e);
                StreamOutcome::Abandoned
            }
        }
    }
}
