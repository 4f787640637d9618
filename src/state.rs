use crate::api::build_provider;
use crate::chat::{ChatController, ChatSettings};
use crate::config::{get_api_key, AppConfig};
use crate::error::ChatError;
use crate::storage::{PersistentStore, Persister, StorageManager};
use crate::store::ConversationStore;
use crate::title::LlmTitleGenerator;
use anyhow::{Context, Result};
use std::sync::Arc;

// Core application state shared by the command layer and front end
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatController>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(chat: ChatController, config: AppConfig) -> Self {
        Self {
            chat: Arc::new(chat),
            config: Arc::new(config),
        }
    }

    /// Wires everything up from validated configuration: resolves the API key
    /// (failing before anything else starts), opens storage, loads saved
    /// conversations and starts persisting changes.
    pub async fn initialize(config: AppConfig) -> Result<(Self, Persister)> {
        let api_key = get_api_key(&config)?;
        let provider = build_provider(&config, api_key)?;
        let active_model = config
            .model(&config.default_model_id)
            .cloned()
            .ok_or_else(|| ChatError::UnknownModel(config.default_model_id.clone()))?;

        let storage = StorageManager::open(&config.database_path)
            .await
            .context("Failed to open conversation storage")?;
        let persistent = PersistentStore::new(Arc::new(storage));
        let conversations = persistent.load().await?;

        let store = ConversationStore::new(conversations);
        let persister = Persister::spawn(&store, persistent);

        let titles = Arc::new(LlmTitleGenerator::new(provider.clone(), config.title_model_id.clone()));
        log::info!(
            "Using {} backend at {} with model {}",
            config.provider.name(),
            config.api_url,
            active_model.id
        );

        let chat = ChatController::new(
            store,
            provider,
            titles,
            config.models.clone(),
            ChatSettings {
                active_model,
                system_prompt: config.system_prompt.clone(),
            },
        );
        Ok((Self::new(chat, config), persister))
    }
}
