// Durable storage of the conversation list, kept under one key and rewritten whole.

use crate::models::Conversation;
use crate::store::{ConversationStore, StoreState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const CONVERSATIONS_KEY: &str = "parley_conversations";
const CORRUPT_SUFFIX: &str = ".corrupt";
const SCHEMA_VERSION: u32 = 1;

const MIGRATIONS_SQL: &str = "
-- Application Settings Table (Key-Value)
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed key-value storage.
#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database at `db_path` and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private database that disappears with the process.
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for StorageManager {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read setting {}", key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write setting {}", key))?;
        Ok(())
    }
}

/// Key-value storage kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, String>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotOut<'a> {
    version: u32,
    conversations: &'a [Arc<Conversation>],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotIn {
    Versioned {
        version: u32,
        conversations: Vec<Conversation>,
    },
    // Written before the envelope existed.
    Legacy(Vec<Conversation>),
}

/// Loads and saves the conversation list through a [`KeyValueStore`].
#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn KeyValueStore>,
}

impl PersistentStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Reads the stored conversations. Missing or unparsable data yields an
    /// empty list; unparsable data is first copied aside under a backup key.
    pub async fn load(&self) -> Result<Vec<Conversation>> {
        let Some(raw) = self.backend.get(CONVERSATIONS_KEY).await? else {
            log::info!("No stored conversations found");
            return Ok(Vec::new());
        };

        match serde_json::from_str::<SnapshotIn>(&raw) {
            Ok(SnapshotIn::Versioned {
                version,
                conversations,
            }) => {
                if version > SCHEMA_VERSION {
                    log::warn!(
                        "Stored conversations use schema version {} (expected {}), loading what can be read",
                        version,
                        SCHEMA_VERSION
                    );
                }
                log::info!("Loaded {} conversations", conversations.len());
                Ok(conversations)
            }
            Ok(SnapshotIn::Legacy(conversations)) => {
                log::info!("Loaded {} conversations from unversioned snapshot", conversations.len());
                Ok(conversations)
            }
            Err(e) => {
                log::warn!("Stored conversations are unreadable, starting empty: {}", e);
                let backup_key = format!("{}{}", CONVERSATIONS_KEY, CORRUPT_SUFFIX);
                if let Err(e) = self.backend.set(&backup_key, &raw).await {
                    log::error!("Failed to back up unreadable conversations: {:#}", e);
                }
                Ok(Vec::new())
            }
        }
    }

    /// Overwrites the stored list with `conversations`.
    pub async fn save(&self, conversations: &[Arc<Conversation>]) -> Result<()> {
        let snapshot = SnapshotOut {
            version: SCHEMA_VERSION,
            conversations,
        };
        let raw = serde_json::to_string(&snapshot).context("Failed to serialize conversations")?;
        self.backend.set(CONVERSATIONS_KEY, &raw).await?;
        log::debug!("Saved {} conversations", conversations.len());
        Ok(())
    }
}

/// Background writer that saves the store after every change.
pub struct Persister {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Persister {
    pub fn spawn(store: &ConversationStore, persistent: PersistentStore) -> Self {
        let mut changes = store.subscribe();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Bursts collapse into whatever is newest by now.
                        let snapshot = changes.borrow_and_update().clone();
                        save_logged(&persistent, &snapshot).await;
                    }
                }
            }

            let last = changes.borrow().clone();
            save_logged(&persistent, &last).await;
        });

        Self { shutdown, task }
    }

    /// Stops watching and writes the final state before returning.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            log::error!("Persistence task ended abnormally: {}", e);
        }
    }
}

async fn save_logged(persistent: &PersistentStore, state: &StoreState) {
    if let Err(e) = persistent.save(&state.conversations).await {
        log::error!("Failed to persist conversations: {:#}", e);
    }
}
