// Declare the modules
pub mod api;
pub mod attachments;
pub mod chat;
pub mod commands;
pub mod config;
pub mod error;
pub mod gate;
pub mod models;
pub mod state;
pub mod storage;
pub mod store;
pub mod terminal;
pub mod title;

use config::AppConfig;
use state::AppState;

async fn start() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let (app_state, persister) = AppState::initialize(config).await?;

    let result = terminal::run(&app_state).await;

    // Flush the final state even when the front end failed.
    persister.shutdown().await;
    result
}

pub fn run() {
    // Initialize logging
    env_logger::init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(start()) {
        log::error!("parley exited with an error: {:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
