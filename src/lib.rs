pub mod agent_engine;
pub mod agents;
pub mod browser;
pub mod commands;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod scheduler;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::browser::chrome::ChromeLauncher;
use crate::config::AppConfig;
use crate::errors::PilotResult;
use crate::llm::registry::ProviderRegistry;
use crate::scheduler::manager::{RuntimeFactory, TaskScheduler};

pub async fn run() -> PilotResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let config = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load config; using defaults");
            AppConfig::default()
        }
    };

    let registry = ProviderRegistry::from_config(&config);
    let launcher = Arc::new(ChromeLauncher::new(
        config.browser.headless,
        config.browser.chrome_path.clone(),
    ));
    let bind = config.server.bind.clone();
    let factory = Arc::new(RuntimeFactory::new(config, registry, launcher));
    let scheduler = TaskScheduler::new(factory);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(addr = %bind, "task API listening");
    axum::serve(listener, commands::router(scheduler.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
