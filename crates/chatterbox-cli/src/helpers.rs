//! Shared helpers for the CLI subcommands.

use std::path::Path;

use anyhow::{Context, Result};
use chatterbox_store::StoreConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured database path.
pub const DB_PATH_ENV: &str = "CHATTERBOX_DB";

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Load the store configuration, applying `.env` and environment overrides.
pub fn load_config(path: &Path) -> Result<StoreConfig> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let mut config = StoreConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    if let Ok(db_path) = std::env::var(DB_PATH_ENV)
        && !db_path.trim().is_empty()
    {
        debug!(%db_path, "database path overridden from environment");
        config.database_path = db_path.into();
    }
    Ok(config)
}
