//! Store configuration.
//!
//! Read from the `[store]` table of a TOML file. Every field has a default,
//! so a missing file or a missing table yields [`StoreConfig::default`].

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Tunables for the persistence layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub database_path: PathBuf,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u32,
    /// Maximum entries in the username → id cache.
    pub username_cache_capacity: u64,
    /// Maximum entries in the positive role cache.
    pub role_cache_capacity: u64,
    /// Maximum entries in the profile existence cache.
    pub profile_cache_capacity: u64,
    /// Maximum entries in the command prefix cache.
    pub prefix_cache_capacity: u64,
    /// Maximum channels whose ban word matcher is kept compiled.
    pub ban_word_cache_capacity: u64,
    /// Bound parameters allowed in a single statement.
    pub max_statement_params: usize,
    /// Pending changes that trigger an automatic batch flush.
    pub batch_flush_threshold: usize,
    /// Changes a batch buffer keeps queued across failed flushes; older
    /// changes past this limit are dropped.
    pub batch_max_pending: usize,
    /// Period of the background batch flusher.
    pub batch_flush_interval_ms: u64,
    /// Command prefix for channels without an explicit one.
    pub default_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/chatterbox.db"),
            busy_timeout_ms: 5_000,
            username_cache_capacity: 100_000,
            role_cache_capacity: 100_000,
            profile_cache_capacity: 100_000,
            prefix_cache_capacity: 100_000,
            ban_word_cache_capacity: 10_000,
            max_statement_params: 999,
            batch_flush_threshold: 500,
            batch_max_pending: 50_000,
            batch_flush_interval_ms: 5_000,
            default_prefix: "!".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    store: Option<StoreConfig>,
}

impl StoreConfig {
    /// Parse the `[store]` table out of a TOML document.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        let config = file.store.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file missing, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject values the store cannot operate with.
    pub fn validate(&self) -> StoreResult<()> {
        // A channel-count upsert row binds three parameters.
        if self.max_statement_params < 3 {
            return Err(StoreError::Config(format!(
                "max_statement_params must be at least 3, got {}",
                self.max_statement_params
            )));
        }
        if self.default_prefix.trim().is_empty() {
            return Err(StoreError::Config("default_prefix must not be blank".into()));
        }
        if self.batch_flush_threshold == 0 {
            return Err(StoreError::Config(
                "batch_flush_threshold must be positive".into(),
            ));
        }
        if self.batch_max_pending < self.batch_flush_threshold {
            return Err(StoreError::Config(format!(
                "batch_max_pending ({}) must not be below batch_flush_threshold ({})",
                self.batch_max_pending, self.batch_flush_threshold
            )));
        }
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_statement_params, 999);
        assert_eq!(config.default_prefix, "!");
    }

    #[test]
    fn partial_table_overrides_only_named_fields() {
        let config = StoreConfig::from_toml_str(
            r#"
            [store]
            database_path = "/tmp/bot.db"
            default_prefix = "?"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/bot.db"));
        assert_eq!(config.default_prefix, "?");
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn other_tables_are_ignored() {
        let config = StoreConfig::from_toml_str("[bot]\nhistory_window = 3\n").unwrap();
        assert_eq!(config.batch_flush_threshold, 500);
    }

    #[test]
    fn too_few_params_is_rejected() {
        let err = StoreConfig::from_toml_str("[store]\nmax_statement_params = 2\n").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn pending_limit_below_threshold_is_rejected() {
        let err = StoreConfig::from_toml_str(
            "[store]\nbatch_flush_threshold = 100\nbatch_max_pending = 10\n",
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let err = StoreConfig::from_toml_str("[store\n").unwrap_err();
        assert!(matches!(err, StoreError::Toml(_)));
    }

    #[test]
    fn shipped_config_parses() {
        let config =
            StoreConfig::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.database_path, PathBuf::from("data/chatterbox.db"));
        assert_eq!(config.batch_flush_interval_ms, 5_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = StoreConfig::load("/definitely/not/here.toml").unwrap();
        assert_eq!(config.busy_timeout_ms, 5_000);
    }
}
