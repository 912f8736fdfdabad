//! Error types for the chatterbox-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Absent records are never errors; they surface as `None` or `false`.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Reading a file from disk failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema preparation or a legacy migration failed as a whole.
    #[error("migration stage `{stage}` failed: {message}")]
    Migration { stage: &'static str, message: String },

    /// A profile field name outside the whitelist was requested.
    #[error("unknown profile field: {0}")]
    UnknownField(String),

    /// A value of the wrong type was supplied for a profile field.
    #[error("field `{field}` expects a {expected} value")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },

    /// The ban word automaton of a channel could not be built.
    #[error("ban word matcher error: {0}")]
    Matcher(#[from] aho_corasick::BuildError),

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// The configuration is semantically invalid.
    #[error("config error: {0}")]
    Config(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    /// Shorthand for building a [`StoreError::Migration`].
    pub(crate) fn migration(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Migration {
            stage,
            message: err.to_string(),
        }
    }
}
