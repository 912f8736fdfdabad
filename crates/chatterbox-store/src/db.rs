//! SQLite database setup with WAL mode, mmap, and performance pragmas.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.
//! It also owns the [`Caches`] registry so every store built from a clone
//! of the same handle sees the same cache entries.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::cache::Caches;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::migration::{self, MigrationReport};
use crate::schema;

/// Thread-safe handle to the shared SQLite connection.
///
/// All read/write operations go through [`Database::execute`] which
/// dispatches onto the blocking thread pool via `tokio::task::spawn_blocking`.
/// Transactions are explicit and never nested.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    caches: Caches,
    config: Arc<StoreConfig>,
}

impl Database {
    /// Open (or create) a database at `path` and apply performance pragmas.
    ///
    /// This call blocks briefly (file I/O), so call it during startup before
    /// entering the main async loop, or wrap it in `spawn_blocking` yourself.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn, config)?;

        Ok(Self::wrap(conn, config))
    }

    /// Create an in-memory database with default configuration, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open_in_memory_with(&StoreConfig::default())
    }

    /// Create an in-memory database with the given configuration.
    pub fn open_in_memory_with(config: &StoreConfig) -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn, config)?;

        Ok(Self::wrap(conn, config))
    }

    /// Open the configured database file and bring its schema up to date.
    pub async fn open_and_prepare(config: &StoreConfig) -> StoreResult<(Self, MigrationReport)> {
        let path = config.database_path.clone();
        let owned = config.clone();
        let db = tokio::task::spawn_blocking(move || Self::open(&path, &owned)).await??;
        let report = db.prepare().await?;
        Ok((db, report))
    }

    /// Create every table family, then migrate any legacy layout.
    ///
    /// Both steps are transactional; a failure in either is fatal and the
    /// error propagates to the caller.
    pub async fn prepare(&self) -> StoreResult<MigrationReport> {
        self.execute_mut(|conn| {
            schema::ensure_schema(conn)?;
            migration::migrate_if_needed(conn)
        })
        .await
    }

    /// Execute an arbitrary closure against the connection on the blocking pool.
    ///
    /// The closure receives a `&Connection` and must return a `StoreResult<T>`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM users_twitch", [], |row| row.get(0))?;
    ///     Ok(count)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Execute a mutable closure (for transactions, etc.) on the blocking pool.
    ///
    /// The closure receives a `&mut Connection` so you can call
    /// `conn.transaction()` and friends.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    /// The cache registry shared by every store on this database.
    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// The configuration this handle was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn wrap(conn: Connection, config: &StoreConfig) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            caches: Caches::new(config),
            config: Arc::new(config.clone()),
        }
    }

    // ── pragmas ──────────────────────────────────────────────────────

    /// Apply all performance pragmas to a fresh connection.
    fn apply_pragmas(conn: &Connection, config: &StoreConfig) -> StoreResult<()> {
        debug!("applying SQLite performance pragmas");

        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL sync is safe with WAL: a power failure loses the last transaction,
        // it does not corrupt the file.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 256 MiB memory-mapped I/O.
        conn.pragma_update(None, "mmap_size", 268_435_456_i64)?;

        // Negative value means KiB: -64000 = ~62 MiB page cache.
        conn.pragma_update(None, "cache_size", -64_000_i32)?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // Busy timeout so a second process waits instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", config.busy_timeout_ms)?;

        info!(
            busy_timeout_ms = config.busy_timeout_ms,
            "database pragmas applied (WAL, mmap 256MiB, cache 62MiB)"
        );
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
