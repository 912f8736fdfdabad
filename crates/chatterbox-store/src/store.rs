//! Entry point bundling every component store over one database.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::batch::{BatchBuffer, BatchWriter};
use crate::channel::ChannelStore;
use crate::config::StoreConfig;
use crate::cooldown::CooldownStore;
use crate::counter::CounterStore;
use crate::db::Database;
use crate::error::StoreResult;
use crate::identity::IdentityIndex;
use crate::migration::MigrationReport;
use crate::platform::{Entity, Platform};
use crate::profile::ProfileStore;
use crate::role::RoleStore;

/// Row count of one (platform, table family) pair.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TableCount {
    pub platform: Platform,
    pub table: String,
    pub rows: i64,
}

/// A prepared database plus the stores built on it.
///
/// Cloning is cheap; every clone shares the connection and cache registry.
#[derive(Clone)]
pub struct ChatStore {
    db: Database,
}

impl ChatStore {
    /// Open the configured database file, create the catalog and migrate
    /// any legacy layout.
    pub async fn open(config: &StoreConfig) -> StoreResult<(Self, MigrationReport)> {
        config.validate()?;
        let (db, report) = Database::open_and_prepare(config).await?;
        info!(
            path = %config.database_path.display(),
            migrated = !report.is_empty(),
            "store ready"
        );
        Ok((Self { db }, report))
    }

    /// A prepared in-memory store with default configuration.
    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::open_in_memory_with(&StoreConfig::default()).await
    }

    /// A prepared in-memory store with the given configuration.
    pub async fn open_in_memory_with(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let db = Database::open_in_memory_with(config)?;
        db.prepare().await?;
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn profiles(&self) -> ProfileStore {
        ProfileStore::new(self.db.clone())
    }

    pub fn counters(&self) -> CounterStore {
        CounterStore::new(self.db.clone())
    }

    pub fn identities(&self) -> IdentityIndex {
        IdentityIndex::new(self.db.clone())
    }

    pub fn roles(&self) -> RoleStore {
        RoleStore::new(self.db.clone())
    }

    pub fn cooldowns(&self) -> CooldownStore {
        CooldownStore::new(self.db.clone())
    }

    pub fn channels(&self) -> ChannelStore {
        ChannelStore::new(self.db.clone())
    }

    pub fn batch_writer(&self) -> BatchWriter {
        BatchWriter::new(self.db.clone())
    }

    /// A batch buffer sized by the configured flush threshold and backlog limit.
    pub fn batch_buffer(&self) -> BatchBuffer {
        let config = self.db.config();
        BatchBuffer::new(self.batch_writer(), config.batch_flush_threshold)
            .with_max_pending(config.batch_max_pending)
    }

    /// A batch buffer flushed periodically at the configured interval.
    ///
    /// The flusher runs until the returned handle is aborted.
    pub fn spawn_batch_flusher(&self) -> (BatchBuffer, JoinHandle<()>) {
        let buffer = self.batch_buffer();
        let interval = Duration::from_millis(self.db.config().batch_flush_interval_ms.max(1));
        let handle = buffer.spawn_periodic_flush(interval);
        (buffer, handle)
    }

    /// Row counts of every table family on every platform.
    pub async fn table_counts(&self) -> StoreResult<Vec<TableCount>> {
        self.db
            .execute(|conn| {
                let mut counts = Vec::new();
                for platform in Platform::ALL {
                    for entity in Entity::ALL {
                        let table = entity.table(platform);
                        let rows: i64 =
                            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                                row.get(0)
                            })?;
                        counts.push(TableCount {
                            platform,
                            table,
                            rows,
                        });
                    }
                }
                Ok(counts)
            })
            .await
    }
}
