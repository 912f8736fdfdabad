//! Global and per-channel message counters.
//!
//! Both counters are updated with a single arithmetic statement so that
//! concurrent writers can never lose an increment. Negative deltas are
//! accepted for corrections.

use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};

/// Message counters stored on the profile row and in `channel_counts_<p>`.
#[derive(Clone)]
pub struct CounterStore {
    db: Database,
}

impl CounterStore {
    /// Create a counter store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add `count_delta` messages and `length_delta` characters to the
    /// profile's global totals and return the new message count.
    ///
    /// Returns `None` without writing when the profile does not exist.
    #[instrument(skip(self))]
    pub async fn increment_global(
        &self,
        platform: Platform,
        user_id: i64,
        length_delta: i64,
        count_delta: i64,
    ) -> StoreResult<Option<i64>> {
        let table = Entity::Users.table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "UPDATE {table} \
                         SET message_count = message_count + ?2, \
                             total_message_length = total_message_length + ?3 \
                         WHERE user_id = ?1 \
                         RETURNING message_count"
                    ),
                    rusqlite::params![user_id, count_delta, length_delta],
                    |row| row.get(0),
                );
                match result {
                    Ok(count) => Ok(Some(count)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        debug!(%platform, user_id, "global increment skipped, no profile");
                        Ok(None)
                    }
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Add `delta` to the user's count in `channel_id` and return the new count.
    ///
    /// The row is created on first use.
    #[instrument(skip(self))]
    pub async fn increment_channel(
        &self,
        platform: Platform,
        user_id: i64,
        channel_id: i64,
        delta: i64,
    ) -> StoreResult<i64> {
        let table = Entity::ChannelCounts.table(platform);
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    &format!(
                        "INSERT INTO {table} (user_id, channel_id, count) VALUES (?1, ?2, ?3) \
                         ON CONFLICT(user_id, channel_id) DO UPDATE SET count = count + excluded.count \
                         RETURNING count"
                    ),
                    rusqlite::params![user_id, channel_id, delta],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Current count for the user in `channel_id`, `None` when never counted.
    #[instrument(skip(self))]
    pub async fn get_channel_count(
        &self,
        platform: Platform,
        user_id: i64,
        channel_id: i64,
    ) -> StoreResult<Option<i64>> {
        let table = Entity::ChannelCounts.table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT count FROM {table} WHERE user_id = ?1 AND channel_id = ?2"),
                    rusqlite::params![user_id, channel_id],
                    |row| row.get(0),
                );
                match result {
                    Ok(count) => Ok(Some(count)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Overwrite the user's count in `channel_id` with an absolute value.
    #[instrument(skip(self))]
    pub async fn set_channel_count(
        &self,
        platform: Platform,
        user_id: i64,
        channel_id: i64,
        count: i64,
    ) -> StoreResult<()> {
        let table = Entity::ChannelCounts.table(platform);
        self.db
            .execute(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (user_id, channel_id, count) VALUES (?1, ?2, ?3) \
                         ON CONFLICT(user_id, channel_id) DO UPDATE SET count = excluded.count"
                    ),
                    rusqlite::params![user_id, channel_id, count],
                )?;
                Ok(())
            })
            .await
    }

    /// Every channel the user has a count in, ordered by channel id.
    #[instrument(skip(self))]
    pub async fn channel_counts(
        &self,
        platform: Platform,
        user_id: i64,
    ) -> StoreResult<Vec<(i64, i64)>> {
        let table = Entity::ChannelCounts.table(platform);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT channel_id, count FROM {table} WHERE user_id = ?1 ORDER BY channel_id"
                ))?;
                let rows = stmt
                    .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
