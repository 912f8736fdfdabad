//! Per-channel command cooldowns.

use chrono::Utc;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};

/// Last-use timestamps keyed by (platform, channel id, command name).
#[derive(Clone)]
pub struct CooldownStore {
    db: Database,
}

impl CooldownStore {
    /// Create a cooldown store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Check whether `command` is cooling down in `channel_id` and, if it is
    /// not, record the current wall-clock time as its last use.
    ///
    /// Returns `true` when the command is still cooling down.
    pub async fn check_and_touch(
        &self,
        platform: Platform,
        channel_id: i64,
        command: &str,
        cooldown_secs: i64,
    ) -> StoreResult<bool> {
        self.check_and_touch_at(
            platform,
            channel_id,
            command,
            cooldown_secs,
            Utc::now().timestamp(),
        )
        .await
    }

    /// [`check_and_touch`](Self::check_and_touch) with an explicit clock.
    ///
    /// The read and the conditional write run in one closure on the shared
    /// connection, so concurrent callers on the same key are serialized.
    #[instrument(skip(self))]
    pub async fn check_and_touch_at(
        &self,
        platform: Platform,
        channel_id: i64,
        command: &str,
        cooldown_secs: i64,
        now: i64,
    ) -> StoreResult<bool> {
        if command.is_empty() {
            return Err(StoreError::InvalidArgument(
                "command name must not be empty".into(),
            ));
        }
        if cooldown_secs < 0 {
            return Err(StoreError::InvalidArgument(format!(
                "cooldown must not be negative, got {cooldown_secs}"
            )));
        }

        let table = Entity::Cooldowns.table(platform);
        let command = command.to_string();
        self.db
            .execute(move |conn| {
                let last: Option<i64> = match conn.query_row(
                    &format!(
                        "SELECT last_used FROM {table} WHERE channel_id = ?1 AND command = ?2"
                    ),
                    rusqlite::params![channel_id, command],
                    |row| row.get(0),
                ) {
                    Ok(ts) => Some(ts),
                    Err(rusqlite::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(StoreError::Sqlite(e)),
                };

                // Saturates so huge cooldowns or far-future legacy stamps stay in effect.
                if let Some(last) = last
                    && now < last.saturating_add(cooldown_secs)
                {
                    let remaining = last.saturating_add(cooldown_secs).saturating_sub(now);
                    debug!(%platform, channel_id, %command, remaining, "cooling down");
                    return Ok(true);
                }

                conn.execute(
                    &format!(
                        "INSERT INTO {table} (channel_id, command, last_used) VALUES (?1, ?2, ?3) \
                         ON CONFLICT(channel_id, command) DO UPDATE SET last_used = excluded.last_used"
                    ),
                    rusqlite::params![channel_id, command, now],
                )?;
                Ok(false)
            })
            .await
    }

    /// Last recorded use of `command` in `channel_id`.
    #[instrument(skip(self))]
    pub async fn last_use(
        &self,
        platform: Platform,
        channel_id: i64,
        command: &str,
    ) -> StoreResult<Option<i64>> {
        let table = Entity::Cooldowns.table(platform);
        let command = command.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT last_used FROM {table} WHERE channel_id = ?1 AND command = ?2"
                    ),
                    rusqlite::params![channel_id, command],
                    |row| row.get(0),
                );
                match result {
                    Ok(ts) => Ok(Some(ts)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Forget the last use of `command` in `channel_id`.
    #[instrument(skip(self))]
    pub async fn reset(
        &self,
        platform: Platform,
        channel_id: i64,
        command: &str,
    ) -> StoreResult<bool> {
        let table = Entity::Cooldowns.table(platform);
        let command = command.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    &format!("DELETE FROM {table} WHERE channel_id = ?1 AND command = ?2"),
                    rusqlite::params![channel_id, command],
                )?;
                Ok(deleted > 0)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
