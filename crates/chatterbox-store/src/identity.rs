//! Username ↔ user id index.
//!
//! At most one mapping per user id and per username is active at a time.
//! Superseded mappings are archived (`active = 0`) rather than deleted, which
//! is what [`IdentityIndex::all_usernames`] reads back as history.
//!
//! Only the username → id direction is cached; id → username lookups are
//! rare and always go to the table.

use chrono::Utc;
use rusqlite::TransactionBehavior;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};

/// Bidirectional username mapping with a username → id cache.
#[derive(Clone)]
pub struct IdentityIndex {
    db: Database,
}

impl IdentityIndex {
    /// Create an identity index backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Make `username` the active name of `user_id`.
    ///
    /// Surrounding whitespace is trimmed, as it is on lookup in
    /// [`resolve_id`](Self::resolve_id). Returns `false` for a blank
    /// username. Any prior active name of the
    /// user, and any other user currently holding `username`, is archived
    /// in the same transaction.
    #[instrument(skip(self))]
    pub async fn map_username(
        &self,
        platform: Platform,
        user_id: i64,
        username: &str,
    ) -> StoreResult<bool> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Ok(false);
        }

        let table = Entity::Usernames.table(platform);
        let caches = self.db.caches().clone();
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                // Names being archived, so their cache entries can be dropped.
                let displaced: Vec<String> = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT username FROM {table} \
                         WHERE active = 1 AND (user_id = ?1 OR username = ?2)"
                    ))?;
                    stmt.query_map(rusqlite::params![user_id, username], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };

                let current: Option<i64> = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT user_id FROM {table} WHERE active = 1 AND username = ?1"
                    ))?;
                    let mut rows = stmt.query([&username])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                if current == Some(user_id) && displaced.len() == 1 {
                    tx.commit()?;
                    caches.usernames.insert((platform, username), user_id);
                    return Ok(true);
                }

                tx.execute(
                    &format!(
                        "UPDATE {table} SET active = 0 \
                         WHERE active = 1 AND (user_id = ?1 OR username = ?2)"
                    ),
                    rusqlite::params![user_id, username],
                )?;
                tx.execute(
                    &format!(
                        "INSERT INTO {table} (user_id, username, active, assigned_at) \
                         VALUES (?1, ?2, 1, ?3)"
                    ),
                    rusqlite::params![user_id, username, now],
                )?;
                tx.commit()?;

                for name in &displaced {
                    caches.usernames.invalidate(&(platform, name.clone()));
                }
                caches.usernames.insert((platform, username.clone()), user_id);
                debug!(
                    %platform,
                    user_id,
                    %username,
                    archived = displaced.len(),
                    "username mapped"
                );
                Ok(true)
            })
            .await
    }

    /// Resolve the user currently holding `username`.
    ///
    /// Matching is exact and case-sensitive after trimming surrounding
    /// whitespace; a blank name resolves to nobody.
    #[instrument(skip(self))]
    pub async fn resolve_id(
        &self,
        platform: Platform,
        username: &str,
    ) -> StoreResult<Option<i64>> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(None);
        }
        let key = (platform, username.to_string());
        let caches = self.db.caches().clone();
        if let Some(id) = caches.usernames.get(&key) {
            return Ok(Some(id));
        }

        let table = Entity::Usernames.table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT user_id FROM {table} WHERE active = 1 AND username = ?1"),
                    [&key.1],
                    |row| row.get::<_, i64>(0),
                );
                match result {
                    Ok(id) => {
                        caches.usernames.insert(key, id);
                        Ok(Some(id))
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// The active username of `user_id`. Never cached.
    #[instrument(skip(self))]
    pub async fn resolve_username(
        &self,
        platform: Platform,
        user_id: i64,
    ) -> StoreResult<Option<String>> {
        let table = Entity::Usernames.table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT username FROM {table} WHERE active = 1 AND user_id = ?1"),
                    [user_id],
                    |row| row.get(0),
                );
                match result {
                    Ok(name) => Ok(Some(name)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Every username `user_id` has held, oldest first, current name last.
    #[instrument(skip(self))]
    pub async fn all_usernames(
        &self,
        platform: Platform,
        user_id: i64,
    ) -> StoreResult<Vec<String>> {
        let table = Entity::Usernames.table(platform);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT username FROM {table} WHERE user_id = ?1 \
                     ORDER BY active ASC, assigned_at ASC, id ASC"
                ))?;
                let names = stmt
                    .query_map([user_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> IdentityIndex {
        let db = Database::open_in_memory().unwrap();
        db.prepare().await.unwrap();
        IdentityIndex::new(db)
    }

    #[tokio::test]
    async fn blank_username_is_rejected() {
        let index = setup().await;
        assert!(!index.map_username(Platform::Twitch, 1, "").await.unwrap());
        assert!(!index.map_username(Platform::Twitch, 1, "   ").await.unwrap());
        assert_eq!(index.resolve_username(Platform::Twitch, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn padded_names_resolve_like_trimmed_ones() {
        let index = setup().await;
        assert!(index.map_username(Platform::Twitch, 7, " alice ").await.unwrap());
        assert_eq!(index.resolve_id(Platform::Twitch, " alice").await.unwrap(), Some(7));
        assert_eq!(index.resolve_id(Platform::Twitch, "alice").await.unwrap(), Some(7));
        assert_eq!(index.resolve_id(Platform::Twitch, "  ").await.unwrap(), None);
        assert_eq!(
            index.resolve_username(Platform::Twitch, 7).await.unwrap().as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn remap_replaces_previous_name() {
        let index = setup().await;
        assert!(index.map_username(Platform::Twitch, 42, "alice").await.unwrap());
        assert_eq!(index.resolve_id(Platform::Twitch, "alice").await.unwrap(), Some(42));

        assert!(index.map_username(Platform::Twitch, 42, "bob").await.unwrap());
        assert_eq!(index.resolve_id(Platform::Twitch, "alice").await.unwrap(), None);
        assert_eq!(index.resolve_id(Platform::Twitch, "bob").await.unwrap(), Some(42));
        assert_eq!(
            index.resolve_username(Platform::Twitch, 42).await.unwrap().as_deref(),
            Some("bob")
        );
    }

    #[tokio::test]
    async fn history_is_archived() {
        let index = setup().await;
        index.map_username(Platform::Discord, 7, "first").await.unwrap();
        index.map_username(Platform::Discord, 7, "second").await.unwrap();
        index.map_username(Platform::Discord, 7, "third").await.unwrap();
        assert_eq!(
            index.all_usernames(Platform::Discord, 7).await.unwrap(),
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn remapping_same_name_does_not_grow_history() {
        let index = setup().await;
        index.map_username(Platform::Twitch, 1, "same").await.unwrap();
        index.map_username(Platform::Twitch, 1, "same").await.unwrap();
        assert_eq!(index.all_usernames(Platform::Twitch, 1).await.unwrap(), vec!["same"]);
    }

    #[tokio::test]
    async fn name_taken_over_by_another_user() {
        let index = setup().await;
        index.map_username(Platform::Twitch, 1, "shared").await.unwrap();
        assert_eq!(index.resolve_id(Platform::Twitch, "shared").await.unwrap(), Some(1));

        index.map_username(Platform::Twitch, 2, "shared").await.unwrap();
        assert_eq!(index.resolve_id(Platform::Twitch, "shared").await.unwrap(), Some(2));
        assert_eq!(index.resolve_username(Platform::Twitch, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lookup_is_case_sensitive() {
        let index = setup().await;
        index.map_username(Platform::Twitch, 1, "Alice").await.unwrap();
        assert_eq!(index.resolve_id(Platform::Twitch, "alice").await.unwrap(), None);
        assert_eq!(index.resolve_id(Platform::Twitch, "Alice").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn lookup_populates_cache() {
        let index = setup().await;
        index.map_username(Platform::Twitch, 1, "carol").await.unwrap();
        index.db.caches().usernames.invalidate_all();

        assert_eq!(index.resolve_id(Platform::Twitch, "carol").await.unwrap(), Some(1));
        let hits_before = index.db.caches().usernames.stats().hits();
        assert_eq!(index.resolve_id(Platform::Twitch, "carol").await.unwrap(), Some(1));
        assert_eq!(index.db.caches().usernames.stats().hits(), hits_before + 1);
    }

    #[tokio::test]
    async fn platforms_are_isolated() {
        let index = setup().await;
        index.map_username(Platform::Twitch, 1, "dave").await.unwrap();
        assert_eq!(index.resolve_id(Platform::Discord, "dave").await.unwrap(), None);
    }
}
