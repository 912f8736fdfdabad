//! Role / ACL records: bans, moderators, developers and ignored users.
//!
//! The four kinds are structurally identical. A user holds at most one
//! record per kind and platform; repeated additions update the record in
//! place and keep its surrogate id.
//!
//! The role cache is **positive-only**: it remembers that a user holds a
//! role, never that they do not. Most users hold no role at all, so a
//! negative check always consults the table. Removals invalidate the entry
//! while still holding the connection lock.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};

/// One independent ACL facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Ban,
    Moderator,
    Developer,
    Ignore,
}

impl RoleKind {
    pub const ALL: [RoleKind; 4] = [
        RoleKind::Ban,
        RoleKind::Moderator,
        RoleKind::Developer,
        RoleKind::Ignore,
    ];

    /// Table family holding records of this kind.
    pub fn entity(self) -> Entity {
        match self {
            Self::Ban => Entity::Bans,
            Self::Moderator => Entity::Moderators,
            Self::Developer => Entity::Developers,
            Self::Ignore => Entity::Ignored,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Moderator => "moderator",
            Self::Developer => "developer",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ban" | "bans" | "banned" => Ok(Self::Ban),
            "moderator" | "moderators" | "mod" | "mods" => Ok(Self::Moderator),
            "developer" | "developers" | "dev" | "devs" => Ok(Self::Developer),
            "ignore" | "ignored" => Ok(Self::Ignore),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown role kind: {other}"
            ))),
        }
    }
}

/// A stored role record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRecord {
    /// Surrogate id, stable across repeated additions.
    pub id: i64,
    pub user_id: i64,
    /// Unix timestamp of the latest addition.
    pub issued_at: i64,
    pub issuer_id: Option<i64>,
    pub reason: Option<String>,
}

/// Upsert, removal and lookup of role records.
#[derive(Clone)]
pub struct RoleStore {
    db: Database,
}

impl RoleStore {
    /// Create a role store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Grant `kind` to `user_id` and return the record id.
    ///
    /// A single upsert statement keyed by user id: a repeated addition
    /// refreshes the metadata and keeps the existing id.
    #[instrument(skip(self, reason))]
    pub async fn add(
        &self,
        kind: RoleKind,
        platform: Platform,
        user_id: i64,
        issued_at: i64,
        issuer_id: Option<i64>,
        reason: Option<&str>,
    ) -> StoreResult<i64> {
        let table = kind.entity().table(platform);
        let reason = reason.map(str::to_string);
        let caches = self.db.caches().clone();

        self.db
            .execute(move |conn| {
                let id: i64 = conn.query_row(
                    &format!(
                        "INSERT INTO {table} (user_id, issued_at, issuer_id, reason) \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT(user_id) DO UPDATE SET \
                             issued_at = excluded.issued_at, \
                             issuer_id = excluded.issuer_id, \
                             reason = excluded.reason \
                         RETURNING id"
                    ),
                    rusqlite::params![user_id, issued_at, issuer_id, reason],
                    |row| row.get(0),
                )?;
                caches.roles.insert((kind, platform, user_id), id);
                debug!(%kind, %platform, user_id, id, "role granted");
                Ok(id)
            })
            .await
    }

    /// Delete the record with surrogate id `record_id`.
    ///
    /// The natural key is recovered from the deleted row so the cache entry
    /// can be invalidated. Returns `false` when no such record exists.
    #[instrument(skip(self))]
    pub async fn remove(
        &self,
        kind: RoleKind,
        platform: Platform,
        record_id: i64,
    ) -> StoreResult<bool> {
        let table = kind.entity().table(platform);
        let caches = self.db.caches().clone();

        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("DELETE FROM {table} WHERE id = ?1 RETURNING user_id"),
                    [record_id],
                    |row| row.get::<_, i64>(0),
                );
                match result {
                    Ok(user_id) => {
                        caches.roles.invalidate(&(kind, platform, user_id));
                        debug!(%kind, %platform, user_id, record_id, "role removed");
                        Ok(true)
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Delete the record held by `user_id`, if any.
    #[instrument(skip(self))]
    pub async fn remove_by_user(
        &self,
        kind: RoleKind,
        platform: Platform,
        user_id: i64,
    ) -> StoreResult<bool> {
        let table = kind.entity().table(platform);
        let caches = self.db.caches().clone();

        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    &format!("DELETE FROM {table} WHERE user_id = ?1"),
                    [user_id],
                )?;
                caches.roles.invalidate(&(kind, platform, user_id));
                Ok(deleted > 0)
            })
            .await
    }

    /// Whether `user_id` currently holds `kind`.
    #[instrument(skip(self))]
    pub async fn is_holder(
        &self,
        kind: RoleKind,
        platform: Platform,
        user_id: i64,
    ) -> StoreResult<bool> {
        let key = (kind, platform, user_id);
        let caches = self.db.caches().clone();
        if caches.roles.get(&key).is_some() {
            return Ok(true);
        }

        let table = kind.entity().table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT id FROM {table} WHERE user_id = ?1"),
                    [user_id],
                    |row| row.get::<_, i64>(0),
                );
                match result {
                    Ok(id) => {
                        caches.roles.insert(key, id);
                        Ok(true)
                    }
                    // Negatives are deliberately not cached.
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// The full record held by `user_id`, if any.
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        kind: RoleKind,
        platform: Platform,
        user_id: i64,
    ) -> StoreResult<Option<RoleRecord>> {
        let table = kind.entity().table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT id, user_id, issued_at, issuer_id, reason FROM {table} WHERE user_id = ?1"
                    ),
                    [user_id],
                    row_to_record,
                );
                match result {
                    Ok(record) => Ok(Some(record)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Every record of `kind` on `platform`, by id.
    #[instrument(skip(self))]
    pub async fn list(&self, kind: RoleKind, platform: Platform) -> StoreResult<Vec<RoleRecord>> {
        let table = kind.entity().table(platform);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, user_id, issued_at, issuer_id, reason FROM {table} ORDER BY id"
                ))?;
                let records = stmt
                    .query_map([], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }

    // ── per-kind shorthands ──────────────────────────────────────────

    pub async fn add_ban(
        &self,
        platform: Platform,
        user_id: i64,
        issued_at: i64,
        issuer_id: i64,
        reason: Option<&str>,
    ) -> StoreResult<i64> {
        self.add(RoleKind::Ban, platform, user_id, issued_at, Some(issuer_id), reason)
            .await
    }

    pub async fn remove_ban(&self, platform: Platform, record_id: i64) -> StoreResult<bool> {
        self.remove(RoleKind::Ban, platform, record_id).await
    }

    pub async fn is_banned(&self, platform: Platform, user_id: i64) -> StoreResult<bool> {
        self.is_holder(RoleKind::Ban, platform, user_id).await
    }

    pub async fn add_moderator(
        &self,
        platform: Platform,
        user_id: i64,
        issued_at: i64,
        issuer_id: i64,
    ) -> StoreResult<i64> {
        self.add(RoleKind::Moderator, platform, user_id, issued_at, Some(issuer_id), None)
            .await
    }

    pub async fn remove_moderator(&self, platform: Platform, record_id: i64) -> StoreResult<bool> {
        self.remove(RoleKind::Moderator, platform, record_id).await
    }

    pub async fn is_moderator(&self, platform: Platform, user_id: i64) -> StoreResult<bool> {
        self.is_holder(RoleKind::Moderator, platform, user_id).await
    }

    pub async fn add_developer(
        &self,
        platform: Platform,
        user_id: i64,
        issued_at: i64,
        issuer_id: i64,
    ) -> StoreResult<i64> {
        self.add(RoleKind::Developer, platform, user_id, issued_at, Some(issuer_id), None)
            .await
    }

    pub async fn remove_developer(&self, platform: Platform, record_id: i64) -> StoreResult<bool> {
        self.remove(RoleKind::Developer, platform, record_id).await
    }

    pub async fn is_developer(&self, platform: Platform, user_id: i64) -> StoreResult<bool> {
        self.is_holder(RoleKind::Developer, platform, user_id).await
    }

    pub async fn add_ignore(
        &self,
        platform: Platform,
        user_id: i64,
        issued_at: i64,
        issuer_id: i64,
        reason: Option<&str>,
    ) -> StoreResult<i64> {
        self.add(RoleKind::Ignore, platform, user_id, issued_at, Some(issuer_id), reason)
            .await
    }

    pub async fn remove_ignore(&self, platform: Platform, record_id: i64) -> StoreResult<bool> {
        self.remove(RoleKind::Ignore, platform, record_id).await
    }

    pub async fn is_ignored(&self, platform: Platform, user_id: i64) -> StoreResult<bool> {
        self.is_holder(RoleKind::Ignore, platform, user_id).await
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoleRecord> {
    Ok(RoleRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        issued_at: row.get(2)?,
        issuer_id: row.get(3)?,
        reason: row.get(4)?,
    })
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> RoleStore {
        let db = Database::open_in_memory().unwrap();
        db.prepare().await.unwrap();
        RoleStore::new(db)
    }

    #[tokio::test]
    async fn ban_lifecycle() {
        let store = setup().await;
        let id = store
            .add_ban(Platform::Twitch, 10, 1_000, 1, Some("spam"))
            .await
            .unwrap();
        assert!(store.is_banned(Platform::Twitch, 10).await.unwrap());

        assert!(store.remove_ban(Platform::Twitch, id).await.unwrap());
        assert!(!store.is_banned(Platform::Twitch, 10).await.unwrap());
        assert!(!store.remove_ban(Platform::Twitch, id).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_add_keeps_surrogate_id() {
        let store = setup().await;
        let first = store
            .add_ban(Platform::Discord, 10, 1_000, 1, Some("spam"))
            .await
            .unwrap();
        let second = store
            .add_ban(Platform::Discord, 10, 2_000, 2, Some("again"))
            .await
            .unwrap();
        assert_eq!(first, second);

        let record = store.get(RoleKind::Ban, Platform::Discord, 10).await.unwrap().unwrap();
        assert_eq!(record.issued_at, 2_000);
        assert_eq!(record.issuer_id, Some(2));
        assert_eq!(record.reason.as_deref(), Some("again"));
        assert_eq!(store.list(RoleKind::Ban, Platform::Discord).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_adds_produce_one_row() {
        let store = setup().await;
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add_moderator(Platform::Twitch, 77, i, 1).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list(RoleKind::Moderator, Platform::Twitch).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let store = setup().await;
        store.add_developer(Platform::Twitch, 5, 1, 1).await.unwrap();
        assert!(store.is_developer(Platform::Twitch, 5).await.unwrap());
        assert!(!store.is_moderator(Platform::Twitch, 5).await.unwrap());
        assert!(!store.is_banned(Platform::Twitch, 5).await.unwrap());
        assert!(!store.is_ignored(Platform::Twitch, 5).await.unwrap());
    }

    #[tokio::test]
    async fn negative_results_are_not_cached() {
        let store = setup().await;
        assert!(!store.is_ignored(Platform::Telegram, 3).await.unwrap());
        assert!(store.db.caches().roles.get(&(RoleKind::Ignore, Platform::Telegram, 3)).is_none());

        // A write to the table is seen by the next check.
        store.add_ignore(Platform::Telegram, 3, 1, 1, None).await.unwrap();
        assert!(store.is_ignored(Platform::Telegram, 3).await.unwrap());
    }

    #[tokio::test]
    async fn remove_by_user_invalidates_cache() {
        let store = setup().await;
        store.add_moderator(Platform::YouTube, 8, 1, 1).await.unwrap();
        assert!(store.is_moderator(Platform::YouTube, 8).await.unwrap());
        assert!(store.remove_by_user(RoleKind::Moderator, Platform::YouTube, 8).await.unwrap());
        assert!(!store.is_moderator(Platform::YouTube, 8).await.unwrap());
    }

    #[tokio::test]
    async fn remove_after_cold_cache_still_invalidates() {
        let store = setup().await;
        let id = store.add_developer(Platform::Discord, 4, 1, 1).await.unwrap();
        store.db.caches().roles.invalidate_all();
        assert!(store.is_developer(Platform::Discord, 4).await.unwrap());
        assert!(store.remove_developer(Platform::Discord, id).await.unwrap());
        assert!(!store.is_developer(Platform::Discord, 4).await.unwrap());
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("mods".parse::<RoleKind>().unwrap(), RoleKind::Moderator);
        assert_eq!("Banned".parse::<RoleKind>().unwrap(), RoleKind::Ban);
        assert!("admin".parse::<RoleKind>().is_err());
    }
}
