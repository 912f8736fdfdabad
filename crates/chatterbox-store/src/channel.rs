//! Per-channel configuration: command prefix and banned words.

use std::borrow::Cow;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};

/// Compiled multi-pattern matcher over one channel's ban list.
///
/// Patterns are stored lower-cased; the automaton matches ASCII letters in
/// any case and non-ASCII messages are lower-cased before scanning.
#[derive(Debug, Clone)]
pub struct BanWordMatcher {
    automaton: Option<AhoCorasick>,
    words: Vec<String>,
}

impl BanWordMatcher {
    /// Build a matcher over already normalized `words`.
    pub fn new(words: Vec<String>) -> StoreResult<Self> {
        if words.is_empty() {
            return Ok(Self {
                automaton: None,
                words,
            });
        }
        let automaton = match AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&words)
        {
            Ok(ac) => ac,
            Err(e) => {
                tracing::error!(error = %e, "failed to build ban word automaton");
                return Err(e.into());
            }
        };
        Ok(Self {
            automaton: Some(automaton),
            words,
        })
    }

    /// The banned word that ends first in `text`, if any.
    pub fn find(&self, text: &str) -> Option<&str> {
        let automaton = self.automaton.as_ref()?;
        let haystack = if text.is_ascii() {
            Cow::Borrowed(text)
        } else {
            Cow::Owned(text.to_lowercase())
        };
        automaton
            .find(&*haystack)
            .map(|m| self.words[m.pattern().as_usize()].as_str())
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

/// Channel settings keyed by (platform, channel id).
///
/// Prefixes are read on every message and are cached; only channels with an
/// explicit prefix get an entry, the configured default is never cached.
/// Ban lists are cached as compiled matchers and dropped on every change.
#[derive(Clone)]
pub struct ChannelStore {
    db: Database,
}

impl ChannelStore {
    /// Create a channel store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The command prefix of `channel_id`, or the configured default.
    #[instrument(skip(self))]
    pub async fn get_prefix(&self, platform: Platform, channel_id: i64) -> StoreResult<String> {
        let key = (platform, channel_id);
        let caches = self.db.caches().clone();
        if let Some(prefix) = caches.prefixes.get(&key) {
            return Ok(prefix);
        }

        let default = self.db.config().default_prefix.clone();
        let table = Entity::Channels.table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT prefix FROM {table} WHERE channel_id = ?1"),
                    [channel_id],
                    |row| row.get::<_, Option<String>>(0),
                );
                match result {
                    Ok(Some(prefix)) => {
                        caches.prefixes.insert(key, prefix.clone());
                        Ok(prefix)
                    }
                    Ok(None) | Err(rusqlite::Error::QueryReturnedNoRows) => Ok(default),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Set an explicit command prefix for `channel_id`.
    #[instrument(skip(self))]
    pub async fn set_prefix(
        &self,
        platform: Platform,
        channel_id: i64,
        prefix: &str,
    ) -> StoreResult<()> {
        let prefix = prefix.trim().to_string();
        if prefix.is_empty() || prefix.chars().count() > 16 {
            return Err(StoreError::InvalidArgument(format!(
                "prefix must be 1-16 characters, got {:?}",
                prefix
            )));
        }

        let table = Entity::Channels.table(platform);
        let caches = self.db.caches().clone();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (channel_id, prefix, updated_at) VALUES (?1, ?2, ?3) \
                         ON CONFLICT(channel_id) DO UPDATE SET \
                             prefix = excluded.prefix, updated_at = excluded.updated_at"
                    ),
                    rusqlite::params![channel_id, prefix, now],
                )?;
                caches.prefixes.insert((platform, channel_id), prefix);
                Ok(())
            })
            .await
    }

    /// Drop the explicit prefix so the default applies again.
    #[instrument(skip(self))]
    pub async fn reset_prefix(&self, platform: Platform, channel_id: i64) -> StoreResult<()> {
        let table = Entity::Channels.table(platform);
        let caches = self.db.caches().clone();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    &format!(
                        "UPDATE {table} SET prefix = NULL, updated_at = ?2 WHERE channel_id = ?1"
                    ),
                    rusqlite::params![channel_id, now],
                )?;
                caches.prefixes.invalidate(&(platform, channel_id));
                Ok(())
            })
            .await
    }

    /// Add `word` to the channel's ban list. Returns `false` when it was
    /// already present in any letter case.
    #[instrument(skip(self))]
    pub async fn add_ban_word(
        &self,
        platform: Platform,
        channel_id: i64,
        word: &str,
    ) -> StoreResult<bool> {
        let word = normalize_word(word)?;
        let table = Entity::BanWords.table(platform);
        let caches = self.db.caches().clone();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let inserted = conn.execute(
                    &format!(
                        "INSERT INTO {table} (channel_id, word, added_at) VALUES (?1, ?2, ?3) \
                         ON CONFLICT(channel_id, word) DO NOTHING"
                    ),
                    rusqlite::params![channel_id, word, now],
                )?;
                if inserted == 1 {
                    caches.ban_words.invalidate(&(platform, channel_id));
                }
                debug!(%platform, channel_id, %word, added = inserted == 1, "ban word add");
                Ok(inserted == 1)
            })
            .await
    }

    /// Remove `word` from the channel's ban list.
    #[instrument(skip(self))]
    pub async fn remove_ban_word(
        &self,
        platform: Platform,
        channel_id: i64,
        word: &str,
    ) -> StoreResult<bool> {
        let word = normalize_word(word)?;
        let table = Entity::BanWords.table(platform);
        let caches = self.db.caches().clone();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    &format!("DELETE FROM {table} WHERE channel_id = ?1 AND word = ?2"),
                    rusqlite::params![channel_id, word],
                )?;
                if deleted > 0 {
                    caches.ban_words.invalidate(&(platform, channel_id));
                }
                Ok(deleted > 0)
            })
            .await
    }

    /// Whether `word` is banned in `channel_id`, ignoring case.
    #[instrument(skip(self))]
    pub async fn is_ban_word(
        &self,
        platform: Platform,
        channel_id: i64,
        word: &str,
    ) -> StoreResult<bool> {
        let word = normalize_word(word)?;
        let table = Entity::BanWords.table(platform);
        self.db
            .execute(move |conn| {
                let found: bool = conn.query_row(
                    &format!(
                        "SELECT EXISTS(SELECT 1 FROM {table} WHERE channel_id = ?1 AND word = ?2)"
                    ),
                    rusqlite::params![channel_id, word],
                    |row| row.get(0),
                )?;
                Ok(found)
            })
            .await
    }

    /// Every banned word of `channel_id`, alphabetically.
    #[instrument(skip(self))]
    pub async fn ban_words(&self, platform: Platform, channel_id: i64) -> StoreResult<Vec<String>> {
        let table = Entity::BanWords.table(platform);
        self.db
            .execute(move |conn| load_ban_words(conn, &table, channel_id))
            .await
    }

    /// The compiled matcher of `channel_id`, built from the table on a miss.
    #[instrument(skip(self))]
    pub async fn ban_word_matcher(
        &self,
        platform: Platform,
        channel_id: i64,
    ) -> StoreResult<Arc<BanWordMatcher>> {
        let key = (platform, channel_id);
        let caches = self.db.caches().clone();
        if let Some(matcher) = caches.ban_words.get(&key) {
            return Ok(matcher);
        }

        let table = Entity::BanWords.table(platform);
        self.db
            .execute(move |conn| {
                let words = load_ban_words(conn, &table, channel_id)?;
                debug!(%platform, channel_id, patterns = words.len(), "ban word matcher built");
                let matcher = Arc::new(BanWordMatcher::new(words)?);
                caches.ban_words.insert(key, Arc::clone(&matcher));
                Ok(matcher)
            })
            .await
    }

    /// First banned word occurring anywhere in `text`, ignoring case.
    #[instrument(skip(self, text))]
    pub async fn contains_ban_word(
        &self,
        platform: Platform,
        channel_id: i64,
        text: &str,
    ) -> StoreResult<Option<String>> {
        let matcher = self.ban_word_matcher(platform, channel_id).await?;
        Ok(matcher.find(text).map(str::to_string))
    }
}

fn load_ban_words(conn: &Connection, table: &str, channel_id: i64) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT word FROM {table} WHERE channel_id = ?1 ORDER BY word"
    ))?;
    let words = stmt
        .query_map([channel_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(words)
}

/// Lower-case and trim a ban word, rejecting blanks.
pub(crate) fn normalize_word(word: &str) -> StoreResult<String> {
    let word = word.trim().to_lowercase();
    if word.is_empty() {
        return Err(StoreError::InvalidArgument("ban word must not be blank".into()));
    }
    Ok(word)
}

// ── tests ────────────────────────────────────────────────────────────
