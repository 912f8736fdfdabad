//! Legacy layout migration.
//!
//! Older deployments kept per-channel data as JSON blobs inside the
//! per-platform profile and channel tables. Migration detects those columns
//! by introspection, normalizes every blob into rows of the dedicated table
//! families, then drops the blob columns by rebuild-and-rename.
//!
//! The whole migration runs in one transaction across all platforms: any
//! statement failure rolls everything back and is returned to the caller.
//! A blob that does not parse only costs its own row, which is logged and
//! skipped.

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::normalize_word;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};
use crate::schema::{self, MIGRATIONS_TABLE};

/// A JSON-blob column of the legacy layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyBlob {
    /// `users_<p>.channel_message_counts`: `{"<channel id>": count}`.
    ChannelCounts,
    /// `channels_<p>.cooldowns`: `{"<command>": last use}`.
    Cooldowns,
    /// `channels_<p>.ban_words`: `["word", ...]`.
    BanWords,
}

impl LegacyBlob {
    pub const ALL: [LegacyBlob; 3] = [
        LegacyBlob::ChannelCounts,
        LegacyBlob::Cooldowns,
        LegacyBlob::BanWords,
    ];

    /// Table family carrying the blob column.
    pub fn source(self) -> Entity {
        match self {
            Self::ChannelCounts => Entity::Users,
            Self::Cooldowns | Self::BanWords => Entity::Channels,
        }
    }

    /// Table family the blob is normalized into.
    pub fn target(self) -> Entity {
        match self {
            Self::ChannelCounts => Entity::ChannelCounts,
            Self::Cooldowns => Entity::Cooldowns,
            Self::BanWords => Entity::BanWords,
        }
    }

    /// Name of the blob column.
    pub fn column(self) -> &'static str {
        match self {
            Self::ChannelCounts => "channel_message_counts",
            Self::Cooldowns => "cooldowns",
            Self::BanWords => "ban_words",
        }
    }

    fn key_column(self) -> &'static str {
        match self.source() {
            Entity::Users => "user_id",
            _ => "channel_id",
        }
    }
}

/// Outcome of [`migrate_if_needed`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Platforms whose tables were migrated.
    pub platforms: Vec<Platform>,
    /// Legacy rows whose blob was normalized.
    pub rows_migrated: usize,
    /// Legacy rows skipped because their blob was malformed.
    pub rows_skipped: usize,
    /// Normalized rows written.
    pub records_written: usize,
}

impl MigrationReport {
    /// Whether nothing needed migrating.
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Detection
// ═══════════════════════════════════════════════════════════════════════

/// Legacy blob columns still present, per platform.
pub fn detect_legacy(conn: &Connection) -> StoreResult<Vec<(Platform, Vec<LegacyBlob>)>> {
    let mut pending = Vec::new();
    for platform in Platform::ALL {
        let mut blobs = Vec::new();
        for blob in LegacyBlob::ALL {
            let table = blob.source().table(platform);
            if schema::has_column(conn, &table, blob.column())? {
                blobs.push(blob);
            }
        }
        if !blobs.is_empty() {
            pending.push((platform, blobs));
        }
    }
    Ok(pending)
}

// ═══════════════════════════════════════════════════════════════════════
//  Migration
// ═══════════════════════════════════════════════════════════════════════

/// Migrate every platform that still carries legacy blob columns.
///
/// A no-op returning an empty report when the layout is current.
pub fn migrate_if_needed(conn: &mut Connection) -> StoreResult<MigrationReport> {
    let pending = detect_legacy(conn).map_err(|e| StoreError::migration("detect", e))?;
    if pending.is_empty() {
        debug!("no legacy layout detected");
        return Ok(MigrationReport::default());
    }

    info!(
        platforms = pending.len(),
        "legacy layout detected, migrating all platforms in one transaction"
    );

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| StoreError::migration("begin", e))?;

    let mut report = MigrationReport::default();
    let result = (|| -> StoreResult<()> {
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                name        TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at  INTEGER NOT NULL
            );"
        ))?;

        for (platform, blobs) in &pending {
            migrate_platform(&tx, *platform, blobs, &mut report)?;
            report.platforms.push(*platform);
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            tx.commit().map_err(|e| StoreError::migration("commit", e))?;
            info!(
                platforms = report.platforms.len(),
                rows_migrated = report.rows_migrated,
                rows_skipped = report.rows_skipped,
                records_written = report.records_written,
                "legacy migration applied"
            );
            Ok(report)
        }
        Err(err) => {
            warn!(%err, "legacy migration failed, rolling back");
            drop(tx);
            Err(match err {
                e @ StoreError::Migration { .. } => e,
                other => StoreError::migration("legacy_blobs", other),
            })
        }
    }
}

fn migrate_platform(
    conn: &Connection,
    platform: Platform,
    blobs: &[LegacyBlob],
    report: &mut MigrationReport,
) -> StoreResult<()> {
    for blob in blobs {
        let target = blob.target();
        conn.execute_batch(&schema::create_table_sql(target, &target.table(platform), true))?;
        for index in schema::create_index_sql(target, platform) {
            conn.execute_batch(&index)?;
        }
        normalize_blob(conn, platform, *blob, report)?;
    }

    let sources: BTreeSet<&'static str> = blobs.iter().map(|b| b.source().base()).collect();
    for entity in [Entity::Users, Entity::Channels] {
        if sources.contains(entity.base()) {
            schema::rebuild_table(conn, entity, platform)?;
        }
    }

    let now = Utc::now().timestamp();
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {MIGRATIONS_TABLE} (name, description, applied_at) \
             VALUES (?1, ?2, ?3)"
        ),
        rusqlite::params![
            format!("legacy_blobs_{platform}"),
            format!(
                "normalized {} and dropped blob columns",
                blobs.iter().map(|b| b.column()).collect::<Vec<_>>().join(", ")
            ),
            now
        ],
    )?;
    info!(%platform, "platform migrated");
    Ok(())
}

/// Normalize one blob column of one platform into its target table.
fn normalize_blob(
    conn: &Connection,
    platform: Platform,
    blob: LegacyBlob,
    report: &mut MigrationReport,
) -> StoreResult<()> {
    let source = blob.source().table(platform);
    let target = blob.target().table(platform);
    let column = blob.column();
    let key = blob.key_column();

    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {key}, {column} FROM {source} \
             WHERE {column} IS NOT NULL AND TRIM({column}) != '' ORDER BY {key}"
        ))?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };

    for (id, raw) in rows {
        let written = match blob {
            LegacyBlob::ChannelCounts => parse_channel_counts(&raw).map(|counts| {
                counts
                    .into_iter()
                    .map(|(channel_id, count)| {
                        conn.execute(
                            &format!(
                                "INSERT INTO {target} (user_id, channel_id, count) VALUES (?1, ?2, ?3) \
                                 ON CONFLICT(user_id, channel_id) DO UPDATE SET count = excluded.count"
                            ),
                            rusqlite::params![id, channel_id, count],
                        )
                    })
                    .sum::<Result<usize, _>>()
            }),
            LegacyBlob::Cooldowns => parse_cooldowns(&raw).map(|entries| {
                entries
                    .into_iter()
                    .map(|(command, last_used)| {
                        conn.execute(
                            &format!(
                                "INSERT INTO {target} (channel_id, command, last_used) VALUES (?1, ?2, ?3) \
                                 ON CONFLICT(channel_id, command) DO UPDATE SET \
                                     last_used = MAX(last_used, excluded.last_used)"
                            ),
                            rusqlite::params![id, command, last_used],
                        )
                    })
                    .sum::<Result<usize, _>>()
            }),
            LegacyBlob::BanWords => parse_ban_words(&raw).map(|words| {
                let now = Utc::now().timestamp();
                words
                    .into_iter()
                    .map(|word| {
                        conn.execute(
                            &format!(
                                "INSERT INTO {target} (channel_id, word, added_at) VALUES (?1, ?2, ?3) \
                                 ON CONFLICT(channel_id, word) DO NOTHING"
                            ),
                            rusqlite::params![id, word, now],
                        )
                    })
                    .sum::<Result<usize, _>>()
            }),
        };

        match written {
            Ok(inserted) => {
                report.rows_migrated += 1;
                report.records_written += inserted?;
            }
            Err(reason) => {
                warn!(
                    %platform,
                    table = %source,
                    column,
                    id,
                    %reason,
                    "skipping malformed legacy row"
                );
                report.rows_skipped += 1;
            }
        }
    }
    debug!(%platform, %source, column, "blob column normalized");
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Blob parsers
// ═══════════════════════════════════════════════════════════════════════

/// Integer from a JSON number or numeric string.
fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `{"<channel id>": count}` → `(channel id, count)` pairs.
pub fn parse_channel_counts(raw: &str) -> Result<Vec<(i64, i64)>, String> {
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| e.to_string())?;
    map.iter()
        .map(|(channel, count)| {
            let channel_id = channel
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("channel id {channel:?} is not numeric"))?;
            let count = json_i64(count).ok_or_else(|| format!("count {count} is not an integer"))?;
            Ok((channel_id, count))
        })
        .collect()
}

/// `{"<command>": last use}` → `(command, last use)` pairs.
pub fn parse_cooldowns(raw: &str) -> Result<Vec<(String, i64)>, String> {
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| e.to_string())?;
    map.iter()
        .map(|(command, ts)| {
            if command.trim().is_empty() {
                return Err("empty command name".to_string());
            }
            let ts = json_i64(ts).ok_or_else(|| format!("timestamp {ts} is not an integer"))?;
            Ok((command.trim().to_string(), ts))
        })
        .collect()
}

/// `["word", ...]` → lower-cased, de-duplicated words.
pub fn parse_ban_words(raw: &str) -> Result<Vec<String>, String> {
    let items: Vec<serde_json::Value> = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let mut words = BTreeSet::new();
    for item in items {
        let word = item
            .as_str()
            .ok_or_else(|| format!("ban word {item} is not a string"))?;
        words.insert(normalize_word(word).map_err(|e| e.to_string())?);
    }
    Ok(words.into_iter().collect())
}

// ── tests ────────────────────────────────────────────────────────────
