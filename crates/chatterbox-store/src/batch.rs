//! Batched writes.
//!
//! Chat traffic produces many small mutations per second. Instead of one
//! round trip per message, callers describe each user's pending work as a
//! [`UserChange`] and hand a list of them to [`BatchWriter::flush`], which
//! applies everything in one transaction:
//!
//! ```text
//!   Vec<UserChange> ──merge per (platform, user)──▶ per platform:
//!       global counters   one UPDATE per user
//!       field updates     one UPDATE per user, all fields in one SET
//!       channel deltas    multi-row upserts, chunked under the parameter limit
//! ```
//!
//! Any failure rolls the whole batch back. Flushing the same batch twice
//! applies its counter deltas twice.
//!
//! [`BatchBuffer`] sits in front of the writer and accumulates changes
//! until a size threshold or a periodic timer flushes them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, ToSql, TransactionBehavior};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};
use crate::profile::{Field, FieldValue, update_fields_sql};

/// Columns bound per channel-count upsert row.
const PARAMS_PER_CHANNEL_ROW: usize = 3;

// ═══════════════════════════════════════════════════════════════════════
//  UserChange
// ═══════════════════════════════════════════════════════════════════════

/// Pending mutations for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserChange {
    pub platform: Platform,
    pub user_id: i64,
    pub message_count: i64,
    pub message_length: i64,
    pub channels: BTreeMap<i64, i64>,
    pub fields: BTreeMap<Field, FieldValue>,
}

impl UserChange {
    pub fn new(platform: Platform, user_id: i64) -> Self {
        Self {
            platform,
            user_id,
            message_count: 0,
            message_length: 0,
            channels: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Add to the global message count and total length.
    pub fn with_global(mut self, count: i64, length: i64) -> Self {
        self.message_count += count;
        self.message_length += length;
        self
    }

    /// Add `delta` to the user's message count in `channel_id`.
    pub fn with_channel(mut self, channel_id: i64, delta: i64) -> Self {
        *self.channels.entry(channel_id).or_insert(0) += delta;
        self
    }

    /// Set a profile attribute by name. The name and value type are checked here.
    pub fn with_field(self, name: &str, value: impl Into<FieldValue>) -> StoreResult<Self> {
        self.with_typed_field(Field::parse(name)?, value)
    }

    /// Set a profile attribute.
    pub fn with_typed_field(
        mut self,
        field: Field,
        value: impl Into<FieldValue>,
    ) -> StoreResult<Self> {
        let value = value.into();
        field.check(&value)?;
        self.fields.insert(field, value);
        Ok(self)
    }

    fn has_global(&self) -> bool {
        self.message_count != 0 || self.message_length != 0
    }

    /// Whether applying this change would write nothing.
    pub fn is_empty(&self) -> bool {
        !self.has_global() && self.channels.is_empty() && self.fields.is_empty()
    }

    /// Fold `later` into `self`: deltas are summed, later field values win.
    fn merge(&mut self, later: UserChange) {
        self.message_count += later.message_count;
        self.message_length += later.message_length;
        for (channel_id, delta) in later.channels {
            *self.channels.entry(channel_id).or_insert(0) += delta;
        }
        self.fields.extend(later.fields);
    }
}

/// Merge changes per (platform, user) in arrival order, dropping empty ones.
fn coalesce(changes: Vec<UserChange>) -> BTreeMap<(Platform, i64), UserChange> {
    let mut merged: BTreeMap<(Platform, i64), UserChange> = BTreeMap::new();
    for change in changes {
        match merged.get_mut(&(change.platform, change.user_id)) {
            Some(existing) => existing.merge(change),
            None => {
                merged.insert((change.platform, change.user_id), change);
            }
        }
    }
    merged.retain(|_, c| !c.is_empty());
    merged
}

// ═══════════════════════════════════════════════════════════════════════
//  BatchWriter
// ═══════════════════════════════════════════════════════════════════════

/// Counts of what a flush applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Distinct (platform, user) pairs after merging.
    pub users_touched: usize,
    /// Global counter `UPDATE`s applied.
    pub global_updates: usize,
    /// (user, channel) rows upserted.
    pub channel_rows: usize,
    /// Field `UPDATE`s applied.
    pub field_updates: usize,
    /// Users whose global or field updates were skipped for lack of a profile.
    pub skipped_missing: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: BatchReport) {
        self.users_touched += other.users_touched;
        self.global_updates += other.global_updates;
        self.channel_rows += other.channel_rows;
        self.field_updates += other.field_updates;
        self.skipped_missing += other.skipped_missing;
    }
}

/// Applies lists of [`UserChange`] in a single transaction.
#[derive(Clone)]
pub struct BatchWriter {
    db: Database,
}

impl BatchWriter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply `changes` atomically. Either every change lands or none does.
    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub async fn flush(&self, changes: Vec<UserChange>) -> StoreResult<BatchReport> {
        let merged = coalesce(changes);
        if merged.is_empty() {
            return Ok(BatchReport::default());
        }

        let chunk_rows = (self.db.config().max_statement_params / PARAMS_PER_CHANNEL_ROW).max(1);
        let caches = self.db.caches().clone();

        let mut by_platform: BTreeMap<Platform, Vec<UserChange>> = BTreeMap::new();
        for ((platform, _), change) in merged {
            by_platform.entry(platform).or_default().push(change);
        }

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut report = BatchReport::default();
                let mut confirmed: Vec<(Platform, i64)> = Vec::new();

                for (platform, changes) in &by_platform {
                    match apply_platform(&tx, *platform, changes, chunk_rows, &mut confirmed) {
                        Ok(part) => report.absorb(part),
                        Err(err) => {
                            warn!(%platform, %err, "batch failed, rolling back");
                            return Err(err);
                        }
                    }
                }
                tx.commit()?;

                for key in confirmed {
                    caches.profiles.insert(key, ());
                }
                info!(
                    users = report.users_touched,
                    globals = report.global_updates,
                    channel_rows = report.channel_rows,
                    field_updates = report.field_updates,
                    skipped = report.skipped_missing,
                    "batch flushed"
                );
                Ok(report)
            })
            .await
    }
}

fn apply_platform(
    conn: &Connection,
    platform: Platform,
    changes: &[UserChange],
    chunk_rows: usize,
    confirmed: &mut Vec<(Platform, i64)>,
) -> StoreResult<BatchReport> {
    let users = Entity::Users.table(platform);
    let counts = Entity::ChannelCounts.table(platform);
    let mut report = BatchReport {
        users_touched: changes.len(),
        ..BatchReport::default()
    };
    let mut channel_rows: Vec<(i64, i64, i64)> = Vec::new();

    let mut exists = conn.prepare_cached(&format!(
        "SELECT EXISTS(SELECT 1 FROM {users} WHERE user_id = ?1)"
    ))?;
    let mut global = conn.prepare_cached(&format!(
        "UPDATE {users} \
         SET message_count = message_count + ?2, \
             total_message_length = total_message_length + ?3 \
         WHERE user_id = ?1"
    ))?;

    for change in changes {
        channel_rows.extend(
            change
                .channels
                .iter()
                .map(|(channel_id, delta)| (change.user_id, *channel_id, *delta)),
        );

        if !change.has_global() && change.fields.is_empty() {
            continue;
        }
        let present: bool = exists.query_row([change.user_id], |row| row.get(0))?;
        if !present {
            debug!(%platform, user_id = change.user_id, "no profile, skipping profile updates");
            report.skipped_missing += 1;
            continue;
        }
        confirmed.push((platform, change.user_id));

        if change.has_global() {
            global.execute(rusqlite::params![
                change.user_id,
                change.message_count,
                change.message_length
            ])?;
            report.global_updates += 1;
        }

        if !change.fields.is_empty() {
            let fields: Vec<Field> = change.fields.keys().copied().collect();
            let mut params: Vec<&dyn ToSql> =
                change.fields.values().map(|v| v as &dyn ToSql).collect();
            params.push(&change.user_id);
            conn.prepare_cached(&update_fields_sql(&users, &fields))?
                .execute(params.as_slice())?;
            report.field_updates += 1;
        }
    }

    for chunk in channel_rows.chunks(chunk_rows) {
        report.channel_rows += upsert_channel_chunk(conn, &counts, chunk)?;
    }
    Ok(report)
}

/// One multi-row `INSERT .. ON CONFLICT` adding each delta to its row.
fn upsert_channel_chunk(
    conn: &Connection,
    table: &str,
    rows: &[(i64, i64, i64)],
) -> StoreResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["(?, ?, ?)"; rows.len()].join(", ");
    let sql = format!(
        "INSERT INTO {table} (user_id, channel_id, count) VALUES {placeholders} \
         ON CONFLICT(user_id, channel_id) DO UPDATE SET count = count + excluded.count"
    );
    let params = rows
        .iter()
        .flat_map(|(user_id, channel_id, delta)| [*user_id, *channel_id, *delta]);
    conn.execute(&sql, rusqlite::params_from_iter(params))?;
    Ok(rows.len())
}

// ═══════════════════════════════════════════════════════════════════════
//  BatchBuffer
// ═══════════════════════════════════════════════════════════════════════

/// Changes a buffer keeps queued across failed flushes unless configured.
pub const DEFAULT_MAX_PENDING: usize = 50_000;

/// Thread-safe accumulator in front of a [`BatchWriter`].
#[derive(Clone)]
pub struct BatchBuffer {
    writer: BatchWriter,
    pending: Arc<Mutex<Vec<UserChange>>>,
    threshold: usize,
    max_pending: usize,
}

impl BatchBuffer {
    /// Buffer flushing through `writer` once `threshold` changes are pending.
    pub fn new(writer: BatchWriter, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            writer,
            pending: Arc::new(Mutex::new(Vec::new())),
            threshold,
            max_pending: DEFAULT_MAX_PENDING.max(threshold),
        }
    }

    /// Cap the changes kept queued after a failed flush. Never below the
    /// flush threshold.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(self.threshold);
        self
    }

    /// Queue a change. Flushes and returns the report when the threshold is reached.
    pub async fn push(&self, change: UserChange) -> StoreResult<Option<BatchReport>> {
        let full = {
            let mut pending = self.lock()?;
            pending.push(change);
            pending.len() >= self.threshold
        };
        if full {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// Number of queued changes.
    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush everything queued so far.
    ///
    /// On failure the drained changes are put back in front of anything
    /// queued meanwhile, so a later flush retries them. When the queue would
    /// exceed the pending limit the oldest changes are dropped.
    pub async fn flush(&self) -> StoreResult<BatchReport> {
        let drained = std::mem::take(&mut *self.lock()?);
        if drained.is_empty() {
            return Ok(BatchReport::default());
        }
        match self.writer.flush(drained.clone()).await {
            Ok(report) => Ok(report),
            Err(err) => {
                let mut pending = self.lock()?;
                let newer = std::mem::replace(&mut *pending, drained);
                pending.extend(newer);
                let overflow = pending.len().saturating_sub(self.max_pending);
                if overflow > 0 {
                    pending.drain(..overflow);
                    warn!(
                        dropped = overflow,
                        kept = pending.len(),
                        "batch backlog over limit, dropping oldest changes"
                    );
                }
                Err(err)
            }
        }
    }

    /// Flush on a fixed period until the returned handle is aborted.
    pub fn spawn_periodic_flush(&self, interval: Duration) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if buffer.is_empty() {
                    continue;
                }
                match buffer.flush().await {
                    Ok(report) => debug!(users = report.users_touched, "periodic flush"),
                    Err(err) => error!(%err, "periodic flush failed"),
                }
            }
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Vec<UserChange>>> {
        self.pending
            .lock()
            .map_err(|e| StoreError::TaskJoin(format!("batch buffer poisoned: {e}")))
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::counter::CounterStore;
    use crate::profile::ProfileStore;

    async fn setup_with(config: StoreConfig) -> (BatchWriter, ProfileStore, CounterStore) {
        let db = Database::open_in_memory_with(&config).unwrap();
        db.prepare().await.unwrap();
        (
            BatchWriter::new(db.clone()),
            ProfileStore::new(db.clone()),
            CounterStore::new(db),
        )
    }

    async fn setup() -> (BatchWriter, ProfileStore, CounterStore) {
        setup_with(StoreConfig::default()).await
    }

    #[test]
    fn builder_rejects_unknown_field() {
        let result = UserChange::new(Platform::Twitch, 1).with_field("password", "x");
        assert!(matches!(result, Err(StoreError::UnknownField(_))));
    }

    #[test]
    fn builder_rejects_wrong_type() {
        let result = UserChange::new(Platform::Twitch, 1).with_field("balance", "lots");
        assert!(matches!(result, Err(StoreError::TypeMismatch { .. })));
    }

    #[test]
    fn changes_merge_per_user() {
        let merged = coalesce(vec![
            UserChange::new(Platform::Twitch, 1)
                .with_global(1, 10)
                .with_channel(5, 1)
                .with_field("timezone", "UTC")
                .unwrap(),
            UserChange::new(Platform::Twitch, 1)
                .with_global(2, 20)
                .with_channel(5, 2)
                .with_channel(6, 1)
                .with_field("timezone", "CET")
                .unwrap(),
            UserChange::new(Platform::Discord, 1).with_global(1, 1),
            UserChange::new(Platform::Twitch, 2),
        ]);
        assert_eq!(merged.len(), 2);
        let twitch = &merged[&(Platform::Twitch, 1)];
        assert_eq!(twitch.message_count, 3);
        assert_eq!(twitch.message_length, 30);
        assert_eq!(twitch.channels[&5], 3);
        assert_eq!(twitch.channels[&6], 1);
        assert_eq!(twitch.fields[&Field::Timezone], FieldValue::from("CET"));
    }

    #[tokio::test]
    async fn flush_applies_all_kinds() {
        let (writer, profiles, counters) = setup().await;
        profiles.register(Platform::Twitch, 1, "en", "hi", 100).await.unwrap();

        let report = writer
            .flush(vec![
                UserChange::new(Platform::Twitch, 1)
                    .with_global(2, 11)
                    .with_channel(100, 2)
                    .with_field("balance", 50i64)
                    .unwrap()
                    .with_field("timezone", "UTC")
                    .unwrap(),
            ])
            .await
            .unwrap();

        assert_eq!(
            report,
            BatchReport {
                users_touched: 1,
                global_updates: 1,
                channel_rows: 1,
                field_updates: 1,
                skipped_missing: 0,
            }
        );
        assert_eq!(
            profiles.get(Platform::Twitch, 1, "message_count").await.unwrap(),
            Some(FieldValue::Integer(2))
        );
        assert_eq!(
            profiles.get(Platform::Twitch, 1, "total_message_length").await.unwrap(),
            Some(FieldValue::Integer(11))
        );
        assert_eq!(
            profiles.get(Platform::Twitch, 1, "balance").await.unwrap(),
            Some(FieldValue::Integer(50))
        );
        assert_eq!(
            counters.get_channel_count(Platform::Twitch, 1, 100).await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn missing_profiles_are_skipped_not_created() {
        let (writer, profiles, counters) = setup().await;
        let report = writer
            .flush(vec![
                UserChange::new(Platform::Twitch, 9)
                    .with_global(1, 5)
                    .with_channel(3, 1)
                    .with_field("balance", 10i64)
                    .unwrap(),
            ])
            .await
            .unwrap();

        assert_eq!(report.skipped_missing, 1);
        assert_eq!(report.global_updates, 0);
        assert_eq!(report.field_updates, 0);
        assert!(!profiles.exists(Platform::Twitch, 9).await.unwrap());
        // Channel counters carry no profile requirement.
        assert_eq!(counters.get_channel_count(Platform::Twitch, 9, 3).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn flushing_twice_double_applies_deltas() {
        let (writer, profiles, counters) = setup().await;
        profiles.register(Platform::Discord, 1, "en", "hi", 1).await.unwrap();
        let batch = vec![
            UserChange::new(Platform::Discord, 1)
                .with_global(1, 4)
                .with_channel(7, 3),
        ];

        writer.flush(batch.clone()).await.unwrap();
        writer.flush(batch).await.unwrap();

        assert_eq!(
            profiles.get(Platform::Discord, 1, "message_count").await.unwrap(),
            Some(FieldValue::Integer(2))
        );
        assert_eq!(counters.get_channel_count(Platform::Discord, 1, 7).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn channel_rows_are_chunked() {
        // Three rows per statement.
        let config = StoreConfig {
            max_statement_params: 9,
            ..StoreConfig::default()
        };
        let (writer, _, counters) = setup_with(config).await;

        let mut change = UserChange::new(Platform::Telegram, 1);
        for channel in 0..10 {
            change = change.with_channel(channel, channel + 1);
        }
        let report = writer.flush(vec![change]).await.unwrap();
        assert_eq!(report.channel_rows, 10);

        let counts = counters.channel_counts(Platform::Telegram, 1).await.unwrap();
        assert_eq!(counts.len(), 10);
        assert_eq!(counts.iter().map(|(_, c)| c).sum::<i64>(), 55);
    }

    #[tokio::test]
    async fn failure_rolls_back_whole_batch() {
        let (writer, profiles, counters) = setup().await;
        profiles.register(Platform::Twitch, 1, "en", "hi", 1).await.unwrap();

        // Sabotage a later statement of the batch.
        writer
            .db
            .execute(|conn| {
                conn.execute_batch("DROP TABLE channel_counts_youtube")?;
                Ok(())
            })
            .await
            .unwrap();

        let result = writer
            .flush(vec![
                UserChange::new(Platform::Twitch, 1)
                    .with_global(5, 5)
                    .with_channel(1, 1),
                UserChange::new(Platform::YouTube, 2).with_channel(1, 1),
            ])
            .await;
        assert!(result.is_err());

        assert_eq!(
            profiles.get(Platform::Twitch, 1, "message_count").await.unwrap(),
            Some(FieldValue::Integer(0))
        );
        assert_eq!(counters.get_channel_count(Platform::Twitch, 1, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn buffer_flushes_at_threshold() {
        let (writer, profiles, _) = setup().await;
        profiles.register(Platform::Twitch, 1, "en", "hi", 1).await.unwrap();
        let buffer = BatchBuffer::new(writer, 3);

        for _ in 0..2 {
            let flushed = buffer
                .push(UserChange::new(Platform::Twitch, 1).with_global(1, 1))
                .await
                .unwrap();
            assert!(flushed.is_none());
        }
        assert_eq!(buffer.len(), 2);

        let report = buffer
            .push(UserChange::new(Platform::Twitch, 1).with_global(1, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.users_touched, 1);
        assert!(buffer.is_empty());
        assert_eq!(
            profiles.get(Platform::Twitch, 1, "message_count").await.unwrap(),
            Some(FieldValue::Integer(3))
        );
    }

    #[tokio::test]
    async fn failed_flush_keeps_changes_queued() {
        let (writer, _, _) = setup().await;
        writer
            .db
            .execute(|conn| {
                conn.execute_batch("DROP TABLE channel_counts_twitch")?;
                Ok(())
            })
            .await
            .unwrap();
        let buffer = BatchBuffer::new(writer, 100);
        buffer
            .push(UserChange::new(Platform::Twitch, 1).with_channel(1, 1))
            .await
            .unwrap();

        assert!(buffer.flush().await.is_err());
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_backlog_is_capped() {
        let (writer, _, _) = setup().await;
        writer
            .db
            .execute(|conn| {
                conn.execute_batch("DROP TABLE channel_counts_twitch")?;
                Ok(())
            })
            .await
            .unwrap();
        let buffer = BatchBuffer::new(writer, 2).with_max_pending(3);

        buffer
            .push(UserChange::new(Platform::Twitch, 1).with_channel(1, 1))
            .await
            .unwrap();
        let second = UserChange::new(Platform::Twitch, 2).with_channel(1, 1);
        assert!(buffer.push(second).await.is_err());
        assert_eq!(buffer.len(), 2);

        // Each further push retries the backlog, which stays at the limit.
        for user_id in 3..=6 {
            assert!(
                buffer
                    .push(UserChange::new(Platform::Twitch, user_id).with_channel(1, 1))
                    .await
                    .is_err()
            );
            assert_eq!(buffer.len(), 3);
        }

        // The newest changes are the ones kept.
        let kept: Vec<i64> = buffer.lock().unwrap().iter().map(|c| c.user_id).collect();
        assert_eq!(kept, vec![4, 5, 6]);
    }

    #[test]
    fn pending_limit_never_drops_below_threshold() {
        let db = Database::open_in_memory().unwrap();
        let buffer = BatchBuffer::new(BatchWriter::new(db), 10).with_max_pending(1);
        assert_eq!(buffer.max_pending, 10);
    }

    #[tokio::test]
    async fn periodic_flush_drains_buffer() {
        let (writer, _, counters) = setup().await;
        let buffer = BatchBuffer::new(writer, 1_000);
        buffer
            .push(UserChange::new(Platform::Twitch, 4).with_channel(2, 5))
            .await
            .unwrap();

        let handle = buffer.spawn_periodic_flush(Duration::from_millis(20));
        let mut count = None;
        for _ in 0..200 {
            count = counters.get_channel_count(Platform::Twitch, 4, 2).await.unwrap();
            if count.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert_eq!(count, Some(5));
        assert!(buffer.is_empty());
    }
}
