//! Schema catalog.
//!
//! Builds the DDL for every (entity, platform) table family, creates it
//! idempotently inside one transaction, and offers the introspection and
//! rebuild-and-rename helpers the legacy migration relies on.

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};
use crate::profile::Field;

/// Bookkeeping table recording applied legacy migrations.
pub const MIGRATIONS_TABLE: &str = "_migrations";

// ═══════════════════════════════════════════════════════════════════════
//  DDL
// ═══════════════════════════════════════════════════════════════════════

/// Column definitions (name, SQL) of `entity`, excluding table constraints.
fn columns(entity: Entity) -> Vec<(&'static str, String)> {
    match entity {
        Entity::Users => {
            let mut cols = vec![("user_id", "INTEGER PRIMARY KEY".to_string())];
            cols.extend(
                Field::ALL
                    .iter()
                    .map(|f| (f.column(), f.column_definition())),
            );
            cols
        }
        Entity::ChannelCounts => vec![
            ("user_id", "INTEGER NOT NULL".into()),
            ("channel_id", "INTEGER NOT NULL".into()),
            ("count", "INTEGER NOT NULL DEFAULT 0".into()),
        ],
        Entity::Usernames => vec![
            ("id", "INTEGER PRIMARY KEY AUTOINCREMENT".into()),
            ("user_id", "INTEGER NOT NULL".into()),
            ("username", "TEXT NOT NULL".into()),
            ("active", "INTEGER NOT NULL DEFAULT 1".into()),
            ("assigned_at", "INTEGER NOT NULL".into()),
        ],
        Entity::Bans | Entity::Moderators | Entity::Developers | Entity::Ignored => vec![
            ("id", "INTEGER PRIMARY KEY AUTOINCREMENT".into()),
            ("user_id", "INTEGER NOT NULL UNIQUE".into()),
            ("issued_at", "INTEGER NOT NULL".into()),
            ("issuer_id", "INTEGER".into()),
            ("reason", "TEXT".into()),
        ],
        Entity::Cooldowns => vec![
            ("channel_id", "INTEGER NOT NULL".into()),
            ("command", "TEXT NOT NULL".into()),
            ("last_used", "INTEGER NOT NULL".into()),
        ],
        Entity::BanWords => vec![
            ("channel_id", "INTEGER NOT NULL".into()),
            ("word", "TEXT NOT NULL COLLATE NOCASE".into()),
            ("added_at", "INTEGER NOT NULL".into()),
        ],
        Entity::Channels => vec![
            ("channel_id", "INTEGER PRIMARY KEY".into()),
            ("prefix", "TEXT".into()),
            ("updated_at", "INTEGER".into()),
        ],
    }
}

/// Table-level constraints appended after the column list.
fn constraints(entity: Entity) -> Option<&'static str> {
    match entity {
        Entity::ChannelCounts => Some("PRIMARY KEY (user_id, channel_id)"),
        Entity::Cooldowns => Some("PRIMARY KEY (channel_id, command)"),
        Entity::BanWords => Some("PRIMARY KEY (channel_id, word)"),
        _ => None,
    }
}

/// Names of the current columns of `entity`.
pub fn column_names(entity: Entity) -> Vec<&'static str> {
    columns(entity).into_iter().map(|(name, _)| name).collect()
}

/// `CREATE TABLE` statement for `entity` under an explicit table name.
pub fn create_table_sql(entity: Entity, table: &str, if_not_exists: bool) -> String {
    let mut parts: Vec<String> = columns(entity)
        .into_iter()
        .map(|(name, def)| format!("{name} {def}"))
        .collect();
    if let Some(constraint) = constraints(entity) {
        parts.push(constraint.to_string());
    }
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    format!("CREATE TABLE {guard}{table} (\n    {}\n)", parts.join(",\n    "))
}

/// Secondary indexes for `entity` on `platform`.
pub fn create_index_sql(entity: Entity, platform: Platform) -> Vec<String> {
    let table = entity.table(platform);
    match entity {
        Entity::ChannelCounts => vec![format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_channel ON {table}(channel_id)"
        )],
        Entity::Usernames => vec![
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_user ON {table}(user_id)"),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS ux_{table}_active_user \
                 ON {table}(user_id) WHERE active = 1"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS ux_{table}_active_name \
                 ON {table}(username) WHERE active = 1"
            ),
        ],
        _ => Vec::new(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Catalog
// ═══════════════════════════════════════════════════════════════════════

/// Create every table family and index for every known platform.
///
/// Idempotent. Runs in a single immediate transaction: either the whole
/// catalog is present afterwards or nothing was changed.
pub fn ensure_schema(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| StoreError::migration("ensure_schema", e))?;

    let result = (|| -> StoreResult<()> {
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                name        TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at  INTEGER NOT NULL
            );"
        ))?;

        for platform in Platform::ALL {
            for entity in Entity::ALL {
                let table = entity.table(platform);
                tx.execute_batch(&create_table_sql(entity, &table, true))?;
                for index in create_index_sql(entity, platform) {
                    tx.execute_batch(&index)?;
                }
            }
            debug!(%platform, "table families ensured");
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            tx.commit()
                .map_err(|e| StoreError::migration("ensure_schema", e))?;
            info!(
                platforms = Platform::ALL.len(),
                families = Entity::ALL.len(),
                "schema catalog ensured"
            );
            Ok(())
        }
        Err(err) => {
            warn!(%err, "schema creation failed, rolling back");
            // Dropping the transaction rolls it back.
            drop(tx);
            Err(StoreError::migration("ensure_schema", err))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Introspection
// ═══════════════════════════════════════════════════════════════════════

/// Whether a table named `table` exists.
pub fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of `table`, in declaration order. Empty if the table is absent.
pub fn table_columns(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let names = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Whether `table` carries a column named `column`.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ═══════════════════════════════════════════════════════════════════════
//  Rebuild
// ═══════════════════════════════════════════════════════════════════════

/// Rebuild `entity`'s table on `platform` so it carries exactly the current
/// column set, dropping any column not in the catalog.
///
/// SQLite cannot drop a column that other schema objects reference, so the
/// table is recreated under a scratch name, the retained columns are copied,
/// the original is dropped and the copy renamed into place. Current columns
/// absent from the old table take their defaults. Retained profile columns
/// are coerced to their storage type on the way, so a legacy NULL or a
/// mistyped value in a column that is now `NOT NULL` lands as the default.
/// Must be called inside a transaction.
pub fn rebuild_table(conn: &Connection, entity: Entity, platform: Platform) -> StoreResult<()> {
    let table = entity.table(platform);
    let scratch = format!("{table}__rebuild");

    let existing = table_columns(conn, &table)?;
    let retained: Vec<&str> = column_names(entity)
        .into_iter()
        .filter(|col| existing.iter().any(|e| e == col))
        .collect();
    let dropped: Vec<&String> = existing
        .iter()
        .filter(|e| !column_names(entity).contains(&e.as_str()))
        .collect();

    debug!(%table, ?retained, ?dropped, "rebuilding table");

    let cols = retained.join(", ");
    let select = retained
        .iter()
        .map(|col| copy_expression(entity, col))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {scratch}"))?;
    conn.execute_batch(&create_table_sql(entity, &scratch, false))?;
    conn.execute_batch(&format!(
        "INSERT INTO {scratch} ({cols}) SELECT {select} FROM {table}"
    ))?;
    conn.execute_batch(&format!("DROP TABLE {table}"))?;
    conn.execute_batch(&format!("ALTER TABLE {scratch} RENAME TO {table}"))?;
    for index in create_index_sql(entity, platform) {
        conn.execute_batch(&index)?;
    }

    info!(%table, dropped = dropped.len(), "table rebuilt");
    Ok(())
}

/// Expression copying `column` of `entity` out of a legacy table.
fn copy_expression(entity: Entity, column: &str) -> String {
    match entity {
        Entity::Users => match Field::parse(column) {
            Ok(field) => field.copy_expression(),
            Err(_) => column.to_string(),
        },
        _ => column.to_string(),
    }
}

// ── tests ────────────────────────────────────────────────────────────
