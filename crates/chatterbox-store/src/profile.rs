//! User profiles and the generic attribute store.
//!
//! A profile is a fixed set of typed columns keyed by (platform, user id).
//! Callers address attributes by name; every name is resolved against the
//! closed [`Field`] whitelist before any statement text is built, because
//! column names cannot be bound as SQL parameters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::{ToSql, ToSqlOutput, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::platform::{Entity, Platform};

// ═══════════════════════════════════════════════════════════════════════
//  Field whitelist
// ═══════════════════════════════════════════════════════════════════════

/// Storage type of a profile field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Text,
    Bool,
}

impl FieldKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Text => "text",
            Self::Bool => "bool",
        }
    }
}

macro_rules! profile_fields {
    ($( $variant:ident => ($column:literal, $kind:ident, $nullable:literal, $default:literal) ),+ $(,)?) => {
        /// A whitelisted profile attribute. Each variant maps statically to
        /// one column of the `users_<platform>` table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Field {
            $( $variant, )+
        }

        impl Field {
            /// Every whitelisted field, in column order.
            pub const ALL: &'static [Field] = &[ $( Field::$variant, )+ ];

            /// Storage column name.
            pub fn column(self) -> &'static str {
                match self { $( Field::$variant => $column, )+ }
            }

            /// Storage type.
            pub fn kind(self) -> FieldKind {
                match self { $( Field::$variant => FieldKind::$kind, )+ }
            }

            /// Whether the column accepts NULL.
            pub fn nullable(self) -> bool {
                match self { $( Field::$variant => $nullable, )+ }
            }

            fn default_sql(self) -> &'static str {
                match self { $( Field::$variant => $default, )+ }
            }
        }

        impl FromStr for Field {
            type Err = StoreError;

            fn from_str(name: &str) -> Result<Self, Self::Err> {
                match name {
                    $( $column => Ok(Field::$variant), )+
                    other => Err(StoreError::UnknownField(other.to_string())),
                }
            }
        }
    };
}

profile_fields! {
    Language           => ("language",             Text,    false, "'en'"),
    Balance            => ("balance",              Integer, false, "0"),
    BankBalance        => ("bank_balance",         Integer, false, "0"),
    IsAfk              => ("is_afk",               Bool,    false, "0"),
    AfkKind            => ("afk_kind",             Text,    true,  ""),
    AfkMessage         => ("afk_message",          Text,    true,  ""),
    AfkStartedAt       => ("afk_started_at",       Integer, true,  ""),
    AfkResumes         => ("afk_resumes",          Integer, false, "0"),
    Location           => ("location",             Text,    true,  ""),
    LocationHidden     => ("location_hidden",      Bool,    false, "0"),
    Timezone           => ("timezone",             Text,    true,  ""),
    FirstMessage       => ("first_message",        Text,    true,  ""),
    FirstChannel       => ("first_channel",        Integer, true,  ""),
    FirstSeen          => ("first_seen",           Integer, true,  ""),
    LastMessage        => ("last_message",         Text,    true,  ""),
    LastChannel        => ("last_channel",         Integer, true,  ""),
    LastSeen           => ("last_seen",            Integer, true,  ""),
    MessageCount       => ("message_count",        Integer, false, "0"),
    TotalMessageLength => ("total_message_length", Integer, false, "0"),
    LastDailyReward    => ("last_daily_reward",    Integer, true,  ""),
    LastWeeklyReward   => ("last_weekly_reward",   Integer, true,  ""),
    LastWorkAt         => ("last_work_at",         Integer, true,  ""),
    Reputation         => ("reputation",           Integer, false, "0"),
    Birthday           => ("birthday",             Text,    true,  ""),
    AiModel            => ("ai_model",             Text,    true,  ""),
    AiTokensUsed       => ("ai_tokens_used",       Integer, false, "0"),
    WeatherUnits       => ("weather_units",        Text,    true,  ""),
    CurrencyCode       => ("currency_code",        Text,    true,  ""),
    DmOptIn            => ("dm_opt_in",            Bool,    false, "0"),
    PrivateProfile     => ("private_profile",      Bool,    false, "0"),
}

impl Field {
    /// Resolve a caller-supplied name against the whitelist.
    pub fn parse(name: &str) -> StoreResult<Self> {
        name.parse()
    }

    /// SQL column definition used by the schema catalog.
    pub fn column_definition(self) -> String {
        let ty = match self.kind() {
            FieldKind::Text => "TEXT",
            FieldKind::Integer | FieldKind::Bool => "INTEGER",
        };
        if self.nullable() {
            ty.to_string()
        } else {
            format!("{ty} NOT NULL DEFAULT {}", self.default_sql())
        }
    }

    /// SQL expression that reads this column from a legacy table and coerces
    /// it to the current storage type.
    ///
    /// Integer columns keep integers, truncate reals and parse numeric text;
    /// anything else reads as NULL. Non-nullable columns then fall back to
    /// their default.
    pub(crate) fn copy_expression(self) -> String {
        let col = self.column();
        let value = match self.kind() {
            FieldKind::Integer | FieldKind::Bool => format!(
                "CASE typeof({col}) \
                 WHEN 'integer' THEN {col} \
                 WHEN 'real' THEN CAST({col} AS INTEGER) \
                 WHEN 'text' THEN CASE WHEN CAST(CAST({col} AS INTEGER) AS TEXT) = trim({col}) \
                     THEN CAST({col} AS INTEGER) END \
                 END"
            ),
            FieldKind::Text => format!(
                "CASE typeof({col}) \
                 WHEN 'text' THEN {col} \
                 WHEN 'integer' THEN CAST({col} AS TEXT) \
                 WHEN 'real' THEN CAST({col} AS TEXT) \
                 END"
            ),
        };
        if self.nullable() {
            value
        } else {
            format!("COALESCE({value}, {})", self.default_sql())
        }
    }

    /// Check that `value` may be stored in this field.
    pub fn check(self, value: &FieldValue) -> StoreResult<()> {
        let ok = match (self.kind(), value) {
            (_, FieldValue::Null) => {
                if !self.nullable() {
                    return Err(StoreError::InvalidArgument(format!(
                        "field `{}` is not nullable",
                        self.column()
                    )));
                }
                true
            }
            (FieldKind::Integer, FieldValue::Integer(_)) => true,
            (FieldKind::Text, FieldValue::Text(_)) => true,
            (FieldKind::Bool, FieldValue::Bool(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::TypeMismatch {
                field: self.column(),
                expected: self.kind().as_str(),
            })
        }
    }

    /// Convert a raw column value read from SQLite into this field's type.
    fn decode(self, raw: Value) -> StoreResult<FieldValue> {
        let mismatch = || StoreError::TypeMismatch {
            field: self.column(),
            expected: self.kind().as_str(),
        };
        Ok(match (self.kind(), raw) {
            (_, Value::Null) => FieldValue::Null,
            (FieldKind::Integer, Value::Integer(i)) => FieldValue::Integer(i),
            (FieldKind::Bool, Value::Integer(i)) => FieldValue::Bool(i != 0),
            (FieldKind::Text, Value::Text(s)) => FieldValue::Text(s),
            (FieldKind::Text, Value::Integer(i)) => FieldValue::Text(i.to_string()),
            (FieldKind::Text, Value::Real(r)) => FieldValue::Text(r.to_string()),
            _ => return Err(mismatch()),
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A typed profile attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl FieldValue {
    /// The integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            Self::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Self::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
        })
    }
}

/// `UPDATE` statement setting `fields` (in order, parameters `?1..?n`) on the
/// row whose user id is bound as parameter `?n+1`.
pub(crate) fn update_fields_sql(table: &str, fields: &[Field]) -> String {
    let assignments: Vec<String> = fields
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} = ?{}", f.column(), i + 1))
        .collect();
    format!(
        "UPDATE {table} SET {} WHERE user_id = ?{}",
        assignments.join(", "),
        fields.len() + 1
    )
}

/// A full profile snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub platform: Platform,
    pub user_id: i64,
    pub fields: BTreeMap<Field, FieldValue>,
}

impl UserProfile {
    /// Value of `field`, `None` when the column is NULL.
    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        self.fields.get(&field).filter(|v| **v != FieldValue::Null)
    }
}

impl Serialize for Field {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.column())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  ProfileStore
// ═══════════════════════════════════════════════════════════════════════

/// Existence checks, registration and named-attribute access for profiles.
///
/// A profile must be registered before any attribute write succeeds; writes
/// to an unknown profile are no-ops and never create a row.
#[derive(Clone)]
pub struct ProfileStore {
    db: Database,
}

impl ProfileStore {
    /// Create a profile store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Whether a profile exists for (platform, user id).
    ///
    /// Positive answers are cached; profiles are never deleted, so a cached
    /// positive can never go stale.
    #[instrument(skip(self))]
    pub async fn exists(&self, platform: Platform, user_id: i64) -> StoreResult<bool> {
        let caches = self.db.caches().clone();
        if caches.profiles.get(&(platform, user_id)).is_some() {
            return Ok(true);
        }

        let table = Entity::Users.table(platform);
        self.db
            .execute(move |conn| {
                let found: bool = conn.query_row(
                    &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE user_id = ?1)"),
                    [user_id],
                    |row| row.get(0),
                )?;
                if found {
                    caches.profiles.insert((platform, user_id), ());
                }
                Ok(found)
            })
            .await
    }

    /// Create the default profile row in one statement.
    ///
    /// Returns `false` and leaves the existing row untouched when the
    /// profile is already present.
    #[instrument(skip(self, first_message))]
    pub async fn register(
        &self,
        platform: Platform,
        user_id: i64,
        language: &str,
        first_message: &str,
        first_channel: i64,
    ) -> StoreResult<bool> {
        if language.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "language must not be blank".into(),
            ));
        }

        let table = Entity::Users.table(platform);
        let language = language.to_string();
        let first_message = first_message.to_string();
        let now = Utc::now().timestamp();
        let caches = self.db.caches().clone();

        self.db
            .execute(move |conn| {
                let inserted = conn.execute(
                    &format!(
                        "INSERT INTO {table} \
                         (user_id, language, first_message, first_channel, first_seen, \
                          last_message, last_channel, last_seen) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?3, ?4, ?5) \
                         ON CONFLICT(user_id) DO NOTHING"
                    ),
                    rusqlite::params![user_id, language, first_message, first_channel, now],
                )?;
                caches.profiles.insert((platform, user_id), ());
                debug!(%platform, user_id, created = inserted == 1, "profile register");
                Ok(inserted == 1)
            })
            .await
    }

    /// Read one attribute. `None` when the profile is absent or the value is NULL.
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        platform: Platform,
        user_id: i64,
        field: &str,
    ) -> StoreResult<Option<FieldValue>> {
        let field = Field::parse(field)?;
        self.get_field(platform, user_id, field).await
    }

    /// Read one attribute by its typed name.
    pub async fn get_field(
        &self,
        platform: Platform,
        user_id: i64,
        field: Field,
    ) -> StoreResult<Option<FieldValue>> {
        let table = Entity::Users.table(platform);
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {} FROM {table} WHERE user_id = ?1", field.column()),
                    [user_id],
                    |row| row.get::<_, Value>(0),
                );
                match result {
                    Ok(raw) => match field.decode(raw)? {
                        FieldValue::Null => Ok(None),
                        value => Ok(Some(value)),
                    },
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Write one attribute. Returns `false` (and writes nothing) when the
    /// profile does not exist.
    #[instrument(skip(self, value))]
    pub async fn set(
        &self,
        platform: Platform,
        user_id: i64,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> StoreResult<bool> {
        let field = Field::parse(field)?;
        self.set_fields(platform, user_id, vec![(field, value.into())])
            .await
    }

    /// Write several attributes in a single `UPDATE`.
    pub async fn set_fields(
        &self,
        platform: Platform,
        user_id: i64,
        updates: Vec<(Field, FieldValue)>,
    ) -> StoreResult<bool> {
        if updates.is_empty() {
            return Ok(false);
        }
        for (field, value) in &updates {
            field.check(value)?;
        }

        let table = Entity::Users.table(platform);
        self.db
            .execute(move |conn| {
                let fields: Vec<Field> = updates.iter().map(|(f, _)| *f).collect();
                let sql = update_fields_sql(&table, &fields);
                let mut params: Vec<&dyn ToSql> =
                    updates.iter().map(|(_, v)| v as &dyn ToSql).collect();
                params.push(&user_id);
                let updated = conn.execute(&sql, params.as_slice())?;
                debug!(%platform, user_id, fields = fields.len(), updated, "profile set");
                Ok(updated > 0)
            })
            .await
    }

    /// Load every whitelisted attribute of a profile.
    #[instrument(skip(self))]
    pub async fn profile(
        &self,
        platform: Platform,
        user_id: i64,
    ) -> StoreResult<Option<UserProfile>> {
        let table = Entity::Users.table(platform);
        self.db
            .execute(move |conn| {
                let columns: Vec<&str> = Field::ALL.iter().map(|f| f.column()).collect();
                let sql = format!(
                    "SELECT {} FROM {table} WHERE user_id = ?1",
                    columns.join(", ")
                );
                let result = conn.query_row(&sql, [user_id], |row| {
                    (0..Field::ALL.len())
                        .map(|i| row.get::<_, Value>(i))
                        .collect::<Result<Vec<_>, _>>()
                });
                let raw = match result {
                    Ok(raw) => raw,
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                    Err(e) => return Err(StoreError::Sqlite(e)),
                };
                let mut fields = BTreeMap::new();
                for (field, value) in Field::ALL.iter().zip(raw) {
                    fields.insert(*field, field.decode(value)?);
                }
                Ok(Some(UserProfile {
                    platform,
                    user_id,
                    fields,
                }))
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
