//! Integration tests for the chatterbox-store crate.
//!
//! These exercise the public API end to end against a real SQLite
//! database on disk (via tempfile): catalog creation, legacy migration,
//! the component stores and batched writes.

use std::path::Path;

use chatterbox_store::{
    ChatStore, FieldValue, Platform, RoleKind, StoreConfig, StoreError, UserChange,
};

fn config_at(path: &Path) -> StoreConfig {
    StoreConfig {
        database_path: path.to_path_buf(),
        ..StoreConfig::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn open_creates_database_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("chatterbox.db");

    let (store, report) = ChatStore::open(&config_at(&db_path)).await.unwrap();
    assert!(report.is_empty());
    assert!(db_path.exists());

    let counts = store.table_counts().await.unwrap();
    assert!(counts.iter().all(|c| c.rows == 0));
}

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_at(&dir.path().join("test.db"));

    {
        let (store, _) = ChatStore::open(&config).await.unwrap();
        store
            .profiles()
            .register(Platform::Twitch, 42, "en", "hello", 7)
            .await
            .unwrap();
        store
            .identities()
            .map_username(Platform::Twitch, 42, "alice")
            .await
            .unwrap();
        store.channels().set_prefix(Platform::Twitch, 7, "?").await.unwrap();
    }

    // Opening twice is idempotent and starts with cold caches.
    let (store, report) = ChatStore::open(&config).await.unwrap();
    assert!(report.is_empty());
    assert!(store.profiles().exists(Platform::Twitch, 42).await.unwrap());
    assert_eq!(
        store.identities().resolve_id(Platform::Twitch, "alice").await.unwrap(),
        Some(42)
    );
    assert_eq!(store.channels().get_prefix(Platform::Twitch, 7).await.unwrap(), "?");
}

// ═══════════════════════════════════════════════════════════════════════
//  Profiles and counters
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn register_is_create_once() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = ChatStore::open(&config_at(&dir.path().join("test.db"))).await.unwrap();
    let profiles = store.profiles();

    assert!(profiles.register(Platform::Discord, 1, "de", "hallo", 9).await.unwrap());
    assert!(profiles.exists(Platform::Discord, 1).await.unwrap());
    profiles.set(Platform::Discord, 1, "balance", 300i64).await.unwrap();

    assert!(!profiles.register(Platform::Discord, 1, "en", "hi", 10).await.unwrap());
    assert_eq!(
        profiles.get(Platform::Discord, 1, "language").await.unwrap(),
        Some(FieldValue::from("de"))
    );
    assert_eq!(
        profiles.get(Platform::Discord, 1, "balance").await.unwrap(),
        Some(FieldValue::Integer(300))
    );
}

#[tokio::test]
async fn writes_never_create_profiles() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = ChatStore::open(&config_at(&dir.path().join("test.db"))).await.unwrap();

    assert!(!store.profiles().set(Platform::Twitch, 5, "balance", 1i64).await.unwrap());
    assert_eq!(
        store.counters().increment_global(Platform::Twitch, 5, 10, 1).await.unwrap(),
        None
    );
    assert!(!store.profiles().exists(Platform::Twitch, 5).await.unwrap());
}

#[tokio::test]
async fn unknown_field_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = ChatStore::open(&config_at(&dir.path().join("test.db"))).await.unwrap();
    let profiles = store.profiles();
    profiles.register(Platform::Twitch, 1, "en", "hi", 1).await.unwrap();

    let err = profiles.get(Platform::Twitch, 1, "user_id; DROP TABLE x").await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownField(_)));
    let err = profiles.set(Platform::Twitch, 1, "admin", true).await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownField(_)));
}

#[tokio::test]
async fn channel_counts_net_out_across_channels() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = ChatStore::open(&config_at(&dir.path().join("test.db"))).await.unwrap();
    let counters = store.counters();

    counters.increment_channel(Platform::Twitch, 1, 100, 5).await.unwrap();
    counters.increment_channel(Platform::Twitch, 1, 200, 4).await.unwrap();
    counters.increment_channel(Platform::Twitch, 1, 100, -2).await.unwrap();
    counters.increment_channel(Platform::Twitch, 1, 200, 1).await.unwrap();

    assert_eq!(counters.get_channel_count(Platform::Twitch, 1, 100).await.unwrap(), Some(3));
    assert_eq!(counters.get_channel_count(Platform::Twitch, 1, 200).await.unwrap(), Some(5));
}

// ═══════════════════════════════════════════════════════════════════════
//  Roles and cooldowns
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ban_lifecycle_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = ChatStore::open(&config_at(&dir.path().join("test.db"))).await.unwrap();
    let roles = store.roles();

    let id = roles
        .add_ban(Platform::Telegram, 77, 1_700_000_000, 1, Some("spam"))
        .await
        .unwrap();
    assert!(roles.is_banned(Platform::Telegram, 77).await.unwrap());
    assert_eq!(roles.list(RoleKind::Ban, Platform::Telegram).await.unwrap().len(), 1);

    assert!(roles.remove_ban(Platform::Telegram, id).await.unwrap());
    assert!(!roles.is_banned(Platform::Telegram, 77).await.unwrap());
}

#[tokio::test]
async fn cooldown_window_on_disk() {
    const T0: i64 = 1_700_000_000;
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = ChatStore::open(&config_at(&dir.path().join("test.db"))).await.unwrap();
    let cooldowns = store.cooldowns();

    assert!(!cooldowns.check_and_touch_at(Platform::Twitch, 1, "weather", 60, T0).await.unwrap());
    assert!(
        cooldowns
            .check_and_touch_at(Platform::Twitch, 1, "weather", 60, T0 + 30)
            .await
            .unwrap()
    );
    assert!(
        !cooldowns
            .check_and_touch_at(Platform::Twitch, 1, "weather", 60, T0 + 61)
            .await
            .unwrap()
    );
    assert_eq!(
        cooldowns.last_use(Platform::Twitch, 1, "weather").await.unwrap(),
        Some(T0 + 61)
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Batched writes
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn batch_flush_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = ChatStore::open(&config_at(&dir.path().join("test.db"))).await.unwrap();
    for user in 1..=3 {
        store
            .profiles()
            .register(Platform::YouTube, user, "en", "hi", 1)
            .await
            .unwrap();
    }

    let changes: Vec<UserChange> = (1..=3)
        .flat_map(|user| {
            (0..4).map(move |_| {
                UserChange::new(Platform::YouTube, user)
                    .with_global(1, 10)
                    .with_channel(1, 1)
            })
        })
        .collect();
    let report = store.batch_writer().flush(changes).await.unwrap();
    assert_eq!(report.users_touched, 3);
    assert_eq!(report.global_updates, 3);
    assert_eq!(report.channel_rows, 3);

    for user in 1..=3 {
        assert_eq!(
            store.profiles().get(Platform::YouTube, user, "message_count").await.unwrap(),
            Some(FieldValue::Integer(4))
        );
        assert_eq!(
            store.counters().get_channel_count(Platform::YouTube, user, 1).await.unwrap(),
            Some(4)
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Legacy migration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn legacy_database_is_migrated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("legacy.db");

    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            r#"CREATE TABLE users_twitch (
                   user_id INTEGER PRIMARY KEY,
                   language TEXT,
                   message_count INTEGER,
                   channel_message_counts TEXT
               );
               CREATE TABLE channels_twitch (
                   channel_id INTEGER PRIMARY KEY,
                   prefix TEXT,
                   cooldowns TEXT,
                   ban_words TEXT
               );
               INSERT INTO channels_twitch VALUES (7, '$', '{"ping": 1700000000}', '["Spoiler", "SPOILER"]');"#,
        )
        .unwrap();
        for user_id in 1..=10 {
            let blob = if user_id == 10 {
                "not json".to_string()
            } else {
                format!(r#"{{"7": {user_id}}}"#)
            };
            conn.execute(
                "INSERT INTO users_twitch \
                     (user_id, language, message_count, channel_message_counts) \
                 VALUES (?1, 'de', ?2, ?3)",
                rusqlite::params![user_id, user_id * 2, blob],
            )
            .unwrap();
        }
        // Older bot versions left gaps and free-form values behind.
        conn.execute_batch(
            "UPDATE users_twitch SET language = NULL, message_count = NULL WHERE user_id = 2;
             UPDATE users_twitch SET message_count = 'many' WHERE user_id = 6;",
        )
        .unwrap();
    }

    let config = config_at(&db_path);
    let (store, report) = ChatStore::open(&config).await.unwrap();
    assert_eq!(report.platforms, vec![Platform::Twitch]);
    assert_eq!(report.rows_skipped, 1);

    let counters = store.counters();
    assert_eq!(counters.channel_counts(Platform::Twitch, 3).await.unwrap(), vec![(7, 3)]);
    assert_eq!(counters.get_channel_count(Platform::Twitch, 10, 7).await.unwrap(), None);
    let counts = store.table_counts().await.unwrap();
    let normalized = counts
        .iter()
        .find(|c| c.table == "channel_counts_twitch")
        .unwrap();
    assert_eq!(normalized.rows, 9);

    // Profile columns survive, new columns take defaults.
    assert_eq!(
        store.profiles().get(Platform::Twitch, 5, "message_count").await.unwrap(),
        Some(FieldValue::Integer(10))
    );
    assert_eq!(
        store.profiles().get(Platform::Twitch, 5, "balance").await.unwrap(),
        Some(FieldValue::Integer(0))
    );

    // Gaps in columns that are now NOT NULL take the column default.
    let profiles = store.profiles();
    assert_eq!(
        profiles.get(Platform::Twitch, 2, "language").await.unwrap(),
        Some(FieldValue::Text("en".into()))
    );
    assert_eq!(
        profiles.get(Platform::Twitch, 2, "message_count").await.unwrap(),
        Some(FieldValue::Integer(0))
    );
    assert_eq!(
        profiles.get(Platform::Twitch, 6, "message_count").await.unwrap(),
        Some(FieldValue::Integer(0))
    );
    assert_eq!(
        profiles.get(Platform::Twitch, 5, "language").await.unwrap(),
        Some(FieldValue::Text("de".into()))
    );
    assert_eq!(counters.channel_counts(Platform::Twitch, 2).await.unwrap(), vec![(7, 2)]);

    let channels = store.channels();
    assert_eq!(channels.get_prefix(Platform::Twitch, 7).await.unwrap(), "$");
    assert_eq!(channels.ban_words(Platform::Twitch, 7).await.unwrap(), vec!["spoiler"]);
    assert_eq!(
        store.cooldowns().last_use(Platform::Twitch, 7, "ping").await.unwrap(),
        Some(1_700_000_000)
    );

    drop(store);
    let (_, again) = ChatStore::open(&config).await.unwrap();
    assert!(again.is_empty());
}
