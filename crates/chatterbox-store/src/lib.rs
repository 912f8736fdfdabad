//! # chatterbox-store
//!
//! Persistence layer for the chatterbox multi-platform chat bot.
//!
//! Every platform (Twitch, Discord, Telegram, YouTube) gets its own family
//! of SQLite tables: profiles, per-channel message counts, username
//! history, four role tables, cooldowns, ban words and channel settings.
//! Hot lookups are served from `moka` caches that are kept coherent with
//! the tables by mutating them under the connection lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  ChatStore (facade)          BatchBuffer         │
//! ├──────────────────────────────────────────────────┤
//! │  ProfileStore  CounterStore  IdentityIndex       │
//! │  RoleStore     CooldownStore ChannelStore        │
//! │  BatchWriter (one transaction per flush)         │
//! ├──────────────────────────────────────────────────┤
//! │  Caches (moka: usernames, roles, profiles,       │
//! │          prefixes)                               │
//! ├──────────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)         │
//! │  Schema catalog + legacy blob migration          │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use chatterbox_store::{ChatStore, Platform, StoreConfig, UserChange};
//!
//! let config = StoreConfig::load("config/default.toml")?;
//! let (store, _report) = ChatStore::open(&config).await?;
//!
//! store.profiles().register(Platform::Twitch, 42, "en", "hello", 7).await?;
//! store.batch_writer().flush(vec![
//!     UserChange::new(Platform::Twitch, 42).with_global(1, 5).with_channel(7, 1),
//! ]).await?;
//! ```

pub mod batch;
pub mod cache;
pub mod channel;
pub mod config;
pub mod cooldown;
pub mod counter;
pub mod db;
pub mod error;
pub mod identity;
pub mod migration;
pub mod platform;
pub mod profile;
pub mod role;
pub mod schema;
pub mod store;

// ── re-exports ───────────────────────────────────────────────────────

pub use batch::{BatchBuffer, BatchReport, BatchWriter, UserChange};
pub use cache::{CacheLayer, CacheStats, Caches};
pub use channel::{BanWordMatcher, ChannelStore};
pub use config::StoreConfig;
pub use cooldown::CooldownStore;
pub use counter::CounterStore;
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use identity::IdentityIndex;
pub use migration::{LegacyBlob, MigrationReport};
pub use platform::{Entity, Platform};
pub use profile::{Field, FieldKind, FieldValue, ProfileStore, UserProfile};
pub use role::{RoleKind, RoleRecord, RoleStore};
pub use store::{ChatStore, TableCount};
