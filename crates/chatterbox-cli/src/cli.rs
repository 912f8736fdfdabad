//! CLI argument definitions for chatterbox.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use chatterbox_store::{Platform, RoleKind};
use clap::{Parser, Subcommand};

/// chatterbox -- storage maintenance for the chat bot.
#[derive(Parser)]
#[command(
    name = "chatterbox",
    version,
    about = "chatterbox -- chat bot storage maintenance",
    long_about = "Inspect and migrate the per-platform SQLite store backing the chatterbox bot."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = "config/default.toml")]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create missing tables and migrate any legacy layout.
    Migrate,

    /// Show row counts for every table family.
    Status,

    /// Print every attribute of a user profile.
    Profile {
        /// Platform tag (twitch, discord, telegram, youtube).
        platform: Platform,
        /// Platform user id.
        user_id: i64,
    },

    /// List the holders of a role.
    Roles {
        /// Role kind (ban, moderator, developer, ignore).
        kind: RoleKind,
        /// Platform tag (twitch, discord, telegram, youtube).
        platform: Platform,
    },
}
