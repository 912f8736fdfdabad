//! CLI entry point for chatterbox.
//!
//! This binary provides the `chatterbox` command with subcommands for
//! migrating the store and inspecting its contents.

mod cli;
mod helpers;

use anyhow::{Context, Result};
use chatterbox_store::{ChatStore, Platform, RoleKind};
use clap::Parser;
use tracing::info;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    helpers::init_tracing(if cli.verbose { "debug" } else { "info" });

    let config = helpers::load_config(&cli.config)?;

    match cli.command {
        Commands::Migrate => cmd_migrate(&config).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Profile { platform, user_id } => cmd_profile(&config, platform, user_id).await,
        Commands::Roles { kind, platform } => cmd_roles(&config, kind, platform).await,
    }
}

async fn open(config: &chatterbox_store::StoreConfig) -> Result<ChatStore> {
    let (store, report) = ChatStore::open(config)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    if !report.is_empty() {
        info!(
            platforms = report.platforms.len(),
            rows_migrated = report.rows_migrated,
            rows_skipped = report.rows_skipped,
            "legacy layout migrated"
        );
    }
    Ok(store)
}

// ---------------------------------------------------------------------------
// Subcommand: migrate
// ---------------------------------------------------------------------------

async fn cmd_migrate(config: &chatterbox_store::StoreConfig) -> Result<()> {
    let (_store, report) = ChatStore::open(config)
        .await
        .context("migration failed")?;

    println!();
    if report.is_empty() {
        println!("  Schema up to date, nothing to migrate.");
    } else {
        let platforms: Vec<String> = report.platforms.iter().map(Platform::to_string).collect();
        println!("  Migrated platforms: {}", platforms.join(", "));
        println!("  Rows migrated:      {}", report.rows_migrated);
        println!("  Rows skipped:       {}", report.rows_skipped);
        println!("  Records written:    {}", report.records_written);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config: &chatterbox_store::StoreConfig) -> Result<()> {
    let store = open(config).await?;
    let counts = store.table_counts().await?;

    println!();
    println!("  chatterbox status ({})", config.database_path.display());
    println!("  =================");
    let mut current = None;
    for count in counts {
        if current != Some(count.platform) {
            println!();
            println!("  [{}]", count.platform);
            current = Some(count.platform);
        }
        println!("    {:<24} {:>10}", count.table, count.rows);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: profile
// ---------------------------------------------------------------------------

async fn cmd_profile(
    config: &chatterbox_store::StoreConfig,
    platform: Platform,
    user_id: i64,
) -> Result<()> {
    let store = open(config).await?;
    match store.profiles().profile(platform, user_id).await? {
        Some(profile) => {
            let username = store.identities().resolve_username(platform, user_id).await?;
            let mut value = serde_json::to_value(&profile)?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("username".into(), serde_json::json!(username));
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        None => println!("No profile for {user_id} on {platform}."),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: roles
// ---------------------------------------------------------------------------

async fn cmd_roles(
    config: &chatterbox_store::StoreConfig,
    kind: RoleKind,
    platform: Platform,
) -> Result<()> {
    let store = open(config).await?;
    let records = store.roles().list(kind, platform).await?;
    if records.is_empty() {
        println!("No {kind} records on {platform}.");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
