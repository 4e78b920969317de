use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use feedex::config::Config;
use feedex::feed;
use feedex::storage::{Database, DatabaseError, SchemaState};

/// Get the config directory path (~/.config/feedex/)
fn get_config_dir(home: &std::path::Path) -> PathBuf {
    home.join(".config").join("feedex")
}

#[derive(Parser, Debug)]
#[command(
    name = "feedex",
    about = "Create, upgrade and back up the FeedEx feed database"
)]
struct Args {
    /// Config file (defaults to ~/.config/feedex/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file (overrides config)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Backup OPML location (overrides config)
    #[arg(long, value_name = "FILE")]
    backup: Option<PathBuf>,

    /// Delete the database before opening it
    #[arg(long)]
    reset_db: bool,

    /// Import an OPML file into the database
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Write the subscriptions to the backup file
    #[arg(long)]
    export: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let home = PathBuf::from(std::env::var("HOME").context("HOME environment variable not set")?);
    let config_dir = get_config_dir(&home);
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    // User-only access on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(db) = args.db {
        config.database_path = Some(db);
    }
    if let Some(backup) = args.backup {
        config.backup_path = Some(backup);
    }

    let db_path = config.database_path_in(&config_dir);
    let options = config.store_options(&home);

    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str, &options).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another FeedEx process appears to be using {}. Please close it and try again.",
                db_path.display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    match db.state() {
        SchemaState::Created { version } => {
            println!("Created {} (schema v{})", db_path.display(), version)
        }
        SchemaState::Upgraded { from, to, report } => {
            println!(
                "Upgraded {} from schema v{} to v{}",
                db_path.display(),
                from,
                to
            );
            for step in report.skipped() {
                println!(
                    "  skipped: {} ({})",
                    step.statement,
                    step.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        SchemaState::Current { version } => {
            tracing::debug!(version, "Database schema is current")
        }
    }

    // Let the first-run import finish before the process exits
    if let Some(source) = db.wait_for_bootstrap().await {
        println!("Seeded feeds from {}", source);
    }

    if let Some(import_file) = &args.import {
        let doc = feed::parse(import_file)
            .await
            .context("Failed to parse OPML file")?;
        let summary = db
            .import_opml(&doc)
            .await
            .context("Failed to import feeds")?;
        println!(
            "Imported {} feeds ({} groups, {} filters); {} already present",
            summary.feeds, summary.groups, summary.filters, summary.duplicates
        );
    }

    if args.export {
        match db.export_to(&options.backup_path).await {
            Ok(feeds) => println!(
                "Backup of {} feeds written to {}",
                feeds,
                options.backup_path.display()
            ),
            Err(e) => eprintln!(
                "Warning: could not write backup to {}: {:#}",
                options.backup_path.display(),
                e
            ),
        }
    }

    println!("Schema version: {}", db.schema_version().await?);
    for table in db.table_names().await? {
        let columns = db.table_columns(&table).await?;
        println!("  {} ({} columns)", table, columns.len());
    }

    db.close().await;
    Ok(())
}
