use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use geotrail_import::{import_archive, ImportOptions, DEFAULT_BATCH_SIZE};
use geotrail_store_sqlite::Store;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "geotrail")]
#[command(about = "Geotrail archive tools")]
struct Cli {
    #[arg(long, default_value = "./geotrail.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Import(ImportArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = 1)]
    user: i64,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut store = Store::open(&cli.db)
        .with_context(|| format!("failed to open database at {}", cli.db.display()))?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Import(args) => run_import(&args, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut Store) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let current = store.schema_version()?;
            emit_json(serde_json::json!({
                "current_version": current,
                "target_version": geotrail_store_sqlite::LATEST_SCHEMA_VERSION,
                "up_to_date": current == geotrail_store_sqlite::LATEST_SCHEMA_VERSION,
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_version()?;
            store.migrate()?;
            let after = store.schema_version()?;
            emit_json(serde_json::json!({
                "from_version": before,
                "to_version": after,
                "status": "ok",
            }))
        }
    }
}

fn run_import(args: &ImportArgs, store: &mut Store) -> Result<()> {
    store.migrate()?;
    let options = ImportOptions { batch_size: args.batch_size };
    let stats = import_archive(store, args.user, &args.input, &options)
        .with_context(|| format!("failed to import {}", args.input.display()))?;
    emit_json(serde_json::to_value(&stats).context("failed to serialize import stats")?)
}

fn emit_json(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
