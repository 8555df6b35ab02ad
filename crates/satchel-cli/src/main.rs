//! Satchel CLI - study records on this device, synced through Supabase.

use std::env;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

mod auth;
mod cli;
mod commands;
mod error;
mod oauth_bridge;


use cli::{Cli, Commands};
use commands::api_key::run_api_key;
use commands::auth_cmd::run_auth;
use commands::completions::run_completions;
use commands::records::{run_delete, run_list, run_put};
use commands::status::run_status;
use commands::sync::run_sync;
use commands::watch::run_watch;
use error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::from_default_env();
    let filter = match "satchel=info".parse::<Directive>() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Put {
            collection,
            id,
            json,
        } => run_put(&collection, &id, &json, &db_path).await?,
        Commands::Delete { collection, id } => run_delete(&collection, &id, &db_path).await?,
        Commands::List { collection, json } => {
            run_list(collection.as_deref(), json, &db_path).await?;
        }
        Commands::ApiKey { command } => run_api_key(command, &db_path).await?,
        Commands::Sync { force } => run_sync(force, &db_path).await?,
        Commands::Status { json } => run_status(json, &db_path).await?,
        Commands::Watch { ephemeral } => run_watch(ephemeral, &db_path).await?,
        Commands::Auth { command } => run_auth(command).await?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}

pub(crate) fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("SATCHEL_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("satchel")
        .join("satchel.db")
}
