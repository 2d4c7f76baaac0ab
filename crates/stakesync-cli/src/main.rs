//! StakeSync CLI - inspect and drive offline sync from the terminal
//!
//! Queue local writes, run sync cycles and work through conflicts without
//! the app.

mod cli;
mod commands;
mod config_profiles;
mod error;


use std::path::Path;

use clap::Parser;

use crate::cli::{Cli, Commands, ConfigCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::config::{run_config_init, run_config_show};
use crate::commands::conflicts::{run_conflicts, run_history, run_resolve};
use crate::commands::queue::{run_dead_letters, run_queue};
use crate::commands::records::{run_enqueue, run_show};
use crate::commands::sync::{run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "stakesync=info"
                    .parse()
                    .map_err(|error| CliError::Config(format!("invalid log filter: {error}")))?,
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Config { command } => run_config_command(command, profile),
        command => {
            let db_path = resolve_db_path(cli.db_path)?;
            run_local_command(command, &db_path, profile).await
        }
    }
}

fn run_config_command(command: ConfigCommands, profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            server_url,
            api_token,
            default_strategy,
            no_activate,
        } => run_config_init(
            profile,
            server_url,
            api_token,
            default_strategy.map(Into::into),
            no_activate,
        ),
        ConfigCommands::Show => run_config_show(profile),
    }
}

async fn run_local_command(
    command: Commands,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    match command {
        Commands::Enqueue {
            entity_type,
            id,
            op,
            data,
        } => run_enqueue(&entity_type, &id, op.into(), &data, db_path, profile).await,
        Commands::Show {
            entity_type,
            id,
            json,
        } => run_show(&entity_type, &id, json, db_path, profile).await,
        Commands::Sync { json } => run_sync(json, db_path, profile).await,
        Commands::Watch => run_watch(db_path, profile).await,
        Commands::Conflicts { json } => run_conflicts(json, db_path, profile).await,
        Commands::Resolve {
            entity_type,
            id,
            strategy,
        } => run_resolve(&entity_type, &id, strategy.into(), db_path, profile).await,
        Commands::Queue { limit, json } => run_queue(limit, json, db_path, profile).await,
        Commands::DeadLetters { json } => run_dead_letters(json, db_path, profile).await,
        Commands::History { limit, json } => run_history(limit, json, db_path, profile).await,
        Commands::Config { command } => run_config_command(command, profile),
    }
}
