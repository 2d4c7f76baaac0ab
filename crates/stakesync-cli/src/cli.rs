use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stakesync_core::{ConflictResolutionStrategy, Operation};

#[derive(Parser)]
#[command(name = "stakesync")]
#[command(about = "Offline-first sync for StakeSync bets, bankroll and preferences")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name for server configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a local write and queue it for sync
    #[command(alias = "write")]
    Enqueue {
        /// Entity type (bet, bankroll, preference)
        entity_type: String,
        /// Entity id
        id: String,
        /// Kind of write
        #[arg(long, value_enum, default_value_t = OperationArg::Update)]
        op: OperationArg,
        /// JSON object with the fields to write
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Show the local copy of one entity
    Show {
        entity_type: String,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync cycle now
    Sync {
        /// Output the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing on the configured interval until interrupted
    Watch,
    /// List conflicts awaiting a decision
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one conflict
    Resolve {
        entity_type: String,
        id: String,
        /// Resolution strategy
        #[arg(long, value_enum)]
        strategy: StrategyArg,
    },
    /// List queued writes
    Queue {
        /// Number of writes to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List writes that will not be retried
    DeadLetters {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List applied conflict resolutions
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum OperationArg {
    Create,
    Update,
    Delete,
}

impl From<OperationArg> for Operation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Create => Self::Create,
            OperationArg::Update => Self::Update,
            OperationArg::Delete => Self::Delete,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    /// Keep the local version
    #[value(alias = "local")]
    ClientWins,
    /// Keep the server version
    #[value(alias = "server")]
    ServerWins,
    /// Field-by-field, newest write wins
    Merge,
}

impl From<StrategyArg> for ConflictResolutionStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::ClientWins => Self::ClientWins,
            StrategyArg::ServerWins => Self::ServerWins,
            StrategyArg::Merge => Self::Merge,
        }
    }
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config (the global --profile selects which)
    Init {
        /// Sync server base URL
        #[arg(long, value_name = "URL")]
        server_url: Option<String>,
        /// Bearer token for the sync server
        #[arg(long, value_name = "TOKEN")]
        api_token: Option<String>,
        /// Resolve conflicts automatically with this strategy
        #[arg(long, value_enum)]
        default_strategy: Option<StrategyArg>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Show the resolved profile
    Show,
}
