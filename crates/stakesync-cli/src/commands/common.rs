use std::env;
use std::path::{Path, PathBuf};

use serde::Serialize;
use stakesync_core::db::Database;
use stakesync_core::models::{DeadLetter, ResolutionLogEntry};
use stakesync_core::server::{HttpSyncServer, PullPage, PushOutcome, SyncServer};
use stakesync_core::util::non_blank;
use stakesync_core::{
    EntityRecord, Payload, QueuedMutation, SchemaRegistry, SyncConfig, SyncEngine,
    TransportError,
};

use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

/// Server behind the CLI's engine.
///
/// Local commands work without any server configured; only pushes and pulls
/// fail in that case.
#[derive(Debug)]
pub enum CliServer {
    Http(HttpSyncServer),
    Unconfigured,
}

impl SyncServer for CliServer {
    async fn push(&self, mutation: &QueuedMutation) -> Result<PushOutcome, TransportError> {
        match self {
            Self::Http(server) => server.push(mutation).await,
            Self::Unconfigured => Err(unconfigured()),
        }
    }

    async fn pull(&self, entity_type: &str, since: i64) -> Result<PullPage, TransportError> {
        match self {
            Self::Http(server) => server.pull(entity_type, since).await,
            Self::Unconfigured => Err(unconfigured()),
        }
    }
}

fn unconfigured() -> TransportError {
    TransportError::Network("sync server is not configured".to_string())
}

/// Server settings after merging environment over profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSettings {
    pub server_url: Option<String>,
    pub api_token: Option<String>,
}

pub fn resolve_server_settings(
    config: &CliProfilesConfig,
    profile: Option<&str>,
    env_url: Option<String>,
    env_token: Option<String>,
) -> ServerSettings {
    let profile_name = config.resolve_profile_name(profile);
    let stored = config.profile(&profile_name);

    ServerSettings {
        server_url: non_blank(env_url)
            .or_else(|| stored.and_then(|profile| profile.server_url())),
        api_token: non_blank(env_token)
            .or_else(|| stored.and_then(|profile| profile.api_token())),
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("STAKESYNC_DB_PATH").map(PathBuf::from))
    {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("stakesync").join("stakesync.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

/// Open the local database and wrap it in an engine.
///
/// With `require_server`, a missing server configuration is an error instead
/// of an offline engine.
pub fn open_engine(
    db_path: &Path,
    profile: Option<&str>,
    require_server: bool,
) -> Result<SyncEngine<CliServer>, CliError> {
    let profiles = CliProfilesConfig::load().map_err(CliError::Config)?;
    let settings = resolve_server_settings(
        &profiles,
        profile,
        env::var("STAKESYNC_SERVER_URL").ok(),
        env::var("STAKESYNC_API_TOKEN").ok(),
    );

    let mut config = SyncConfig::default();
    let profile_name = profiles.resolve_profile_name(profile);
    if let Some(strategy) = profiles
        .profile(&profile_name)
        .and_then(|stored| stored.default_strategy)
    {
        config = config.with_default_strategy(strategy);
    }

    let server = match settings.server_url {
        Some(url) => {
            tracing::debug!("Using sync server {} (profile '{}')", url, profile_name);
            CliServer::Http(HttpSyncServer::new(
                url,
                settings.api_token,
                config.request_timeout,
            )?)
        }
        None if require_server => return Err(CliError::SyncNotConfigured),
        None => CliServer::Unconfigured,
    };

    let db = Database::open(db_path)?;
    Ok(SyncEngine::new(
        db,
        server,
        SchemaRegistry::stakesync_default(),
        config,
    )?)
}

/// Parse `--data` as a JSON object
pub fn parse_payload(raw: &str) -> Result<Payload, CliError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|error| CliError::InvalidPayload(error.to_string()))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CliError::InvalidPayload(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

pub fn normalize_entity_id(id: &str) -> Result<String, CliError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(CliError::EmptyEntityId);
    }
    Ok(id.to_string())
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_record_lines(records: &[EntityRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let mut line = format!(
                "{}  {:<10}  {}  v{}  {}",
                format_sync_timestamp(record.last_modified),
                record.sync_status().as_str(),
                record.entity_ref(),
                record.version,
                serde_json::Value::Object(record.data.clone())
            );
            if record.is_deleted {
                line.push_str("  (deleted)");
            }
            if let Some(conflict) = record.conflict() {
                line.push_str(&format!(
                    "\n    server v{} at {}: {}",
                    conflict.version,
                    format_sync_timestamp(conflict.last_modified),
                    serde_json::Value::Object(conflict.data.clone())
                ));
            }
            line
        })
        .collect()
}

pub fn format_mutation_lines(mutations: &[QueuedMutation]) -> Vec<String> {
    mutations
        .iter()
        .map(|mutation| {
            let mut line = format!(
                "{}  {:<6}  {}  base=v{}  attempts={}",
                format_sync_timestamp(mutation.enqueued_at),
                mutation.operation.as_str(),
                mutation.entity_ref(),
                mutation.base_version,
                mutation.attempt_count
            );
            if let Some(error) = &mutation.last_error {
                line.push_str(&format!("  last_error={error}"));
            }
            line
        })
        .collect()
}

pub fn format_dead_letter_lines(letters: &[DeadLetter]) -> Vec<String> {
    letters
        .iter()
        .map(|letter| {
            format!(
                "{}  {:<6}  {}  attempts={}  reason={}",
                format_sync_timestamp(letter.dead_lettered_at),
                letter.mutation.operation.as_str(),
                letter.mutation.entity_ref(),
                letter.mutation.attempt_count,
                letter.reason
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ResolutionItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub local_version: i64,
    pub server_version: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

pub fn resolution_to_item(entry: &ResolutionLogEntry) -> ResolutionItem {
    ResolutionItem {
        id: entry.id,
        entity_type: entry.entity.entity_type.clone(),
        entity_id: entry.entity.id.clone(),
        local_version: entry.local_version,
        server_version: entry.server_version,
        resolved_at: entry.resolved_at,
        resolved_at_iso: format_sync_timestamp(entry.resolved_at),
        strategy: entry.strategy.to_string(),
    }
}

pub fn format_resolution_lines(entries: &[ResolutionLogEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{}  {:<11}  {}  local=v{} server=v{}",
                format_sync_timestamp(entry.resolved_at),
                entry.strategy.as_str(),
                entry.entity,
                entry.local_version,
                entry.server_version
            )
        })
        .collect()
}
