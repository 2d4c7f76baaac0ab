use std::path::Path;

use stakesync_core::{ConflictResolutionStrategy, EntityRef, Error};

use crate::commands::common::{
    format_record_lines, format_resolution_lines, normalize_entity_id, open_engine,
    resolution_to_item, ResolutionItem,
};
use crate::error::CliError;

pub async fn run_conflicts(
    as_json: bool,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, false)?;
    let conflicts = engine.get_conflicts().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No open conflicts.");
        return Ok(());
    }

    for line in format_record_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    entity_type: &str,
    id: &str,
    strategy: ConflictResolutionStrategy,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let entity = EntityRef::new(entity_type.trim(), normalize_entity_id(id)?);
    let engine = open_engine(db_path, profile, false)?;

    let record = match engine.resolve_conflict(&entity, strategy).await {
        Ok(record) => record,
        Err(Error::NotFound(_)) => return Err(CliError::ConflictNotFound(entity.to_string())),
        Err(error) => return Err(error.into()),
    };

    println!(
        "Resolved {} with {} (now {} at v{})",
        entity,
        strategy,
        record.sync_status(),
        record.version
    );
    Ok(())
}

pub async fn run_history(
    limit: usize,
    as_json: bool,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, false)?;
    let entries = engine.resolution_history(limit).await?;

    if as_json {
        let json_items = entries
            .iter()
            .map(resolution_to_item)
            .collect::<Vec<ResolutionItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No conflict resolutions recorded.");
        return Ok(());
    }

    for line in format_resolution_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}
