use std::path::Path;

use stakesync_core::Operation;

use crate::commands::common::{format_record_lines, normalize_entity_id, open_engine, parse_payload};
use crate::error::CliError;

pub async fn run_enqueue(
    entity_type: &str,
    id: &str,
    operation: Operation,
    data: &str,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;
    let payload = parse_payload(data)?;

    let engine = open_engine(db_path, profile, false)?;
    let mutation = engine
        .enqueue_local_write(entity_type.trim(), &id, operation, payload)
        .await?;

    println!("{}", mutation.id);
    Ok(())
}

pub async fn run_show(
    entity_type: &str,
    id: &str,
    as_json: bool,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;
    let engine = open_engine(db_path, profile, false)?;
    let Some(record) = engine.get_record(entity_type.trim(), &id).await? else {
        return Err(CliError::Core(stakesync_core::Error::NotFound(format!(
            "{entity_type}/{id}"
        ))));
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        for line in format_record_lines(std::slice::from_ref(&record)) {
            println!("{line}");
        }
    }
    Ok(())
}
