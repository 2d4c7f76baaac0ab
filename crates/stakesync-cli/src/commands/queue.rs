use std::path::Path;

use crate::commands::common::{format_dead_letter_lines, format_mutation_lines, open_engine};
use crate::error::CliError;

pub async fn run_queue(
    limit: usize,
    as_json: bool,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, false)?;
    let mutations = engine.pending_mutations(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&mutations)?);
        return Ok(());
    }

    if mutations.is_empty() {
        println!("No queued writes.");
        return Ok(());
    }

    for line in format_mutation_lines(&mutations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_dead_letters(
    as_json: bool,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, false)?;
    let letters = engine.dead_letters().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&letters)?);
        return Ok(());
    }

    if letters.is_empty() {
        println!("No dead-lettered writes.");
        return Ok(());
    }

    for line in format_dead_letter_lines(&letters) {
        println!("{line}");
    }
    Ok(())
}
