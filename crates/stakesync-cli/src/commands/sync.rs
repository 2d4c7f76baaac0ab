use std::path::Path;

use stakesync_core::scheduler::run_scheduler;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{format_record_lines, open_engine};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, db_path: &Path, profile: Option<&str>) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, true)?;
    let Some(report) = engine.trigger_sync().await? else {
        return Err(CliError::SyncInProgress);
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Sync completed: {}", report.summary());
    if !report.conflicted.is_empty() {
        println!("New conflicts:");
        for line in format_record_lines(&report.conflicted) {
            println!("  {line}");
        }
    }
    for mutation in &report.failed {
        println!(
            "Dead-lettered {} {}: {}",
            mutation.operation,
            mutation.entity_ref(),
            mutation.last_error.as_deref().unwrap_or("rejected")
        );
    }
    for issue in &report.errors {
        match &issue.entity_id {
            Some(id) => println!("Error on {}/{}: {}", issue.entity_type, id, issue.message),
            None => println!("Error on {}: {}", issue.entity_type, issue.message),
        }
    }
    Ok(())
}

pub async fn run_watch(db_path: &Path, profile: Option<&str>) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, true)?;

    // The CLI has no connectivity signal; keep the sender alive so the
    // scheduler only runs on its timer.
    let (_connectivity, receiver) = watch::channel(true);
    let shutdown = CancellationToken::new();

    let interrupt = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", error);
            }
            println!("Stopping...");
            shutdown.cancel();
        }
    };

    println!("Watching for changes (Ctrl-C to stop)");
    tokio::join!(run_scheduler(&engine, receiver, shutdown), interrupt);
    Ok(())
}
