//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Migration to version 1: queue, version store and entity store
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Local mutation queue; seq gives the replay order
        CREATE TABLE IF NOT EXISTS mutations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            base_version INTEGER NOT NULL,
            last_error TEXT,
            dead_lettered_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_mutations_entity ON mutations(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_mutations_dead ON mutations(dead_lettered_at);

        CREATE TABLE IF NOT EXISTS acknowledged_mutations (
            id TEXT PRIMARY KEY,
            acknowledged_at INTEGER NOT NULL
        );

        -- Entity version store
        CREATE TABLE IF NOT EXISTS entity_bases (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        );

        CREATE TABLE IF NOT EXISTS pull_cursors (
            entity_type TEXT PRIMARY KEY,
            position INTEGER NOT NULL
        );

        -- Local entity store; conflicted rows are the conflict inventory
        CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            data TEXT NOT NULL,
            field_timestamps TEXT NOT NULL DEFAULT '{}',
            is_deleted INTEGER NOT NULL DEFAULT 0,
            sync_status TEXT NOT NULL,
            conflict_data TEXT,
            PRIMARY KEY (entity_type, entity_id),
            CHECK ((sync_status = 'conflicted') = (conflict_data IS NOT NULL))
        );
        CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(sync_status, last_modified);

        INSERT INTO schema_version (version) VALUES (1);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict resolution history
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS resolution_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            server_version INTEGER NOT NULL,
            local_last_modified INTEGER NOT NULL,
            server_last_modified INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            strategy TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_resolution_log_entity ON resolution_log(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_resolution_log_resolved_at ON resolution_log(resolved_at DESC);

        INSERT INTO schema_version (version) VALUES (2);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_entities_reject_conflict_data_without_status() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let result = conn.execute(
            "INSERT INTO entities (entity_type, entity_id, version, last_modified, data, sync_status, conflict_data)
             VALUES ('bet', '1', 1, 1, '{}', 'synced', '{}')",
            [],
        );
        assert!(result.is_err());
    }
}
