//! Conflict resolution history

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{ConflictResolutionStrategy, EntityRecord, EntityRef, ResolutionLogEntry};

/// Trait for the append-only log of applied resolutions
pub trait ResolutionLog {
    /// Record that `local` was resolved against `server` with `strategy`
    fn append(
        &self,
        local: &EntityRecord,
        server: &EntityRecord,
        strategy: ConflictResolutionStrategy,
        resolved_at: i64,
    ) -> Result<i64>;

    /// Most recent entries first
    fn list(&self, limit: usize) -> Result<Vec<ResolutionLogEntry>>;
}

/// `SQLite` implementation of `ResolutionLog`
pub struct SqliteResolutionLog<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteResolutionLog<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResolutionLogEntry> {
        let strategy: String = row.get(8)?;
        Ok(ResolutionLogEntry {
            id: row.get(0)?,
            entity: EntityRef::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
            local_version: row.get(3)?,
            server_version: row.get(4)?,
            local_last_modified: row.get(5)?,
            server_last_modified: row.get(6)?,
            resolved_at: row.get(7)?,
            strategy: strategy.parse().map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    8,
                    rusqlite::types::Type::Text,
                    Box::new(error),
                )
            })?,
        })
    }
}

impl ResolutionLog for SqliteResolutionLog<'_> {
    fn append(
        &self,
        local: &EntityRecord,
        server: &EntityRecord,
        strategy: ConflictResolutionStrategy,
        resolved_at: i64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO resolution_log (
                entity_type, entity_id, local_version, server_version,
                local_last_modified, server_last_modified, resolved_at, strategy
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                local.entity_type,
                local.id,
                local.version,
                server.version,
                local.last_modified,
                server.last_modified,
                resolved_at,
                strategy.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list(&self, limit: usize) -> Result<Vec<ResolutionLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, entity_id, local_version, server_version,
                    local_last_modified, server_last_modified, resolved_at, strategy
             FROM resolution_log
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;

        let entries = stmt
            .query_map(params![limit as i64], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Payload;

    #[test]
    fn test_append_and_list_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let log = SqliteResolutionLog::new(db.connection());

        let local = EntityRecord::pending("bet", "1", 3, 100, Payload::new());
        let server = EntityRecord::synced("bet", "1", 4, 200, Payload::new());

        log.append(&local, &server, ConflictResolutionStrategy::Merge, 1_000)
            .unwrap();
        log.append(&local, &server, ConflictResolutionStrategy::ServerWins, 2_000)
            .unwrap();

        let entries = log.list(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].strategy, ConflictResolutionStrategy::ServerWins);
        assert_eq!(entries[1].local_version, 3);
        assert_eq!(entries[1].server_version, 4);
        assert_eq!(entries[1].entity, EntityRef::new("bet", "1"));

        assert_eq!(log.list(1).unwrap().len(), 1);
    }
}
