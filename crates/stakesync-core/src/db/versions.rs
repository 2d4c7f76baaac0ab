//! Entity version store

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Last version of an entity known to be synced (the common ancestor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseVersion {
    pub version: i64,
    /// Server modification timestamp of that version (Unix ms)
    pub last_modified: i64,
}

/// Trait for version bookkeeping.
///
/// Commits are monotonic: a commit that would lower the stored version is
/// ignored.
pub trait VersionStore {
    /// Base for an entity, `None` if it was never synced
    fn get_base(&self, entity_type: &str, id: &str) -> Result<Option<BaseVersion>>;

    /// Record a synced version. Returns `false` when ignored as out of order.
    fn commit_base(
        &self,
        entity_type: &str,
        id: &str,
        version: i64,
        last_modified: i64,
    ) -> Result<bool>;

    /// Server change position to pass as `since` when pulling a type
    fn pull_cursor(&self, entity_type: &str) -> Result<i64>;

    /// Move the pull cursor forward (never backward)
    fn advance_pull_cursor(&self, entity_type: &str, position: i64) -> Result<()>;
}

/// `SQLite` implementation of `VersionStore`
pub struct SqliteVersionStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteVersionStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl VersionStore for SqliteVersionStore<'_> {
    fn get_base(&self, entity_type: &str, id: &str) -> Result<Option<BaseVersion>> {
        let base = self
            .conn
            .query_row(
                "SELECT version, last_modified FROM entity_bases
                 WHERE entity_type = ? AND entity_id = ?",
                params![entity_type, id],
                |row| {
                    Ok(BaseVersion {
                        version: row.get(0)?,
                        last_modified: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(base)
    }

    fn commit_base(
        &self,
        entity_type: &str,
        id: &str,
        version: i64,
        last_modified: i64,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT INTO entity_bases (entity_type, entity_id, version, last_modified)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_type, entity_id) DO UPDATE
                SET version = excluded.version, last_modified = excluded.last_modified
                WHERE excluded.version > entity_bases.version",
            params![entity_type, id, version, last_modified],
        )?;

        if rows == 0 {
            tracing::debug!(
                "Ignoring out-of-order base commit for {entity_type}/{id} at version {version}"
            );
        }
        Ok(rows > 0)
    }

    fn pull_cursor(&self, entity_type: &str) -> Result<i64> {
        let cursor = self
            .conn
            .query_row(
                "SELECT position FROM pull_cursors WHERE entity_type = ?",
                params![entity_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.unwrap_or(0))
    }

    fn advance_pull_cursor(&self, entity_type: &str, position: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pull_cursors (entity_type, position) VALUES (?1, ?2)
             ON CONFLICT(entity_type) DO UPDATE
                SET position = excluded.position
                WHERE excluded.position > pull_cursors.position",
            params![entity_type, position],
        )?;
        Ok(())
    }
}
