//! Database layer for StakeSync

mod connection;
mod entities;
mod migrations;
mod queue;
mod resolution_log;
mod versions;

pub use connection::Database;
pub use entities::{EntityStore, SqliteEntityStore};
pub use queue::{FailureOutcome, MutationQueue, SqliteMutationQueue, DEFAULT_MAX_ATTEMPTS};
pub use resolution_log::{ResolutionLog, SqliteResolutionLog};
pub use versions::{BaseVersion, SqliteVersionStore, VersionStore};

use crate::error::Result;
use rusqlite::Connection;

/// Run `f` inside a savepoint, rolling back everything it wrote on error.
///
/// Savepoints nest, so repository methods and the engine can both use this
/// without coordinating who owns the outer transaction.
pub fn atomically<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("SAVEPOINT stakesync_atomic")?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("RELEASE stakesync_atomic") {
                conn.execute_batch("ROLLBACK TO stakesync_atomic; RELEASE stakesync_atomic")
                    .ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(error) => {
            conn.execute_batch("ROLLBACK TO stakesync_atomic; RELEASE stakesync_atomic")
                .ok();
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_atomically_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let result: Result<()> = atomically(conn, |conn| {
            conn.execute(
                "INSERT INTO pull_cursors (entity_type, position) VALUES ('bet', 3)",
                [],
            )?;
            Err(Error::Validation("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM pull_cursors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_atomically_nests() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        atomically(conn, |outer| {
            outer.execute(
                "INSERT INTO pull_cursors (entity_type, position) VALUES ('bet', 1)",
                [],
            )?;
            let inner: Result<()> = atomically(outer, |inner| {
                inner.execute(
                    "INSERT INTO pull_cursors (entity_type, position) VALUES ('preference', 1)",
                    [],
                )?;
                Err(Error::Validation("inner failure".to_string()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

        let types: Vec<String> = conn
            .prepare("SELECT entity_type FROM pull_cursors")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(types, vec!["bet".to_string()]);
    }
}
