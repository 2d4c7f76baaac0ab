//! Local entity store

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{ConflictData, EntityRecord, EntityRef, SyncStatus};

/// Trait for the client's local copy of every entity
pub trait EntityStore {
    /// Get the local record for an entity
    fn get(&self, entity: &EntityRef) -> Result<Option<EntityRecord>>;

    /// Insert or replace the local record
    fn upsert(&self, record: &EntityRecord) -> Result<()>;

    /// Records with the given status, oldest `last_modified` first
    fn list_by_status(&self, status: SyncStatus) -> Result<Vec<EntityRecord>>;

    /// Number of records with the given status
    fn count_by_status(&self, status: SyncStatus) -> Result<usize>;
}

/// `SQLite` implementation of `EntityStore`
pub struct SqliteEntityStore<'a> {
    conn: &'a Connection,
}

const ENTITY_COLUMNS: &str = "entity_type, entity_id, version, last_modified, data, \
                              field_timestamps, is_deleted, sync_status, conflict_data";

impl<'a> SqliteEntityStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        let data: String = row.get(4)?;
        let field_timestamps: String = row.get(5)?;
        let status: String = row.get(7)?;
        let conflict: Option<String> = row.get(8)?;

        let conflict = conflict
            .map(|raw| serde_json::from_str::<ConflictData>(&raw))
            .transpose()
            .map_err(|error| conversion_error(8, error))?;
        let status = status
            .parse::<SyncStatus>()
            .map_err(|error| conversion_error(7, error))?;

        EntityRecord::synced(
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get(2)?,
            row.get(3)?,
            serde_json::from_str(&data).map_err(|error| conversion_error(4, error))?,
        )
        .with_field_timestamps(
            serde_json::from_str(&field_timestamps).map_err(|error| conversion_error(5, error))?,
        )
        .with_deleted(row.get::<_, i32>(6)? != 0)
        .with_state(status, conflict)
        .map_err(|message| conversion_error(7, std::io::Error::other(message)))
    }
}

fn conversion_error(
    column: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}

impl EntityStore for SqliteEntityStore<'_> {
    fn get(&self, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ? AND entity_id = ?"
                ),
                params![entity.entity_type, entity.id],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert(&self, record: &EntityRecord) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        let field_timestamps = serde_json::to_string(&record.field_timestamps)?;
        let conflict = record.conflict().map(serde_json::to_string).transpose()?;

        self.conn.execute(
            "INSERT INTO entities (entity_type, entity_id, version, last_modified, data,
                                   field_timestamps, is_deleted, sync_status, conflict_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                version = excluded.version,
                last_modified = excluded.last_modified,
                data = excluded.data,
                field_timestamps = excluded.field_timestamps,
                is_deleted = excluded.is_deleted,
                sync_status = excluded.sync_status,
                conflict_data = excluded.conflict_data",
            params![
                record.entity_type,
                record.id,
                record.version,
                record.last_modified,
                data,
                field_timestamps,
                i32::from(record.is_deleted),
                record.sync_status().as_str(),
                conflict,
            ],
        )?;
        Ok(())
    }

    fn list_by_status(&self, status: SyncStatus) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE sync_status = ?
             ORDER BY last_modified ASC, entity_type ASC, entity_id ASC"
        ))?;

        let records = stmt
            .query_map(params![status.as_str()], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn count_by_status(&self, status: SyncStatus) -> Result<usize> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE sync_status = ?",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Payload;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_upsert_and_get_round_trips_every_field() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let record = EntityRecord::pending("bet", "42", 3, 1_000, payload(json!({"amount": 50})))
            .with_field_timestamps(BTreeMap::from([("amount".to_string(), 1_000)]));
        store.upsert(&record).unwrap();

        let fetched = store.get(&EntityRef::new("bet", "42")).unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn test_conflicted_record_keeps_conflict_data() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let mut local = EntityRecord::pending("bet", "42", 3, 1_000, payload(json!({"amount": 50})));
        let server = EntityRecord::synced("bet", "42", 4, 2_000, payload(json!({"odds": 1.8})));
        local.enter_conflict(&server);
        store.upsert(&local).unwrap();

        let fetched = store.get(&local.entity_ref()).unwrap().unwrap();
        assert_eq!(fetched.sync_status(), SyncStatus::Conflicted);
        assert_eq!(fetched.conflict().unwrap().data, server.data);
        assert_eq!(store.count_by_status(SyncStatus::Conflicted).unwrap(), 1);

        let mut resolved = fetched;
        resolved.mark_synced();
        store.upsert(&resolved).unwrap();
        assert_eq!(store.count_by_status(SyncStatus::Conflicted).unwrap(), 0);
    }

    #[test]
    fn test_list_by_status_orders_oldest_first() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        for (id, modified) in [("a", 300), ("b", 100), ("c", 200)] {
            store
                .upsert(&EntityRecord::pending("bet", id, 1, modified, Payload::new()))
                .unwrap();
        }
        store
            .upsert(&EntityRecord::synced("bet", "d", 1, 50, Payload::new()))
            .unwrap();

        let ids: Vec<_> = store
            .list_by_status(SyncStatus::Pending)
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_get_missing_entity() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());
        assert!(store.get(&EntityRef::new("bet", "nope")).unwrap().is_none());
    }
}
