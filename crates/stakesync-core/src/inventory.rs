//! Conflict inventory.
//!
//! There is no separate conflicts table: an entity is in the inventory for as
//! long as its local record is `conflicted`. Resolving it rewrites the record,
//! the entity's queued writes and the resolution log inside one savepoint, so
//! a crash leaves either the conflict or its resolution, never half of each.

use rusqlite::Connection;

use crate::db::{
    atomically, EntityStore, MutationQueue, ResolutionLog, SqliteEntityStore,
    SqliteMutationQueue, SqliteResolutionLog, SqliteVersionStore, VersionStore,
    DEFAULT_MAX_ATTEMPTS,
};
use crate::error::{Error, Result};
use crate::models::{
    ConflictResolutionStrategy, EntityRecord, EntityRef, QueuedMutation, ResolutionLogEntry,
    SyncStatus,
};
use crate::resolver::ConflictResolver;
use crate::schema::SchemaRegistry;
use crate::util::now_millis;

/// Result of resolving one inventory entry
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryResolution {
    /// The record as stored after resolution
    pub record: EntityRecord,
    /// Write queued to publish the resolution, if any
    pub resubmitted: Option<QueuedMutation>,
    /// Whether this resolution emptied the inventory
    pub inventory_empty: bool,
}

/// Conflicted entities awaiting a resolution decision
pub struct ConflictInventory<'a> {
    conn: &'a Connection,
    schemas: &'a SchemaRegistry,
}

impl<'a> ConflictInventory<'a> {
    pub const fn new(conn: &'a Connection, schemas: &'a SchemaRegistry) -> Self {
        Self { conn, schemas }
    }

    fn entities(&self) -> SqliteEntityStore<'a> {
        SqliteEntityStore::new(self.conn)
    }

    /// Every conflicted record, oldest local change first
    pub fn list(&self) -> Result<Vec<EntityRecord>> {
        self.entities().list_by_status(SyncStatus::Conflicted)
    }

    pub fn get(&self, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        Ok(self
            .entities()
            .get(entity)?
            .filter(EntityRecord::is_conflicted))
    }

    pub fn len(&self) -> Result<usize> {
        self.entities().count_by_status(SyncStatus::Conflicted)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Put `local` into conflict with `server`.
    ///
    /// The entity's queued writes are dropped: their effect already lives in
    /// the local record, and resolution queues a single replacement write.
    pub fn park(&self, mut local: EntityRecord, server: &EntityRecord) -> Result<EntityRecord> {
        let entity = local.entity_ref();
        atomically(self.conn, |conn| {
            let folded = SqliteMutationQueue::new(conn, DEFAULT_MAX_ATTEMPTS)
                .discard_entity(&entity)?;
            local.enter_conflict(server);
            SqliteEntityStore::new(conn).upsert(&local)?;

            tracing::warn!(
                "Conflict on {}: local v{} vs server v{} ({} queued writes folded)",
                entity,
                local.version,
                server.version,
                folded.len()
            );
            Ok(local)
        })
    }

    /// Replace the server side of an existing conflict with a newer record
    pub fn refresh(&self, mut local: EntityRecord, server: &EntityRecord) -> Result<EntityRecord> {
        let current = local.conflict().map_or(i64::MIN, |conflict| conflict.version);
        if server.version > current {
            local.enter_conflict(server);
            self.entities().upsert(&local)?;
            tracing::debug!(
                "Refreshed server side of conflict on {} to v{}",
                local.entity_ref(),
                server.version
            );
        }
        Ok(local)
    }

    /// Resolve a parked conflict with `strategy` and apply the outcome
    pub fn resolve(
        &self,
        entity: &EntityRef,
        strategy: ConflictResolutionStrategy,
    ) -> Result<InventoryResolution> {
        let local = self
            .get(entity)?
            .ok_or_else(|| Error::NotFound(format!("no conflict recorded for {entity}")))?;
        let server = local
            .conflict_server_record()
            .ok_or_else(|| Error::NotFound(format!("no conflict recorded for {entity}")))?;

        let resolution = ConflictResolver::new(self.schemas).resolve(&local, &server, strategy)?;
        let resolved_at = now_millis();

        let resubmitted = atomically(self.conn, |conn| {
            let queue = SqliteMutationQueue::new(conn, DEFAULT_MAX_ATTEMPTS);
            queue.discard_entity(entity)?;

            let resubmitted = match &resolution.resubmit {
                Some(resubmit) => {
                    let mutation = QueuedMutation::new(
                        entity.entity_type.clone(),
                        entity.id.clone(),
                        resubmit.operation,
                        resubmit.payload.clone(),
                        resubmit.base_version,
                    );
                    queue.enqueue(&mutation)?;
                    Some(mutation)
                }
                None => {
                    SqliteVersionStore::new(conn).commit_base(
                        &entity.entity_type,
                        &entity.id,
                        resolution.record.version,
                        resolution.record.last_modified,
                    )?;
                    None
                }
            };

            SqliteEntityStore::new(conn).upsert(&resolution.record)?;
            SqliteResolutionLog::new(conn).append(&local, &server, strategy, resolved_at)?;
            Ok(resubmitted)
        })?;

        let inventory_empty = self.is_empty()?;
        tracing::info!(
            "Resolved conflict on {} with {} (local v{}, server v{})",
            entity,
            strategy,
            local.version,
            server.version
        );

        Ok(InventoryResolution {
            record: resolution.record,
            resubmitted,
            inventory_empty,
        })
    }

    /// Applied resolutions, newest first
    pub fn history(&self, limit: usize) -> Result<Vec<ResolutionLogEntry>> {
        SqliteResolutionLog::new(self.conn).list(limit)
    }
}
