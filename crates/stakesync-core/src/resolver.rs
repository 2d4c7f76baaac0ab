//! Conflict detection and resolution.
//!
//! Everything here is a pure function of its arguments: no clock reads, no
//! storage access. Replaying a resolution after a crash therefore yields the
//! same record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::BaseVersion;
use crate::error::{Error, Result};
use crate::models::{ConflictResolutionStrategy, EntityRecord, Operation, Payload};
use crate::schema::{EntitySchema, SchemaRegistry};

/// How a local pending write relates to the server's current record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Divergence {
    /// Both sides changed since the last common version
    Conflict,
    /// Only one side changed; adopt the server version as the new base
    FastForward,
}

/// Write the engine must queue to publish a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resubmission {
    pub operation: Operation,
    pub payload: Payload,
    pub base_version: i64,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub record: EntityRecord,
    /// `None` when the server record was adopted as-is
    pub resubmit: Option<Resubmission>,
}

/// Applies resolution strategies using the declared schemas
pub struct ConflictResolver<'a> {
    schemas: &'a SchemaRegistry,
}

impl<'a> ConflictResolver<'a> {
    pub const fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Classify a pending write built on `pending_base_version` against the
    /// server record, given the stored base.
    ///
    /// A conflict needs the server to be ahead of the write *and* to have
    /// changed since the base. A missing base means the server record was
    /// never seen, which counts as a server-side change.
    pub fn detect(
        pending_base_version: i64,
        server: &EntityRecord,
        base: Option<BaseVersion>,
    ) -> Divergence {
        let server_ahead = pending_base_version < server.version;
        let server_changed = base.map_or(true, |base| server.last_modified > base.last_modified);

        if server_ahead && server_changed {
            Divergence::Conflict
        } else {
            Divergence::FastForward
        }
    }

    /// Produce the winning record for a `(local, server)` pair
    pub fn resolve(
        &self,
        local: &EntityRecord,
        server: &EntityRecord,
        strategy: ConflictResolutionStrategy,
    ) -> Result<Resolution> {
        if local.entity_ref() != server.entity_ref() {
            return Err(Error::Validation(format!(
                "cannot resolve {} against {}",
                local.entity_ref(),
                server.entity_ref()
            )));
        }
        let schema = self.schemas.get(&local.entity_type).ok_or_else(|| {
            Error::FatalSync(format!(
                "no schema registered for type '{}'",
                local.entity_type
            ))
        })?;

        Ok(match strategy {
            ConflictResolutionStrategy::ClientWins => client_wins(local, server),
            ConflictResolutionStrategy::ServerWins => server_wins(server),
            ConflictResolutionStrategy::Merge => merge(local, server, schema),
        })
    }
}

fn client_wins(local: &EntityRecord, server: &EntityRecord) -> Resolution {
    let mut record = local.clone();
    record.version = server.version + 1;
    record.mark_pending();

    let operation = if local.is_deleted {
        Operation::Delete
    } else {
        Operation::Update
    };

    Resolution {
        resubmit: Some(Resubmission {
            operation,
            payload: record.data.clone(),
            base_version: server.version,
        }),
        record,
    }
}

fn server_wins(server: &EntityRecord) -> Resolution {
    let mut record = server.clone();
    record.mark_synced();
    Resolution {
        record,
        resubmit: None,
    }
}

fn merge(local: &EntityRecord, server: &EntityRecord, schema: &EntitySchema) -> Resolution {
    // A tombstone cannot be merged field by field; the newer side wins whole.
    if local.is_deleted || server.is_deleted {
        return if local.last_modified > server.last_modified {
            client_wins(local, server)
        } else {
            server_wins(server)
        };
    }

    let mut data = Payload::new();
    let mut field_timestamps = BTreeMap::new();

    for field in schema.field_names() {
        let winner = match (local.data.get(field), server.data.get(field)) {
            (None, None) => continue,
            (Some(_), None) => local,
            (None, Some(_)) => server,
            (Some(_), Some(_)) => {
                // Ties go to the server
                if local.field_modified_at(field) > server.field_modified_at(field) {
                    local
                } else {
                    server
                }
            }
        };

        if let Some(value) = winner.data.get(field) {
            data.insert(field.to_string(), value.clone());
            field_timestamps.insert(field.to_string(), winner.field_modified_at(field));
        }
    }

    let record = EntityRecord::pending(
        local.entity_type.clone(),
        local.id.clone(),
        server.version + 1,
        local.last_modified.max(server.last_modified),
        data,
    )
    .with_field_timestamps(field_timestamps);

    Resolution {
        resubmit: Some(Resubmission {
            operation: Operation::Update,
            payload: record.data.clone(),
            base_version: server.version,
        }),
        record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncStatus;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::stakesync_default()
    }

    fn conflicted_local() -> EntityRecord {
        let mut local =
            EntityRecord::pending("bet", "42", 3, 1_500, payload(json!({"amount": 50})));
        local.enter_conflict(&server());
        local
    }

    fn server() -> EntityRecord {
        EntityRecord::synced("bet", "42", 4, 2_000, payload(json!({"odds": 1.8})))
    }

    #[test]
    fn test_detect_fast_forward_when_server_unchanged() {
        let base = BaseVersion {
            version: 3,
            last_modified: 2_000,
        };
        let server = EntityRecord::synced("bet", "42", 4, 2_000, Payload::new());
        assert_eq!(
            ConflictResolver::detect(3, &server, Some(base)),
            Divergence::FastForward
        );
    }

    #[test]
    fn test_detect_conflict_when_both_sides_changed() {
        let base = BaseVersion {
            version: 3,
            last_modified: 1_000,
        };
        assert_eq!(
            ConflictResolver::detect(3, &server(), Some(base)),
            Divergence::Conflict
        );
    }

    #[test]
    fn test_detect_no_conflict_when_write_is_current() {
        let base = BaseVersion {
            version: 4,
            last_modified: 1_000,
        };
        assert_eq!(
            ConflictResolver::detect(4, &server(), Some(base)),
            Divergence::FastForward
        );
    }

    #[test]
    fn test_detect_missing_base_counts_as_server_change() {
        assert_eq!(
            ConflictResolver::detect(0, &server(), None),
            Divergence::Conflict
        );
    }

    #[test]
    fn test_client_wins_keeps_local_data() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);
        let local = conflicted_local();

        let resolution = resolver
            .resolve(&local, &server(), ConflictResolutionStrategy::ClientWins)
            .unwrap();

        assert_eq!(resolution.record.data, local.data);
        assert_eq!(resolution.record.version, 5);
        assert_eq!(resolution.record.sync_status(), SyncStatus::Pending);
        assert!(resolution.record.conflict().is_none());
        let resubmit = resolution.resubmit.unwrap();
        assert_eq!(resubmit.base_version, 4);
        assert_eq!(resubmit.operation, Operation::Update);
        assert_eq!(resubmit.payload, local.data);
    }

    #[test]
    fn test_server_wins_keeps_server_record() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);

        let resolution = resolver
            .resolve(
                &conflicted_local(),
                &server(),
                ConflictResolutionStrategy::ServerWins,
            )
            .unwrap();

        assert_eq!(resolution.record, server());
        assert_eq!(resolution.record.sync_status(), SyncStatus::Synced);
        assert!(resolution.resubmit.is_none());
    }

    #[test]
    fn test_merge_disjoint_fields_is_union() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);

        let resolution = resolver
            .resolve(&conflicted_local(), &server(), ConflictResolutionStrategy::Merge)
            .unwrap();

        assert_eq!(
            Value::Object(resolution.record.data.clone()),
            json!({"amount": 50, "odds": 1.8})
        );
        assert_eq!(resolution.record.version, 5);
        assert_eq!(resolution.record.last_modified, 2_000);
        assert_eq!(resolution.record.sync_status(), SyncStatus::Pending);
        assert_eq!(resolution.resubmit.unwrap().base_version, 4);
    }

    #[test]
    fn test_merge_overlapping_field_prefers_newer_side() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);

        let local = EntityRecord::pending(
            "bet",
            "7",
            1,
            3_000,
            payload(json!({"amount": 10, "odds": 2.0})),
        );
        let server = EntityRecord::synced(
            "bet",
            "7",
            2,
            2_000,
            payload(json!({"amount": 99, "odds": 2.5})),
        )
        .with_field_timestamps(BTreeMap::from([("odds".to_string(), 4_000)]));

        let resolution = resolver
            .resolve(&local, &server, ConflictResolutionStrategy::Merge)
            .unwrap();

        // amount: local 3000 vs server record-level 2000
        // odds: local 3000 vs server field-level 4000
        assert_eq!(
            Value::Object(resolution.record.data),
            json!({"amount": 10, "odds": 2.5})
        );
        assert_eq!(resolution.record.field_timestamps["odds"], 4_000);
        assert_eq!(resolution.record.field_timestamps["amount"], 3_000);
    }

    #[test]
    fn test_merge_tie_goes_to_server() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);

        let local = EntityRecord::pending("bet", "7", 1, 2_000, payload(json!({"amount": 10})));
        let server = EntityRecord::synced("bet", "7", 2, 2_000, payload(json!({"amount": 20})));

        let resolution = resolver
            .resolve(&local, &server, ConflictResolutionStrategy::Merge)
            .unwrap();
        assert_eq!(resolution.record.data["amount"], json!(20));
    }

    #[test]
    fn test_merge_is_pure() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);
        let local = conflicted_local();

        let first = resolver
            .resolve(&local, &server(), ConflictResolutionStrategy::Merge)
            .unwrap();
        let second = resolver
            .resolve(&local, &server(), ConflictResolutionStrategy::Merge)
            .unwrap();

        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_merge_with_newer_local_delete_deletes() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);

        let local = EntityRecord::pending("bet", "7", 1, 5_000, Payload::new()).with_deleted(true);
        let resolution = resolver
            .resolve(&local, &server_for("7"), ConflictResolutionStrategy::Merge)
            .unwrap();

        assert!(resolution.record.is_deleted);
        assert_eq!(resolution.resubmit.unwrap().operation, Operation::Delete);
    }

    #[test]
    fn test_merge_with_older_local_delete_keeps_server() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);

        let local = EntityRecord::pending("bet", "7", 1, 100, Payload::new()).with_deleted(true);
        let resolution = resolver
            .resolve(&local, &server_for("7"), ConflictResolutionStrategy::Merge)
            .unwrap();

        assert!(!resolution.record.is_deleted);
        assert!(resolution.resubmit.is_none());
    }

    #[test]
    fn test_resolve_rejects_mismatched_entities() {
        let schemas = registry();
        let resolver = ConflictResolver::new(&schemas);
        let result = resolver.resolve(
            &conflicted_local(),
            &server_for("other"),
            ConflictResolutionStrategy::Merge,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_resolve_unknown_type_is_fatal() {
        let schemas = SchemaRegistry::new();
        let resolver = ConflictResolver::new(&schemas);
        let result = resolver.resolve(
            &conflicted_local(),
            &server(),
            ConflictResolutionStrategy::ClientWins,
        );
        assert!(matches!(result, Err(Error::FatalSync(_))));
    }

    fn server_for(id: &str) -> EntityRecord {
        EntityRecord::synced("bet", id, 4, 2_000, payload(json!({"odds": 1.8})))
    }
}
