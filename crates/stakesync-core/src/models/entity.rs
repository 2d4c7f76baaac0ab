//! Entity record model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Entity payload. `serde_json::Map` is ordered, so serialization is stable.
pub type Payload = Map<String, Value>;

/// Identifies one entity by `(type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// Synchronization state of a local record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Synced,
    Pending,
    Conflicted,
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflicted" => Ok(Self::Conflicted),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown sync status '{other}'"))),
        }
    }
}

/// The competing server side of a conflicted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictData {
    pub version: i64,
    pub last_modified: i64,
    pub data: Payload,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_timestamps: BTreeMap<String, i64>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// The unit of synchronization.
///
/// `conflict` is populated iff `sync_status` is [`SyncStatus::Conflicted`].
/// Both fields are private so the pair can only change together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EntityRecordRepr", into = "EntityRecordRepr")]
pub struct EntityRecord {
    pub id: String,
    pub entity_type: String,
    /// Server-assigned version of the last write this record is based on
    pub version: i64,
    /// Last modification timestamp (Unix ms)
    pub last_modified: i64,
    pub data: Payload,
    /// Per-field modification timestamps (Unix ms), when known
    pub field_timestamps: BTreeMap<String, i64>,
    /// Soft delete flag for sync
    pub is_deleted: bool,
    conflict: Option<ConflictData>,
    sync_status: SyncStatus,
}

impl EntityRecord {
    /// Create a record as the server knows it
    pub fn synced(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        version: i64,
        last_modified: i64,
        data: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            version,
            last_modified,
            data,
            field_timestamps: BTreeMap::new(),
            is_deleted: false,
            conflict: None,
            sync_status: SyncStatus::Synced,
        }
    }

    /// Create a record carrying local changes not yet accepted by the server
    pub fn pending(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        version: i64,
        last_modified: i64,
        data: Payload,
    ) -> Self {
        let mut record = Self::synced(entity_type, id, version, last_modified, data);
        record.sync_status = SyncStatus::Pending;
        record
    }

    #[must_use]
    pub fn with_field_timestamps(mut self, field_timestamps: BTreeMap<String, i64>) -> Self {
        self.field_timestamps = field_timestamps;
        self
    }

    #[must_use]
    pub const fn with_deleted(mut self, is_deleted: bool) -> Self {
        self.is_deleted = is_deleted;
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.id.clone())
    }

    pub const fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    pub const fn conflict(&self) -> Option<&ConflictData> {
        self.conflict.as_ref()
    }

    pub const fn is_conflicted(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Conflicted)
    }

    pub fn mark_synced(&mut self) {
        self.conflict = None;
        self.sync_status = SyncStatus::Synced;
    }

    pub fn mark_pending(&mut self) {
        self.conflict = None;
        self.sync_status = SyncStatus::Pending;
    }

    pub fn mark_failed(&mut self) {
        self.conflict = None;
        self.sync_status = SyncStatus::Failed;
    }

    /// Put this (local) record into conflict with the given server record
    pub fn enter_conflict(&mut self, server: &Self) {
        self.conflict = Some(ConflictData {
            version: server.version,
            last_modified: server.last_modified,
            data: server.data.clone(),
            field_timestamps: server.field_timestamps.clone(),
            is_deleted: server.is_deleted,
        });
        self.sync_status = SyncStatus::Conflicted;
    }

    /// Rebuild the competing server record from the stored conflict data
    pub fn conflict_server_record(&self) -> Option<Self> {
        self.conflict.as_ref().map(|conflict| {
            Self::synced(
                self.entity_type.clone(),
                self.id.clone(),
                conflict.version,
                conflict.last_modified,
                conflict.data.clone(),
            )
            .with_field_timestamps(conflict.field_timestamps.clone())
            .with_deleted(conflict.is_deleted)
        })
    }

    /// Restore persisted status and conflict data, checking they agree
    pub(crate) fn with_state(
        mut self,
        sync_status: SyncStatus,
        conflict: Option<ConflictData>,
    ) -> Result<Self, String> {
        if (sync_status == SyncStatus::Conflicted) != conflict.is_some() {
            return Err(format!(
                "record {}/{} has sync_status '{sync_status}' but conflict data is {}",
                self.entity_type,
                self.id,
                if conflict.is_some() { "set" } else { "missing" }
            ));
        }
        self.sync_status = sync_status;
        self.conflict = conflict;
        Ok(self)
    }

    /// Give every field without its own timestamp the record's current
    /// `last_modified`, so later edits to other fields don't make it look newer
    pub fn pin_field_timestamps(&mut self) {
        for key in self.data.keys() {
            self.field_timestamps
                .entry(key.clone())
                .or_insert(self.last_modified);
        }
    }

    /// Effective modification time of one field, falling back to the record
    pub fn field_modified_at(&self, field: &str) -> i64 {
        self.field_timestamps
            .get(field)
            .copied()
            .unwrap_or(self.last_modified)
    }
}

#[derive(Serialize, Deserialize)]
struct EntityRecordRepr {
    id: String,
    #[serde(rename = "type")]
    entity_type: String,
    version: i64,
    last_modified: i64,
    #[serde(default)]
    data: Payload,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    field_timestamps: BTreeMap<String, i64>,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conflict_data: Option<ConflictData>,
    #[serde(default)]
    sync_status: SyncStatus,
}

impl TryFrom<EntityRecordRepr> for EntityRecord {
    type Error = String;

    fn try_from(repr: EntityRecordRepr) -> Result<Self, Self::Error> {
        Self::synced(
            repr.entity_type,
            repr.id,
            repr.version,
            repr.last_modified,
            repr.data,
        )
        .with_field_timestamps(repr.field_timestamps)
        .with_deleted(repr.is_deleted)
        .with_state(repr.sync_status, repr.conflict_data)
    }
}

impl From<EntityRecord> for EntityRecordRepr {
    fn from(record: EntityRecord) -> Self {
        Self {
            id: record.id,
            entity_type: record.entity_type,
            version: record.version,
            last_modified: record.last_modified,
            data: record.data,
            field_timestamps: record.field_timestamps,
            is_deleted: record.is_deleted,
            conflict_data: record.conflict,
            sync_status: record.sync_status,
        }
    }
}
