//! Sync server contract and implementations

mod http;
mod memory;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::models::{EntityRecord, QueuedMutation};

pub use http::HttpSyncServer;
pub use memory::MemorySyncServer;

/// Server verdict on one pushed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushOutcome {
    /// Write applied; the entity now has `version`
    Accepted { version: i64 },
    /// `base_version` is behind; carries the server's current record
    RejectedStale { record: EntityRecord },
    /// The server will never accept this mutation
    RejectedInvalid { reason: String },
}

/// One pull response.
///
/// `cursor` is the server's change position for the pulled type. Versions
/// are numbered per entity, so they cannot order changes across a type; the
/// cursor can, and is passed back as `since` on the next pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullPage {
    #[serde(default)]
    pub records: Vec<EntityRecord>,
    pub cursor: i64,
}

/// Remote side of synchronization.
///
/// Implementations report connectivity problems as [`TransportError`]; every
/// server decision about a mutation is a [`PushOutcome`].
#[allow(async_fn_in_trait)]
pub trait SyncServer {
    /// Submit one mutation tagged with its base version
    async fn push(&self, mutation: &QueuedMutation) -> Result<PushOutcome, TransportError>;

    /// Records of `entity_type` changed after change position `since`
    async fn pull(&self, entity_type: &str, since: i64) -> Result<PullPage, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_outcome_wire_format() {
        let accepted: PushOutcome =
            serde_json::from_value(json!({"status": "accepted", "version": 7})).unwrap();
        assert_eq!(accepted, PushOutcome::Accepted { version: 7 });

        let stale: PushOutcome = serde_json::from_value(json!({
            "status": "rejected_stale",
            "record": {"id": "42", "type": "bet", "version": 4, "last_modified": 10, "data": {"odds": 1.8}}
        }))
        .unwrap();
        let PushOutcome::RejectedStale { record } = stale else {
            panic!("expected stale rejection");
        };
        assert_eq!(record.version, 4);

        let invalid: PushOutcome =
            serde_json::from_value(json!({"status": "rejected_invalid", "reason": "bad odds"}))
                .unwrap();
        assert_eq!(
            invalid,
            PushOutcome::RejectedInvalid {
                reason: "bad odds".to_string()
            }
        );
    }

    #[test]
    fn test_pull_page_wire_format() {
        let page: PullPage = serde_json::from_value(json!({
            "records": [{"id": "a", "type": "bet", "version": 2, "last_modified": 10}],
            "cursor": 17
        }))
        .unwrap();
        assert_eq!(page.cursor, 17);
        assert_eq!(page.records[0].id, "a");

        let empty: PullPage = serde_json::from_value(json!({"cursor": 3})).unwrap();
        assert!(empty.records.is_empty());
    }
}
