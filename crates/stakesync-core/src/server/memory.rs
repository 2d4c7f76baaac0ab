//! In-process sync server.
//!
//! Implements the server side of optimistic concurrency over a map of
//! records. Clones share state, so a test can keep a handle and edit
//! "server-side" while an engine owns another.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{PullPage, PushOutcome, SyncServer};
use crate::error::TransportError;
use crate::models::{EntityRecord, EntityRef, MutationId, Operation, QueuedMutation};
use crate::util::now_millis;

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<EntityRef, EntityRecord>,
    /// Change position of each record's latest write
    changed_at: BTreeMap<EntityRef, i64>,
    sequence: i64,
    applied: HashSet<MutationId>,
    rejected: BTreeMap<EntityRef, String>,
    push_log: Vec<QueuedMutation>,
    last_timestamp: i64,
    offline: bool,
    failing_pushes: u32,
    push_delay: Option<Duration>,
}

impl MemoryState {
    fn next_timestamp(&mut self) -> i64 {
        self.last_timestamp = now_millis().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn store(&mut self, record: EntityRecord) {
        self.sequence += 1;
        let entity = record.entity_ref();
        self.changed_at.insert(entity.clone(), self.sequence);
        self.records.insert(entity, record);
    }

    fn apply(&mut self, mutation: &QueuedMutation) -> PushOutcome {
        let entity = mutation.entity_ref();

        if let Some(reason) = self.rejected.get(&entity) {
            return PushOutcome::RejectedInvalid {
                reason: reason.clone(),
            };
        }

        let current = self.records.get(&entity).cloned();
        if self.applied.contains(&mutation.id) {
            // Replayed after a lost acknowledgment
            let version = current.map_or(0, |record| record.version);
            return PushOutcome::Accepted { version };
        }

        let current_version = current.as_ref().map_or(0, |record| record.version);
        if mutation.base_version != current_version {
            return match current {
                Some(record) if mutation.base_version < current_version => {
                    PushOutcome::RejectedStale { record }
                }
                _ => PushOutcome::RejectedInvalid {
                    reason: format!(
                        "base version {} is ahead of server version {current_version}",
                        mutation.base_version
                    ),
                },
            };
        }

        let exists = current.as_ref().is_some_and(|record| !record.is_deleted);
        match mutation.operation {
            Operation::Create if exists => {
                return PushOutcome::RejectedInvalid {
                    reason: format!("{entity} already exists"),
                };
            }
            Operation::Update | Operation::Delete if current.is_none() => {
                return PushOutcome::RejectedInvalid {
                    reason: format!("{entity} does not exist"),
                };
            }
            _ => {}
        }

        let timestamp = self.next_timestamp();
        let version = current_version + 1;
        let mut record = current.unwrap_or_else(|| {
            EntityRecord::synced(
                mutation.entity_type.clone(),
                mutation.entity_id.clone(),
                0,
                timestamp,
                mutation.payload.clone(),
            )
        });

        match mutation.operation {
            Operation::Create => {
                record.data = mutation.payload.clone();
                record.is_deleted = false;
            }
            Operation::Update => {
                for (key, value) in &mutation.payload {
                    record.data.insert(key.clone(), value.clone());
                }
                record.is_deleted = false;
            }
            Operation::Delete => record.is_deleted = true,
        }
        record.version = version;
        record.last_modified = timestamp;

        self.store(record);
        self.applied.insert(mutation.id);
        PushOutcome::Accepted { version }
    }
}

/// Shared-state in-memory [`SyncServer`]
#[derive(Clone, Default)]
pub struct MemorySyncServer {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySyncServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store a record as-is, simulating a write from another client
    pub fn put_record(&self, record: EntityRecord) {
        let mut state = self.lock();
        state.last_timestamp = state.last_timestamp.max(record.last_modified);
        state.store(record);
    }

    pub fn record(&self, entity: &EntityRef) -> Option<EntityRecord> {
        self.lock().records.get(entity).cloned()
    }

    /// Refuse every connection while offline
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next `count` pushes with a network error
    pub fn fail_next_pushes(&self, count: u32) {
        self.lock().failing_pushes = count;
    }

    /// Delay every push, to exercise request timeouts
    pub fn set_push_delay(&self, delay: Option<Duration>) {
        self.lock().push_delay = delay;
    }

    /// Reject every future mutation of an entity as invalid
    pub fn reject_entity(&self, entity: EntityRef, reason: impl Into<String>) {
        self.lock().rejected.insert(entity, reason.into());
    }

    /// Every mutation that reached the server, in arrival order
    pub fn push_log(&self) -> Vec<QueuedMutation> {
        self.lock().push_log.clone()
    }
}

impl SyncServer for MemorySyncServer {
    async fn push(&self, mutation: &QueuedMutation) -> Result<PushOutcome, TransportError> {
        let delay = self.lock().push_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::Network("server unreachable".to_string()));
        }
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(TransportError::Network("connection reset".to_string()));
        }

        state.push_log.push(mutation.clone());
        Ok(state.apply(mutation))
    }

    async fn pull(&self, entity_type: &str, since: i64) -> Result<PullPage, TransportError> {
        let state = self.lock();
        if state.offline {
            return Err(TransportError::Network("server unreachable".to_string()));
        }

        let mut changed: Vec<_> = state
            .changed_at
            .iter()
            .filter(|(entity, position)| entity.entity_type == entity_type && **position > since)
            .map(|(entity, &position)| (position, entity))
            .collect();
        changed.sort_unstable_by_key(|(position, _)| *position);

        let cursor = changed.last().map_or(since, |(position, _)| *position);
        let records = changed
            .into_iter()
            .filter_map(|(_, entity)| state.records.get(entity).cloned())
            .collect();
        Ok(PullPage { records, cursor })
    }
}
