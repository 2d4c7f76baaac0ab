//! Local mutation queue

use rusqlite::{params, Connection, OptionalExtension};

use super::atomically;
use crate::error::{Error, Result};
use crate::models::{DeadLetter, EntityRef, MutationId, QueuedMutation};

/// Default number of failed attempts tolerated before dead-lettering
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What happened to a mutation after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Still queued, will be retried next cycle
    Retrying(QueuedMutation),
    /// Attempt ceiling exceeded; removed from active retry
    DeadLettered(DeadLetter),
}

/// Trait for durable mutation queue operations.
///
/// Every call persists its change before returning.
pub trait MutationQueue {
    /// Append a mutation. Returns `false` when its id was already acknowledged.
    fn enqueue(&self, mutation: &QueuedMutation) -> Result<bool>;

    /// Up to `limit` oldest live mutations, in enqueue order
    fn peek_batch(&self, limit: usize) -> Result<Vec<QueuedMutation>>;

    /// Get a live mutation by id
    fn get(&self, id: &MutationId) -> Result<Option<QueuedMutation>>;

    /// Remove a mutation the server accepted. Unknown ids are a no-op.
    fn acknowledge(&self, id: &MutationId) -> Result<()>;

    /// Whether the server already accepted this mutation id
    fn is_acknowledged(&self, id: &MutationId) -> Result<bool>;

    /// Record a transient failure
    fn mark_failed(&self, id: &MutationId, reason: &str) -> Result<FailureOutcome>;

    /// Dead-letter a mutation regardless of its attempt count
    fn dead_letter(&self, id: &MutationId, reason: &str) -> Result<DeadLetter>;

    /// All dead-lettered mutations, oldest first
    fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Live mutations for one entity, in enqueue order
    fn pending_for(&self, entity: &EntityRef) -> Result<Vec<QueuedMutation>>;

    /// Re-target every live mutation of an entity onto a new base version
    fn rebase_entity(&self, entity: &EntityRef, base_version: i64) -> Result<usize>;

    /// Drop every live mutation of an entity
    fn discard_entity(&self, entity: &EntityRef) -> Result<Vec<QueuedMutation>>;

    /// Number of live mutations
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// `SQLite` implementation of `MutationQueue`
pub struct SqliteMutationQueue<'a> {
    conn: &'a Connection,
    max_attempts: u32,
}

const MUTATION_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, enqueued_at, \
                                attempt_count, base_version, last_error";

impl<'a> SqliteMutationQueue<'a> {
    /// Create a new queue with the given connection and attempt ceiling
    pub const fn new(conn: &'a Connection, max_attempts: u32) -> Self {
        Self { conn, max_attempts }
    }

    /// Parse a mutation from a database row
    fn parse_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMutation> {
        let id: String = row.get(0)?;
        let operation: String = row.get(3)?;
        let payload: String = row.get(4)?;
        Ok(QueuedMutation {
            id: id.parse().map_err(|error| conversion_error(0, error))?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            operation: operation
                .parse()
                .map_err(|error| conversion_error(3, error))?,
            payload: serde_json::from_str(&payload).map_err(|error| conversion_error(4, error))?,
            enqueued_at: row.get(5)?,
            attempt_count: row.get(6)?,
            base_version: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn parse_dead_letter(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadLetter> {
        let mutation = Self::parse_mutation(row)?;
        Ok(DeadLetter {
            reason: mutation.last_error.clone().unwrap_or_default(),
            dead_lettered_at: row.get(9)?,
            mutation,
        })
    }

    fn require(&self, id: &MutationId) -> Result<QueuedMutation> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("queued mutation {id}")))
    }
}

fn conversion_error(
    column: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}

impl MutationQueue for SqliteMutationQueue<'_> {
    fn enqueue(&self, mutation: &QueuedMutation) -> Result<bool> {
        if self.is_acknowledged(&mutation.id)? {
            tracing::debug!("Ignoring replay of acknowledged mutation {}", mutation.id);
            return Ok(false);
        }

        let payload = serde_json::to_string(&mutation.payload)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO mutations
                (id, entity_type, entity_id, operation, payload, enqueued_at, attempt_count, base_version, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                mutation.id.as_str(),
                mutation.entity_type,
                mutation.entity_id,
                mutation.operation.as_str(),
                payload,
                mutation.enqueued_at,
                mutation.attempt_count,
                mutation.base_version,
                mutation.last_error,
            ],
        )?;

        Ok(inserted > 0)
    }

    fn peek_batch(&self, limit: usize) -> Result<Vec<QueuedMutation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MUTATION_COLUMNS} FROM mutations
             WHERE dead_lettered_at IS NULL
             ORDER BY seq ASC
             LIMIT ?"
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mutations = stmt
            .query_map(params![limit], Self::parse_mutation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(mutations)
    }

    fn get(&self, id: &MutationId) -> Result<Option<QueuedMutation>> {
        let mutation = self
            .conn
            .query_row(
                &format!(
                    "SELECT {MUTATION_COLUMNS} FROM mutations
                     WHERE id = ? AND dead_lettered_at IS NULL"
                ),
                params![id.as_str()],
                Self::parse_mutation,
            )
            .optional()?;
        Ok(mutation)
    }

    fn acknowledge(&self, id: &MutationId) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        atomically(self.conn, |conn| {
            conn.execute(
                "DELETE FROM mutations WHERE id = ?",
                params![id.as_str()],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO acknowledged_mutations (id, acknowledged_at) VALUES (?, ?)",
                params![id.as_str(), now],
            )?;
            Ok(())
        })
    }

    fn is_acknowledged(&self, id: &MutationId) -> Result<bool> {
        let acknowledged: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM acknowledged_mutations WHERE id = ?)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(acknowledged)
    }

    fn mark_failed(&self, id: &MutationId, reason: &str) -> Result<FailureOutcome> {
        let mut mutation = self.require(id)?;
        mutation.attempt_count = mutation.attempt_count.saturating_add(1);
        mutation.last_error = Some(reason.to_string());

        if mutation.attempt_count > self.max_attempts {
            let now = chrono::Utc::now().timestamp_millis();
            self.conn.execute(
                "UPDATE mutations SET attempt_count = ?, last_error = ?, dead_lettered_at = ? WHERE id = ?",
                params![mutation.attempt_count, reason, now, id.as_str()],
            )?;
            tracing::error!(
                "Mutation {} for {} dead-lettered after {} attempts: {}",
                mutation.id,
                mutation.entity_ref(),
                mutation.attempt_count,
                reason
            );
            return Ok(FailureOutcome::DeadLettered(DeadLetter {
                mutation,
                reason: reason.to_string(),
                dead_lettered_at: now,
            }));
        }

        self.conn.execute(
            "UPDATE mutations SET attempt_count = ?, last_error = ? WHERE id = ?",
            params![mutation.attempt_count, reason, id.as_str()],
        )?;
        tracing::warn!(
            "Mutation {} failed (attempt {}/{}): {}",
            mutation.id,
            mutation.attempt_count,
            self.max_attempts,
            reason
        );
        Ok(FailureOutcome::Retrying(mutation))
    }

    fn dead_letter(&self, id: &MutationId, reason: &str) -> Result<DeadLetter> {
        let mut mutation = self.require(id)?;
        mutation.last_error = Some(reason.to_string());
        let now = chrono::Utc::now().timestamp_millis();

        self.conn.execute(
            "UPDATE mutations SET last_error = ?, dead_lettered_at = ? WHERE id = ?",
            params![reason, now, id.as_str()],
        )?;
        tracing::error!(
            "Mutation {} for {} dead-lettered: {}",
            mutation.id,
            mutation.entity_ref(),
            reason
        );

        Ok(DeadLetter {
            mutation,
            reason: reason.to_string(),
            dead_lettered_at: now,
        })
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MUTATION_COLUMNS}, dead_lettered_at FROM mutations
             WHERE dead_lettered_at IS NOT NULL
             ORDER BY dead_lettered_at ASC, seq ASC"
        ))?;

        let letters = stmt
            .query_map([], Self::parse_dead_letter)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(letters)
    }

    fn pending_for(&self, entity: &EntityRef) -> Result<Vec<QueuedMutation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MUTATION_COLUMNS} FROM mutations
             WHERE entity_type = ? AND entity_id = ? AND dead_lettered_at IS NULL
             ORDER BY seq ASC"
        ))?;

        let mutations = stmt
            .query_map(
                params![entity.entity_type, entity.id],
                Self::parse_mutation,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(mutations)
    }

    fn rebase_entity(&self, entity: &EntityRef, base_version: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE mutations SET base_version = ?
             WHERE entity_type = ? AND entity_id = ? AND dead_lettered_at IS NULL",
            params![base_version, entity.entity_type, entity.id],
        )?;
        Ok(rows)
    }

    fn discard_entity(&self, entity: &EntityRef) -> Result<Vec<QueuedMutation>> {
        let discarded = self.pending_for(entity)?;
        self.conn.execute(
            "DELETE FROM mutations
             WHERE entity_type = ? AND entity_id = ? AND dead_lettered_at IS NULL",
            params![entity.entity_type, entity.id],
        )?;
        Ok(discarded)
    }

    fn len(&self) -> Result<usize> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM mutations WHERE dead_lettered_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Operation, Payload};
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn update(entity_id: &str, amount: i64) -> QueuedMutation {
        let payload: Payload = json!({ "amount": amount }).as_object().cloned().unwrap();
        QueuedMutation::new("bet", entity_id, Operation::Update, payload, 1)
    }

    #[test]
    fn test_enqueue_and_peek_preserves_order() {
        let db = setup();
        let queue = SqliteMutationQueue::new(db.connection(), DEFAULT_MAX_ATTEMPTS);

        let first = update("1", 10);
        let second = update("2", 20);
        let third = update("1", 30);
        for mutation in [&first, &second, &third] {
            assert!(queue.enqueue(mutation).unwrap());
        }

        let batch = queue.peek_batch(10).unwrap();
        let ids: Vec<_> = batch.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
        assert_eq!(batch[2].payload["amount"], json!(30));

        let limited = queue.peek_batch(2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_acknowledge_removes_and_blocks_replay() {
        let db = setup();
        let queue = SqliteMutationQueue::new(db.connection(), DEFAULT_MAX_ATTEMPTS);

        let mutation = update("1", 10);
        queue.enqueue(&mutation).unwrap();
        queue.acknowledge(&mutation.id).unwrap();

        assert!(queue.is_empty().unwrap());
        assert!(queue.is_acknowledged(&mutation.id).unwrap());

        // Replaying an acknowledged mutation is a no-op
        assert!(!queue.enqueue(&mutation).unwrap());
        assert!(queue.is_empty().unwrap());

        // Acknowledging twice is harmless
        queue.acknowledge(&mutation.id).unwrap();
    }

    #[test]
    fn test_enqueue_same_id_twice_is_ignored() {
        let db = setup();
        let queue = SqliteMutationQueue::new(db.connection(), DEFAULT_MAX_ATTEMPTS);

        let mutation = update("1", 10);
        assert!(queue.enqueue(&mutation).unwrap());
        assert!(!queue.enqueue(&mutation).unwrap());
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_mark_failed_dead_letters_after_ceiling() {
        let db = setup();
        let queue = SqliteMutationQueue::new(db.connection(), 2);

        let mutation = update("1", 10);
        queue.enqueue(&mutation).unwrap();

        for attempt in 1..=2 {
            match queue.mark_failed(&mutation.id, "offline").unwrap() {
                FailureOutcome::Retrying(retrying) => assert_eq!(retrying.attempt_count, attempt),
                FailureOutcome::DeadLettered(_) => panic!("dead-lettered too early"),
            }
        }

        let outcome = queue.mark_failed(&mutation.id, "still offline").unwrap();
        let FailureOutcome::DeadLettered(letter) = outcome else {
            panic!("expected dead letter");
        };
        assert_eq!(letter.mutation.attempt_count, 3);
        assert_eq!(letter.reason, "still offline");

        assert!(queue.peek_batch(10).unwrap().is_empty());
        assert!(queue.get(&mutation.id).unwrap().is_none());
        let letters = queue.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].mutation.id, mutation.id);
    }

    #[test]
    fn test_mark_failed_unknown_mutation() {
        let db = setup();
        let queue = SqliteMutationQueue::new(db.connection(), DEFAULT_MAX_ATTEMPTS);
        assert!(matches!(
            queue.mark_failed(&MutationId::new(), "x"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rebase_and_discard_entity() {
        let db = setup();
        let queue = SqliteMutationQueue::new(db.connection(), DEFAULT_MAX_ATTEMPTS);

        queue.enqueue(&update("1", 10)).unwrap();
        queue.enqueue(&update("2", 20)).unwrap();
        queue.enqueue(&update("1", 30)).unwrap();

        let entity = EntityRef::new("bet", "1");
        assert_eq!(queue.rebase_entity(&entity, 7).unwrap(), 2);
        assert!(queue
            .pending_for(&entity)
            .unwrap()
            .iter()
            .all(|m| m.base_version == 7));

        let discarded = queue.discard_entity(&entity).unwrap();
        assert_eq!(discarded.len(), 2);
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(queue.peek_batch(10).unwrap()[0].entity_id, "2");
    }
}
