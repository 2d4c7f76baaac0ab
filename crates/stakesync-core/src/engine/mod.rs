//! Sync orchestrator.
//!
//! A cycle pushes queued writes oldest first, then pulls every registered type
//! and merges what changed. The database lock is never held across a server
//! call, and every local state change a step makes is committed in one
//! savepoint before the next step starts.

mod report;


pub use report::{SyncEvent, SyncIssue, SyncReport, SyncTrigger};

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use rusqlite::Connection;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::db::{
    atomically, Database, EntityStore, FailureOutcome, MutationQueue, SqliteEntityStore,
    SqliteMutationQueue, SqliteVersionStore, VersionStore,
};
use crate::error::{Error, Result, TransportError};
use crate::inventory::ConflictInventory;
use crate::models::{
    ConflictResolutionStrategy, DeadLetter, EntityRecord, EntityRef, Operation, Payload,
    QueuedMutation, ResolutionLogEntry,
};
use crate::resolver::{ConflictResolver, Divergence};
use crate::schema::SchemaRegistry;
use crate::server::{PushOutcome, SyncServer};

const EVENT_CAPACITY: usize = 64;

/// Local state change produced by one step of a cycle
enum Applied {
    Nothing,
    Updated(EntityRecord),
    Conflicted(EntityRecord),
    /// Auto-resolved; the flag is set when this emptied the inventory
    Resolved(EntityRecord, bool),
    Rebased(Vec<QueuedMutation>),
    Retrying(QueuedMutation),
    Failed(QueuedMutation),
}

impl Applied {
    fn record_into(self, report: &mut SyncReport) {
        match self {
            Self::Nothing => {}
            Self::Updated(record) => report.updated.push(record),
            Self::Conflicted(record) => report.conflicted.push(record),
            Self::Resolved(record, _) => report.resolved.push(record),
            Self::Rebased(mutations) => report.rebased.extend(mutations),
            Self::Retrying(mutation) => report.retrying.push(mutation),
            Self::Failed(mutation) => report.failed.push(mutation),
        }
    }
}

/// Clears the in-flight flag when a cycle ends, however it ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Storage failures abort the cycle; anything else is scoped to one entity.
const fn is_local_failure(error: &Error) -> bool {
    matches!(error, Error::Database(_) | Error::Io(_))
}

/// Offline-first sync engine over a local database and a [`SyncServer`]
pub struct SyncEngine<S> {
    db: Mutex<Database>,
    server: S,
    schemas: SchemaRegistry,
    config: SyncConfig,
    in_flight: AtomicBool,
    online: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl<S: SyncServer> SyncEngine<S> {
    pub fn new(db: Database, server: S, schemas: SchemaRegistry, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            db: Mutex::new(db),
            server,
            schemas,
            config,
            in_flight: AtomicBool::new(false),
            online: AtomicBool::new(true),
            events,
        })
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub const fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub const fn server(&self) -> &S {
        &self.server
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    async fn with_db<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.db.lock().await;
        f(db.connection())
    }

    fn queue<'c>(&self, conn: &'c Connection) -> SqliteMutationQueue<'c> {
        SqliteMutationQueue::new(conn, self.config.max_attempts)
    }

    // ------------------------------------------------------------------
    // Local writes and queries
    // ------------------------------------------------------------------

    /// Record a local write and queue it for the server.
    ///
    /// The local record changes immediately: `create` replaces its data,
    /// `update` patches the given fields and `delete` sets the tombstone.
    pub async fn enqueue_local_write(
        &self,
        entity_type: &str,
        id: &str,
        operation: Operation,
        payload: Payload,
    ) -> Result<QueuedMutation> {
        let entity = EntityRef::new(entity_type, id);
        self.with_db(|conn| {
            atomically(conn, |conn| {
                let queue = self.queue(conn);
                let entities = SqliteEntityStore::new(conn);

                let base_version = match queue.pending_for(&entity)?.first() {
                    Some(pending) => pending.base_version,
                    None => SqliteVersionStore::new(conn)
                        .get_base(entity_type, id)?
                        .map_or(0, |base| base.version),
                };

                let mutation =
                    QueuedMutation::new(entity_type, id, operation, payload, base_version);
                if let Err(error) = self.schemas.validate_mutation(&mutation) {
                    tracing::warn!("Rejected local write to {}: {}", entity, error);
                    return Err(error);
                }

                let now = mutation.enqueued_at;
                let mut record = entities.get(&entity)?.unwrap_or_else(|| {
                    EntityRecord::pending(entity_type, id, base_version, now, Payload::new())
                });
                // Fields this write leaves alone keep the age they had
                record.pin_field_timestamps();
                match operation {
                    Operation::Create => {
                        record.data = mutation.payload.clone();
                        record.field_timestamps =
                            mutation.payload.keys().map(|key| (key.clone(), now)).collect();
                        record.is_deleted = false;
                    }
                    Operation::Update => {
                        for (key, value) in &mutation.payload {
                            record.data.insert(key.clone(), value.clone());
                            record.field_timestamps.insert(key.clone(), now);
                        }
                        record.is_deleted = false;
                    }
                    Operation::Delete => record.is_deleted = true,
                }
                record.last_modified = now;
                // A conflicted record keeps its conflict; the edit joins the local side.
                if !record.is_conflicted() {
                    record.mark_pending();
                }

                queue.enqueue(&mutation)?;
                entities.upsert(&record)?;
                tracing::debug!(
                    "Queued {} of {} at base v{}",
                    operation,
                    entity,
                    base_version
                );
                Ok(mutation)
            })
        })
        .await
    }

    pub async fn get_record(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
        self.with_db(|conn| SqliteEntityStore::new(conn).get(&EntityRef::new(entity_type, id)))
            .await
    }

    /// Queued writes, oldest first
    pub async fn pending_mutations(&self, limit: usize) -> Result<Vec<QueuedMutation>> {
        self.with_db(|conn| self.queue(conn).peek_batch(limit)).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.with_db(|conn| self.queue(conn).dead_letters()).await
    }

    /// Conflicted records awaiting a decision
    pub async fn get_conflicts(&self) -> Result<Vec<EntityRecord>> {
        self.with_db(|conn| ConflictInventory::new(conn, &self.schemas).list())
            .await
    }

    /// Resolve one conflict and queue whatever write publishes the result
    pub async fn resolve_conflict(
        &self,
        entity: &EntityRef,
        strategy: ConflictResolutionStrategy,
    ) -> Result<EntityRecord> {
        let outcome = self
            .with_db(|conn| ConflictInventory::new(conn, &self.schemas).resolve(entity, strategy))
            .await?;

        if outcome.inventory_empty {
            // No receivers is fine
            let _ = self.events.send(SyncEvent::ConflictsCleared);
        }
        Ok(outcome.record)
    }

    /// Applied resolutions, newest first
    pub async fn resolution_history(&self, limit: usize) -> Result<Vec<ResolutionLogEntry>> {
        self.with_db(|conn| ConflictInventory::new(conn, &self.schemas).history(limit))
            .await
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Run a cycle now. Returns `None` if one is already in flight.
    pub async fn trigger_sync(&self) -> Result<Option<SyncReport>> {
        self.sync(SyncTrigger::Manual, &CancellationToken::new())
            .await
    }

    /// Record a connectivity change, syncing when connectivity comes back
    pub async fn on_connectivity_changed(&self, online: bool) -> Result<Option<SyncReport>> {
        self.on_connectivity_changed_with(online, &CancellationToken::new())
            .await
    }

    pub(crate) async fn on_connectivity_changed_with(
        &self,
        online: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<SyncReport>> {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            tracing::info!("Connectivity restored; starting sync");
            return self.sync(SyncTrigger::ConnectivityRestored, cancel).await;
        }
        if !online && was_online {
            tracing::info!("Connectivity lost; automatic sync paused");
        }
        Ok(None)
    }

    /// Run a cycle unless one is already in flight.
    ///
    /// Cancelling `cancel` stops the cycle at the next step boundary; the
    /// report then has `cancelled` set.
    pub async fn sync(
        &self,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
    ) -> Result<Option<SyncReport>> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            tracing::info!("Sync already in progress; ignoring {} trigger", trigger);
            return Ok(None);
        };

        tracing::info!("Starting {} sync", trigger);
        let report = self.run_cycle(trigger, cancel).await?;
        tracing::info!("Sync finished: {}", report.summary());

        let _ = self.events.send(SyncEvent::CycleCompleted(report.clone()));
        Ok(Some(report))
    }

    async fn run_cycle(&self, trigger: SyncTrigger, cancel: &CancellationToken) -> Result<SyncReport> {
        let mut report = SyncReport::new(trigger);
        let mut touched = HashSet::new();

        let reachable = self.push_phase(&mut touched, cancel, &mut report).await?;
        if reachable && !report.cancelled {
            self.pull_phase(&touched, cancel, &mut report).await?;
        }
        Ok(report)
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = std::result::Result<T, TransportError>>,
    ) -> std::result::Result<T, TransportError> {
        let timeout = self.config.request_timeout;
        tokio::time::timeout(timeout, request)
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout(
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            })
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    /// Push one batch. Returns `false` if the server could not be reached.
    async fn push_phase(
        &self,
        touched: &mut HashSet<EntityRef>,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let batch = self
            .with_db(|conn| self.queue(conn).peek_batch(self.config.batch_size))
            .await?;
        if batch.is_empty() {
            return Ok(true);
        }
        tracing::debug!("Pushing {} queued mutations", batch.len());

        for queued in batch {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let entity = queued.entity_ref();
            touched.insert(entity.clone());

            // Earlier steps may have rebased, folded or dropped this write.
            let current = self
                .with_db(|conn| {
                    if SqliteEntityStore::new(conn)
                        .get(&entity)?
                        .is_some_and(|record| record.is_conflicted())
                    {
                        return Ok(None);
                    }
                    self.queue(conn).get(&queued.id)
                })
                .await?;
            let Some(mutation) = current else {
                continue;
            };

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                outcome = self.call(self.server.push(&mutation)) => outcome,
            };

            let applied = match outcome {
                Ok(PushOutcome::Accepted { version }) => self.on_accepted(&mutation, version).await,
                Ok(PushOutcome::RejectedStale { record }) => {
                    self.on_stale(&mutation, record, report).await
                }
                Ok(PushOutcome::RejectedInvalid { reason }) => {
                    self.on_invalid(&mutation, &reason).await
                }
                Err(error) => {
                    tracing::warn!("Push of {} failed: {}", mutation.id, error);
                    let applied = self.on_transport_failure(&mutation, &error).await?;
                    applied.record_into(report);
                    return Ok(false);
                }
            };

            match applied {
                Ok(applied) => self.absorb(applied, report),
                Err(error) if is_local_failure(&error) => return Err(error),
                Err(error) => {
                    tracing::error!("Failed to apply push result for {}: {}", entity, error);
                    report.errors.push(SyncIssue::for_entity(&entity, error.to_string()));
                }
            }
        }

        Ok(true)
    }

    async fn on_accepted(&self, mutation: &QueuedMutation, version: i64) -> Result<Applied> {
        let entity = mutation.entity_ref();
        self.with_db(|conn| {
            atomically(conn, |conn| {
                let queue = self.queue(conn);
                let entities = SqliteEntityStore::new(conn);
                let versions = SqliteVersionStore::new(conn);

                queue.acknowledge(&mutation.id)?;
                let remaining = queue.rebase_entity(&entity, version)?;

                let Some(mut record) = entities.get(&entity)? else {
                    versions.commit_base(
                        &entity.entity_type,
                        &entity.id,
                        version,
                        mutation.enqueued_at,
                    )?;
                    return Ok(Applied::Nothing);
                };

                record.version = version;
                if remaining > 0 {
                    entities.upsert(&record)?;
                    tracing::debug!(
                        "{} accepted at v{}; {} more writes queued",
                        entity,
                        version,
                        remaining
                    );
                    return Ok(Applied::Nothing);
                }

                record.mark_synced();
                entities.upsert(&record)?;
                versions.commit_base(
                    &entity.entity_type,
                    &entity.id,
                    version,
                    record.last_modified,
                )?;
                Ok(Applied::Updated(record))
            })
        })
        .await
    }

    async fn on_stale(
        &self,
        mutation: &QueuedMutation,
        server: EntityRecord,
        report: &mut SyncReport,
    ) -> Result<Applied> {
        let entity = mutation.entity_ref();
        if let Err(error) = self.schemas.validate_record(&server) {
            tracing::error!("Cannot reconcile {}: {}", entity, error);
            report.errors.push(SyncIssue::for_entity(&entity, error.to_string()));
            return self.on_invalid(mutation, &error.to_string()).await;
        }

        self.with_db(|conn| {
            atomically(conn, |conn| {
                let base =
                    SqliteVersionStore::new(conn).get_base(&entity.entity_type, &entity.id)?;
                match ConflictResolver::detect(mutation.base_version, &server, base) {
                    Divergence::FastForward => self.fast_forward(conn, &entity, &server),
                    Divergence::Conflict => {
                        let local = SqliteEntityStore::new(conn).get(&entity)?.ok_or_else(|| {
                            Error::NotFound(format!("local record for {entity}"))
                        })?;
                        self.park(conn, local, &server)
                    }
                }
            })
        })
        .await
    }

    async fn on_invalid(&self, mutation: &QueuedMutation, reason: &str) -> Result<Applied> {
        self.with_db(|conn| {
            atomically(conn, |conn| {
                let letter = self.queue(conn).dead_letter(&mutation.id, reason)?;
                mark_record_failed(conn, &mutation.entity_ref())?;
                Ok(Applied::Failed(letter.mutation))
            })
        })
        .await
    }

    async fn on_transport_failure(
        &self,
        mutation: &QueuedMutation,
        error: &TransportError,
    ) -> Result<Applied> {
        self.with_db(|conn| {
            atomically(conn, |conn| {
                match self.queue(conn).mark_failed(&mutation.id, &error.to_string())? {
                    FailureOutcome::Retrying(mutation) => Ok(Applied::Retrying(mutation)),
                    FailureOutcome::DeadLettered(letter) => {
                        mark_record_failed(conn, &mutation.entity_ref())?;
                        Ok(Applied::Failed(letter.mutation))
                    }
                }
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    async fn pull_phase(
        &self,
        touched: &HashSet<EntityRef>,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        let types: Vec<String> = self.schemas.types().map(str::to_string).collect();
        let cursors = self
            .with_db(|conn| {
                let versions = SqliteVersionStore::new(conn);
                types
                    .iter()
                    .map(|entity_type| versions.pull_cursor(entity_type))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;

        let pulls = types.iter().zip(cursors).map(|(entity_type, since)| async move {
            let result = self.call(self.server.pull(entity_type, since)).await;
            (entity_type, since, result)
        });
        let results = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                report.cancelled = true;
                return Ok(());
            }
            results = join_all(pulls) => results,
        };

        for (entity_type, since, result) in results {
            let page = match result {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!("Pull of '{}' failed: {}", entity_type, error);
                    report
                        .errors
                        .push(SyncIssue::for_type(entity_type.as_str(), error.to_string()));
                    continue;
                }
            };

            // The cursor moves only once the whole page is applied. Skipped or
            // failed entities are pulled again next cycle; anything already
            // applied is then ignored by the base version check.
            let mut complete = true;
            for record in page.records {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    complete = false;
                    break;
                }

                let entity = record.entity_ref();
                if record.entity_type != *entity_type {
                    report.errors.push(SyncIssue::for_entity(
                        &entity,
                        format!("returned by pull of '{entity_type}'"),
                    ));
                    continue;
                }
                if touched.contains(&entity) {
                    complete = false;
                    continue;
                }

                match self.apply_incoming(record).await {
                    Ok(applied) => self.absorb(applied, report),
                    Err(error) if is_local_failure(&error) => return Err(error),
                    Err(error) => {
                        tracing::error!("Failed to apply pulled {}: {}", entity, error);
                        report.errors.push(SyncIssue::for_entity(&entity, error.to_string()));
                        complete = false;
                    }
                }
            }

            if complete && page.cursor > since {
                self.with_db(|conn| {
                    SqliteVersionStore::new(conn).advance_pull_cursor(entity_type, page.cursor)
                })
                .await?;
            }
        }

        Ok(())
    }

    async fn apply_incoming(&self, server: EntityRecord) -> Result<Applied> {
        self.schemas.validate_record(&server)?;
        let entity = server.entity_ref();

        self.with_db(|conn| {
            atomically(conn, |conn| {
                let versions = SqliteVersionStore::new(conn);
                let entities = SqliteEntityStore::new(conn);

                let base = versions.get_base(&entity.entity_type, &entity.id)?;
                if base.is_some_and(|base| server.version <= base.version) {
                    return Ok(Applied::Nothing);
                }

                let local = entities.get(&entity)?;
                if let Some(local) = local.filter(EntityRecord::is_conflicted) {
                    ConflictInventory::new(conn, &self.schemas).refresh(local, &server)?;
                    return Ok(Applied::Nothing);
                }

                let pending = self.queue(conn).pending_for(&entity)?;
                let Some(first) = pending.first() else {
                    let mut record = server.clone();
                    record.mark_synced();
                    entities.upsert(&record)?;
                    versions.commit_base(
                        &entity.entity_type,
                        &entity.id,
                        record.version,
                        record.last_modified,
                    )?;
                    return Ok(Applied::Updated(record));
                };

                match ConflictResolver::detect(first.base_version, &server, base) {
                    Divergence::FastForward => self.fast_forward(conn, &entity, &server),
                    Divergence::Conflict => {
                        let local = entities.get(&entity)?.ok_or_else(|| {
                            Error::NotFound(format!("local record for {entity}"))
                        })?;
                        self.park(conn, local, &server)
                    }
                }
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Shared steps
    // ------------------------------------------------------------------

    /// Add a committed step to the report and announce an emptied inventory
    fn absorb(&self, applied: Applied, report: &mut SyncReport) {
        if matches!(applied, Applied::Resolved(_, true)) {
            let _ = self.events.send(SyncEvent::ConflictsCleared);
        }
        applied.record_into(report);
    }

    /// Adopt the server version as base and move queued writes onto it
    fn fast_forward(
        &self,
        conn: &Connection,
        entity: &EntityRef,
        server: &EntityRecord,
    ) -> Result<Applied> {
        let queue = self.queue(conn);
        let entities = SqliteEntityStore::new(conn);

        SqliteVersionStore::new(conn).commit_base(
            &entity.entity_type,
            &entity.id,
            server.version,
            server.last_modified,
        )?;
        queue.rebase_entity(entity, server.version)?;
        if let Some(mut local) = entities.get(entity)? {
            local.version = server.version;
            entities.upsert(&local)?;
        }

        tracing::debug!("Rebased queued writes for {} onto v{}", entity, server.version);
        Ok(Applied::Rebased(queue.pending_for(entity)?))
    }

    /// Move an entity into the inventory, resolving it right away when a
    /// default strategy is configured
    fn park(&self, conn: &Connection, local: EntityRecord, server: &EntityRecord) -> Result<Applied> {
        let inventory = ConflictInventory::new(conn, &self.schemas);
        let parked = inventory.park(local, server)?;

        match self.config.default_strategy {
            Some(strategy) => {
                let outcome = inventory.resolve(&parked.entity_ref(), strategy)?;
                Ok(Applied::Resolved(outcome.record, outcome.inventory_empty))
            }
            None => Ok(Applied::Conflicted(parked)),
        }
    }
}

fn mark_record_failed(conn: &Connection, entity: &EntityRef) -> Result<()> {
    let entities = SqliteEntityStore::new(conn);
    if let Some(mut record) = entities.get(entity)? {
        if !record.is_conflicted() {
            record.mark_failed();
            entities.upsert(&record)?;
        }
    }
    Ok(())
}
