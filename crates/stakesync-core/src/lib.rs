//! stakesync-core - Offline-first sync engine for StakeSync
//!
//! Local writes land in a durable mutation queue and are replayed against the
//! sync server with optimistic concurrency. Divergent edits are parked in a
//! conflict inventory until a resolution strategy is applied.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod models;
pub mod resolver;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod util;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncEvent, SyncIssue, SyncReport, SyncTrigger};
pub use error::{Error, Result, TransportError};
pub use models::{
    ConflictResolutionStrategy, EntityRecord, EntityRef, Operation, Payload, QueuedMutation,
    SyncStatus,
};
pub use schema::SchemaRegistry;
