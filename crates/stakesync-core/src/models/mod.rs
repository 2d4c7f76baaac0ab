//! Data models for StakeSync

mod entity;
mod mutation;
mod strategy;

pub use entity::{ConflictData, EntityRecord, EntityRef, Payload, SyncStatus};
pub use mutation::{DeadLetter, MutationId, Operation, QueuedMutation};
pub use strategy::{ConflictResolutionStrategy, ResolutionLogEntry};
