//! Sync cycle results and engine events

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{EntityRecord, EntityRef, QueuedMutation};

/// What started a sync cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    #[default]
    Manual,
    Periodic,
    ConnectivityRestored,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::Periodic => "periodic",
            Self::ConnectivityRestored => "connectivity",
        })
    }
}

/// A per-entity or per-type failure that did not abort the cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub entity_type: String,
    /// `None` when the whole type failed (e.g. its pull request)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub message: String,
}

impl SyncIssue {
    pub fn for_entity(entity: &EntityRef, message: impl Into<String>) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            entity_id: Some(entity.id.clone()),
            message: message.into(),
        }
    }

    pub fn for_type(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: None,
            message: message.into(),
        }
    }
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    /// Records that reached `synced` this cycle
    pub updated: Vec<EntityRecord>,
    /// Entities that newly entered conflict
    pub conflicted: Vec<EntityRecord>,
    /// Conflicts resolved automatically with the configured default strategy
    pub resolved: Vec<EntityRecord>,
    /// Queued writes moved onto a newer base without conflict
    pub rebased: Vec<QueuedMutation>,
    /// Writes that failed transiently and stay queued
    pub retrying: Vec<QueuedMutation>,
    /// Writes dead-lettered this cycle
    pub failed: Vec<QueuedMutation>,
    pub errors: Vec<SyncIssue>,
    /// The cycle stopped early on cancellation
    pub cancelled: bool,
}

impl SyncReport {
    pub(crate) fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }

    /// Nothing needs the user's attention
    pub fn is_clean(&self) -> bool {
        self.conflicted.is_empty()
            && self.failed.is_empty()
            && self.errors.is_empty()
            && !self.cancelled
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} updated, {} conflicted, {} auto-resolved, {} rebased, {} retrying, {} failed",
            self.updated.len(),
            self.conflicted.len(),
            self.resolved.len(),
            self.rebased.len(),
            self.retrying.len(),
            self.failed.len(),
        );
        if !self.errors.is_empty() {
            summary.push_str(&format!(", {} errors", self.errors.len()));
        }
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }
}

/// Notifications broadcast to [`super::SyncEngine::subscribe`] receivers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CycleCompleted(SyncReport),
    /// The last open conflict was resolved
    ConflictsCleared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_mentions_errors_and_cancel() {
        let mut report = SyncReport::new(SyncTrigger::Periodic);
        assert!(report.is_clean());
        assert_eq!(
            report.summary(),
            "0 updated, 0 conflicted, 0 auto-resolved, 0 rebased, 0 retrying, 0 failed"
        );

        report.errors.push(SyncIssue::for_type("bet", "pull failed"));
        report.cancelled = true;
        assert!(!report.is_clean());
        assert!(report.summary().ends_with(", 1 errors (cancelled)"));
    }

    #[test]
    fn test_report_serializes_trigger_snake_case() {
        let report = SyncReport::new(SyncTrigger::ConnectivityRestored);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["trigger"], "connectivity_restored");
    }
}
