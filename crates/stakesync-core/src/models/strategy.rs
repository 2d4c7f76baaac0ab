//! Conflict resolution strategy and resolution log models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::entity::EntityRef;
use crate::error::Error;

/// How a conflicted entity is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionStrategy {
    /// Keep the local data and re-submit it on top of the server version
    ClientWins,
    /// Adopt the server record and drop local queued writes
    ServerWins,
    /// Field-level union, newest write per field wins
    Merge,
}

impl ConflictResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "client_wins" | "local" | "keep_local" => Ok(Self::ClientWins),
            "server_wins" | "server" | "use_server" => Ok(Self::ServerWins),
            "merge" => Ok(Self::Merge),
            other => Err(Error::Validation(format!(
                "unknown resolution strategy '{other}'"
            ))),
        }
    }
}

/// Recorded conflict resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    /// Log row identifier
    pub id: i64,
    pub entity: EntityRef,
    /// Local version at the time of the conflict
    pub local_version: i64,
    /// Competing server version
    pub server_version: i64,
    pub local_last_modified: i64,
    pub server_last_modified: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    pub strategy: ConflictResolutionStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_accepts_ui_labels() {
        assert_eq!(
            "keep-local".parse::<ConflictResolutionStrategy>().unwrap(),
            ConflictResolutionStrategy::ClientWins
        );
        assert_eq!(
            "SERVER_WINS".parse::<ConflictResolutionStrategy>().unwrap(),
            ConflictResolutionStrategy::ServerWins
        );
        assert_eq!(
            "merge".parse::<ConflictResolutionStrategy>().unwrap(),
            ConflictResolutionStrategy::Merge
        );
        assert!("coin_flip".parse::<ConflictResolutionStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serializes_snake_case() {
        let json = serde_json::to_string(&ConflictResolutionStrategy::ClientWins).unwrap();
        assert_eq!(json, "\"client_wins\"");
    }
}
