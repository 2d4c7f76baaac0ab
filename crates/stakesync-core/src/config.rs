//! Sync engine configuration.
//!
//! Retry and scheduling parameters are plain data so clients can load them
//! from their own settings files and hand them to [`crate::SyncEngine`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::DEFAULT_MAX_ATTEMPTS;
use crate::error::{Error, Result};
use crate::models::ConflictResolutionStrategy;

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Tunables for sync cycles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Maximum mutations pushed per cycle
    pub batch_size: usize,
    /// Failed attempts tolerated before a mutation is dead-lettered
    pub max_attempts: u32,
    /// Periodic sync interval; `None` disables the timer (manual sync only)
    #[serde(with = "optional_secs")]
    pub sync_interval: Option<Duration>,
    /// Timeout applied to every server call
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Resolve new conflicts immediately with this strategy instead of
    /// parking them in the inventory
    pub default_strategy: Option<ConflictResolutionStrategy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            sync_interval: Some(Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS)),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            default_strategy: None,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the automatic sync interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disable automatic sync (manual sync only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_default_strategy(mut self, strategy: ConflictResolutionStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.sync_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::Config(
                "sync_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.sync_interval, Some(Duration::from_secs(60)));
        assert!(config.default_strategy.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = SyncConfig::default()
            .with_batch_size(10)
            .with_max_attempts(2)
            .without_auto_sync()
            .with_default_strategy(ConflictResolutionStrategy::Merge);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_attempts, 2);
        assert!(config.sync_interval.is_none());
        assert_eq!(
            config.default_strategy,
            Some(ConflictResolutionStrategy::Merge)
        );
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        assert!(SyncConfig::default().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"batch_size": 5, "request_timeout": 2500, "sync_interval": null, "default_strategy": "server_wins"}"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(2_500));
        assert!(config.sync_interval.is_none());
        assert_eq!(
            config.default_strategy,
            Some(ConflictResolutionStrategy::ServerWins)
        );
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let error = serde_json::from_str::<SyncConfig>(r#"{"retries": 3}"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }
}
