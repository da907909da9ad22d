//! Sync layer configuration.
//!
//! Timings observed in the chat UI are the defaults. Every value can be
//! overridden from JSON (all fields optional) or from CLI flags.

use std::time::Duration;

use serde::Deserialize;

use crate::SyncError;

const DEFAULT_QUIET_PERIOD_MS: u64 = 2_000;
const DEFAULT_AVATAR_TTL_SECS: u64 = 30 * 60;
const DEFAULT_BRANCH_TTL_SECS: u64 = 5 * 60;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_STALE_SECS: u64 = 60;
const DEFAULT_UNDO_WINDOW_SECS: u64 = 10;
const DEFAULT_CHANGE_BUFFER: usize = 1024;

/// Configuration for every component of the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period (ms) before a debounced list refresh fires.
    pub quiet_period_ms: u64,
    /// Messenger avatar cache TTL (seconds).
    pub avatar_ttl_secs: u64,
    /// Branch lookup cache TTL (seconds).
    pub branch_ttl_secs: u64,
    /// Presence heartbeat interval (seconds).
    pub heartbeat_secs: u64,
    /// Presence staleness threshold (seconds).
    pub stale_secs: u64,
    /// Bulk action undo window (seconds).
    pub undo_window_secs: u64,
    /// Buffer size of each per-table change stream.
    pub change_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: DEFAULT_QUIET_PERIOD_MS,
            avatar_ttl_secs: DEFAULT_AVATAR_TTL_SECS,
            branch_ttl_secs: DEFAULT_BRANCH_TTL_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            stale_secs: DEFAULT_STALE_SECS,
            undo_window_secs: DEFAULT_UNDO_WINDOW_SECS,
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Parse a (possibly partial) JSON config and validate it.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component misbehave.
    ///
    /// The staleness threshold must leave room for at least one missed
    /// heartbeat, otherwise peers flicker offline between beats.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.quiet_period_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "quiet_period_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "heartbeat_secs must be positive".to_string(),
            ));
        }
        if self.stale_secs <= self.heartbeat_secs {
            return Err(SyncError::InvalidConfig(format!(
                "stale_secs ({}) must exceed heartbeat_secs ({})",
                self.stale_secs, self.heartbeat_secs
            )));
        }
        if self.change_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "change_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn avatar_ttl(&self) -> Duration {
        Duration::from_secs(self.avatar_ttl_secs)
    }

    pub fn branch_ttl(&self) -> Duration {
        Duration::from_secs(self.branch_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    pub fn undo_window(&self) -> Duration {
        Duration::from_secs(self.undo_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = SyncConfig::default();
        assert_eq!(config.quiet_period(), Duration::from_secs(2));
        assert_eq!(config.avatar_ttl(), Duration::from_secs(1800));
        assert_eq!(config.branch_ttl(), Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.stale_threshold(), Duration::from_secs(60));
        assert_eq!(config.undo_window(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{"quiet_period_ms": 500}"#).unwrap();
        assert_eq!(config.quiet_period_ms, 500);
        assert_eq!(config.heartbeat_secs, DEFAULT_HEARTBEAT_SECS);
    }

    #[test]
    fn stale_must_exceed_heartbeat() {
        let config = SyncConfig {
            heartbeat_secs: 30,
            stale_secs: 30,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_quiet_period_rejected() {
        let result = SyncConfig::from_json(r#"{"quiet_period_ms": 0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn malformed_json_is_json_error() {
        let result = SyncConfig::from_json("{not json");
        assert!(matches!(result, Err(SyncError::Json(_))));
    }
}
