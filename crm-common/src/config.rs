//! Configuration types for the CRM sync store

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ChannelKey, SessionScope};

/// Main configuration for the sync store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Managed backend endpoints
    pub backend: BackendConfig,
    /// Session (tenant) scope
    pub session: SessionConfig,
    /// Transport adapter configuration
    pub transport: TransportConfig,
    /// Synchronization engine configuration
    pub engine: EngineConfig,
    /// Lifecycle controller configuration
    pub lifecycle: LifecycleConfig,
}

impl SyncConfig {
    /// Check the configuration for values the store cannot run with
    ///
    /// # Errors
    /// Returns `ConfigError` naming the first invalid field.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.session.workspace_id.trim().is_empty() {
            return Err(Error::ConfigError("session.workspace_id is empty".into()));
        }
        if self.transport.channels.is_empty() {
            return Err(Error::ConfigError("transport.channels is empty".into()));
        }
        if self.transport.max_connect_attempts == 0 {
            return Err(Error::ConfigError(
                "transport.max_connect_attempts must be > 0".into(),
            ));
        }
        if self.transport.event_buffer == 0 {
            return Err(Error::ConfigError("transport.event_buffer must be > 0".into()));
        }
        if self.engine.snapshot_max_attempts == 0 {
            return Err(Error::ConfigError(
                "engine.snapshot_max_attempts must be > 0".into(),
            ));
        }
        if self.engine.malformed_threshold == 0 {
            return Err(Error::ConfigError(
                "engine.malformed_threshold must be > 0".into(),
            ));
        }
        if self.engine.tombstone_capacity == 0 {
            return Err(Error::ConfigError(
                "engine.tombstone_capacity must be > 0".into(),
            ));
        }
        if self.engine.version_column.trim().is_empty() {
            return Err(Error::ConfigError("engine.version_column is empty".into()));
        }
        self.transport.retry.validate("transport.retry")?;
        self.engine.snapshot_retry.validate("engine.snapshot_retry")?;
        Ok(())
    }

    /// Session scope used for snapshot queries and change filters
    #[must_use]
    pub fn scope(&self) -> SessionScope {
        SessionScope {
            workspace_id: self.session.workspace_id.clone(),
            user_id: self.session.user_id.clone(),
        }
    }
}

/// Managed backend (realtime socket + REST) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Realtime endpoint, e.g. `wss://<project>.supabase.co/realtime/v1`
    pub realtime_url: String,
    /// REST endpoint, e.g. `https://<project>.supabase.co/rest/v1`
    pub rest_url: String,
    /// API key sent with every request
    pub api_key: Option<String>,
    /// Database schema the tables live in
    pub schema: String,
    /// Column used to scope rows to the session workspace
    pub scope_column: String,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            realtime_url: "ws://localhost:4000/realtime/v1".to_string(),
            rest_url: "http://localhost:3000/rest/v1".to_string(),
            api_key: None,
            schema: "public".to_string(),
            scope_column: "workspace_id".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub workspace_id: String,
    pub user_id: Option<String>,
}

/// Jitter applied on top of the exponential delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// Exact exponential delay
    None,
    /// Uniform in `[0, delay]`
    Full,
}

/// Exponential backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (0-based), capped
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(64) as i32);
        let ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::ConfigError(format!(
                "{section}.base_delay_ms must be > 0"
            )));
        }
        if self.multiplier < 1.0 {
            return Err(Error::ConfigError(format!(
                "{section}.multiplier must be >= 1.0"
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::ConfigError(format!(
                "{section}.max_delay_ms must be >= base_delay_ms"
            )));
        }
        Ok(())
    }
}

/// Transport adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Channels to subscribe
    pub channels: Vec<ChannelKey>,
    /// Reconnect backoff
    pub retry: RetryPolicy,
    /// Consecutive failed attempts before `TransportDegraded` is raised
    pub max_connect_attempts: u32,
    /// Capacity of the inbound event queue
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channels: ChannelKey::ALL.to_vec(),
            retry: RetryPolicy::default(),
            max_connect_attempts: 8,
            event_buffer: 1024,
        }
    }
}

/// Synchronization engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Row column carrying the per-row server version
    pub version_column: String,
    /// Snapshot fetch backoff
    pub snapshot_retry: RetryPolicy,
    /// Snapshot attempts before the channel is marked desynced
    pub snapshot_max_attempts: u32,
    /// Consecutive malformed events before the channel is marked degraded
    pub malformed_threshold: u32,
    /// Notification coalescing window in milliseconds
    pub batch_window_ms: u64,
    /// Delete tombstones kept per entity table
    pub tombstone_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version_column: "version".to_string(),
            snapshot_retry: RetryPolicy::default(),
            snapshot_max_attempts: 5,
            malformed_threshold: 3,
            batch_window_ms: 16,
            tombstone_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

/// Lifecycle controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Delay between the last consumer leaving and teardown
    pub teardown_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            teardown_grace_ms: 250,
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.session.workspace_id = "ws-1".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.transport.retry.base_delay_ms, 500);
        assert_eq!(config.transport.retry.max_delay_ms, 30_000);
        assert_eq!(config.transport.retry.jitter, Jitter::Full);
        assert_eq!(config.transport.channels.len(), 4);
        assert_eq!(config.engine.version_column, "version");
    }

    #[test]
    fn test_validate_requires_workspace() {
        assert!(SyncConfig::default().validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = valid_config();
        config.engine.snapshot_retry.max_delay_ms = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("engine.snapshot_retry.max_delay_ms"));
    }

    #[test]
    fn test_retry_ceiling_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(0), Duration::from_millis(500));
        assert_eq!(policy.ceiling(1), Duration::from_millis(1_000));
        assert_eq!(policy.ceiling(3), Duration::from_millis(4_000));
        assert_eq!(policy.ceiling(10), Duration::from_millis(30_000));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_config_from_toml() {
        let config: SyncConfig = toml::from_str(
            r#"
            [session]
            workspace_id = "acme"

            [transport]
            channels = ["leads", "conversations"]
            max_connect_attempts = 3

            [engine]
            version_column = "updated_at"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.workspace_id, "acme");
        assert_eq!(
            config.transport.channels,
            vec![ChannelKey::Leads, ChannelKey::Conversations]
        );
        assert_eq!(config.transport.retry.base_delay_ms, 500);
        assert_eq!(config.engine.version_column, "updated_at");
        assert!(config.validate().is_ok());
    }
}
