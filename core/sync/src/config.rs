//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use fieldsync_common::{Error, Result};

use crate::retry::RetryConfig;

/// Configuration for the sync engine.
///
/// Durations are stored in milliseconds so the JSON form stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed pushes retried automatically before an entity is left for
    /// explicit user recovery.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Cap for exponential growth.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Subtracted from a cursor before each delta fetch.
    pub cursor_safety_buffer_ms: u64,
    /// Deadline for a single remote call.
    pub request_timeout_ms: u64,
    /// Remove local rows the remote no longer has.
    pub reconcile_deletes: bool,
    /// Request a sync after every user edit made through the manager.
    pub sync_on_edit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: false,
            cursor_safety_buffer_ms: 1_000,
            request_timeout_ms: 30_000,
            reconcile_deletes: true,
            sync_on_edit: true,
        }
    }
}

impl SyncConfig {
    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-call deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the cursor safety buffer.
    pub fn with_cursor_safety_buffer(mut self, buffer: Duration) -> Self {
        self.cursor_safety_buffer_ms = buffer.as_millis() as u64;
        self
    }

    /// Enable or disable delete reconciliation.
    pub fn with_reconcile_deletes(mut self, reconcile: bool) -> Self {
        self.reconcile_deletes = reconcile;
        self
    }

    /// Enable or disable sync requests after user edits.
    pub fn with_sync_on_edit(mut self, sync_on_edit: bool) -> Self {
        self.sync_on_edit = sync_on_edit;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cursor_safety_buffer(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.cursor_safety_buffer_ms as i64)
    }

    /// Backoff settings for the retry coordinator.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }

    /// Check values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Configuration(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Configuration(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults if it does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_json(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
