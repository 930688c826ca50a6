//! Retry strategy with exponential backoff for failed pushes.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::entity::SyncableEntity;
use crate::handler::{EntitySyncHandler, SyncContext};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per entity.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    ///
    /// Attempt 0 waits `initial_delay`; each later attempt multiplies it,
    /// up to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%, never above the cap
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            (capped_delay * jitter_factor).min(self.max_delay.as_millis() as f64)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Whether the coordinator actually waits between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMode {
    /// Sleep for the backoff delay.
    Real,
    /// Dispatch immediately; used for deterministic tests.
    Skip,
}

/// Outcome of a batch retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    /// Entities whose push was dispatched again.
    pub attempted: usize,
    /// Entities skipped because their retry budget is spent.
    pub exhausted: usize,
    /// Entities whose re-dispatched push succeeded.
    pub recovered: usize,
    /// Entity types whose retry pass could not run.
    pub failed_types: usize,
}

impl RetrySummary {
    pub fn merge(&mut self, other: RetrySummary) {
        self.attempted += other.attempted;
        self.exhausted += other.exhausted;
        self.recovered += other.recovered;
        self.failed_types += other.failed_types;
    }
}

/// Owns backoff and per-entity retry bookkeeping.
pub struct RetryCoordinator {
    config: RetryConfig,
    mode: DelayMode,
}

impl RetryCoordinator {
    /// Create a coordinator. `mode` is fixed for the coordinator's lifetime.
    pub fn new(config: RetryConfig, mode: DelayMode) -> Self {
        Self { config, mode }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn mode(&self) -> DelayMode {
        self.mode
    }

    /// Backoff delay before the next attempt for `entity`.
    pub fn delay_for<E: SyncableEntity>(&self, entity: &E) -> Duration {
        match self.mode {
            DelayMode::Real => self.config.delay_for_attempt(entity.meta().retry_count()),
            DelayMode::Skip => Duration::ZERO,
        }
    }

    /// Retry a failed entity.
    ///
    /// Returns `false` without touching the entity when its retry budget is
    /// spent. Otherwise waits out the backoff, increments the retry count,
    /// moves the entity to `pending` and awaits `action` with that copy.
    /// The return value reports dispatch, not the outcome of `action`.
    pub async fn retry<E, F, Fut>(&self, entity: &mut E, max_retries: u32, action: F) -> bool
    where
        E: SyncableEntity,
        F: FnOnce(E) -> Fut,
        Fut: Future<Output = ()>,
    {
        if entity.meta().retry_count() >= max_retries {
            debug!(
                "Retry exhausted for {} {} after {} attempts",
                E::ENTITY_TYPE,
                entity.id(),
                entity.meta().retry_count()
            );
            return false;
        }

        let delay = self.delay_for(entity);
        if !delay.is_zero() {
            debug!(
                "Retrying {} {} in {:?}",
                E::ENTITY_TYPE,
                entity.id(),
                delay
            );
            sleep(delay).await;
        }

        entity.meta_mut().begin_retry();
        action(entity.clone()).await;
        true
    }

    /// Retry every eligible failed entity, type by type in dependency order.
    ///
    /// Each entity is retried independently; an exhausted or failing entity
    /// never blocks the others.
    pub async fn retry_failed_entities(
        &self,
        handlers: &[Arc<dyn EntitySyncHandler>],
        ctx: &SyncContext<'_>,
    ) -> RetrySummary {
        let mut summary = RetrySummary::default();
        for handler in handlers {
            match handler.retry_failed(ctx).await {
                Ok(partial) => summary.merge(partial),
                Err(e) => {
                    warn!("Retry pass for {} failed: {}", handler.entity_type(), e);
                    summary.failed_types += 1;
                }
            }
        }
        debug!(
            "Retry pass: {} attempted, {} recovered, {} exhausted",
            summary.attempted, summary.recovered, summary.exhausted
        );
        summary
    }
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryConfig::default(), DelayMode::Real)
    }
}
