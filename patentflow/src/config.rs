//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::concurrency::ConcurrencyConfig;
use crate::errors::PatentflowError;
use crate::pipeline::ExecutionPolicy;
use crate::retry::RetryConfig;

/// Configuration for a [`PipelineOrchestrator`](crate::pipeline::PipelineOrchestrator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Retry settings for the retry-hardened policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Concurrency bound for the parallel policy.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Pause between sequential stages, in milliseconds.
    #[serde(default = "default_stage_delay_ms")]
    pub stage_delay_ms: u64,
    /// Whether metrics are cleared at the start of every executed run.
    #[serde(default = "default_reset_metrics")]
    pub reset_metrics_per_run: bool,
    /// Policy used by [`execute_default`](crate::pipeline::PipelineOrchestrator::execute_default).
    #[serde(default)]
    pub default_policy: ExecutionPolicy,
}

fn default_stage_delay_ms() -> u64 {
    1000
}

fn default_reset_metrics() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            stage_delay_ms: default_stage_delay_ms(),
            reset_metrics_per_run: default_reset_metrics(),
            default_policy: ExecutionPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self, PatentflowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the cache settings.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the retry settings.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the concurrency settings.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the pause between sequential stages.
    #[must_use]
    pub fn with_stage_delay_ms(mut self, delay: u64) -> Self {
        self.stage_delay_ms = delay;
        self
    }

    /// Sets whether metrics are cleared per run.
    #[must_use]
    pub fn with_reset_metrics_per_run(mut self, reset: bool) -> Self {
        self.reset_metrics_per_run = reset;
        self
    }

    /// Sets the default policy.
    #[must_use]
    pub fn with_default_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Returns the pause between sequential stages.
    #[must_use]
    pub fn stage_delay(&self) -> Duration {
        Duration::from_millis(self.stage_delay_ms)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range value found.
    pub fn validate(&self) -> Result<(), PatentflowError> {
        self.cache.validate()?;
        self.retry.validate()?;
        self.concurrency.validate()?;
        Ok(())
    }
}
