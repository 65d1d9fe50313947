//! Bounded retries with exponential backoff for stage invocations.
//!
//! Each call to [`RetryExecutor::execute_with_retry`] is a small state
//! machine: attempt 1 runs the stage as given, a retryable failure sleeps
//! `base * multiplier^attempt` and tries again, and the second attempt gets
//! `use_alternative_prompt` set so the stage can fall back to a simpler
//! prompt. Quota and authorization errors are raised at once.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{PatentflowError, StageError};
use crate::events::{EventKind, EventSink, NoOpEventSink, PipelineEvent};
use crate::stages::StageFunction;
use crate::state::PipelineState;

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact backoff delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self {
            Self::None => delay,
            Self::Full => {
                if millis == 0 {
                    delay
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
                }
            }
            Self::Equal => {
                let half = millis / 2;
                if half == 0 {
                    delay
                } else {
                    Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
                }
            }
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay unit in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before the attempt that follows failed attempt `attempt`.
    ///
    /// With the defaults this is 2s after attempt 1, 4s after attempt 2.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        self.jitter.apply(Duration::from_millis(millis.max(0.0) as u64))
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), PatentflowError> {
        if self.max_retries == 0 {
            return Err(PatentflowError::InvalidConfig(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(PatentflowError::InvalidConfig(
                "retry.backoff_multiplier must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Wraps stage invocations with retry and fallback behavior.
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    events: Arc<dyn EventSink>,
    run_id: Uuid,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Creates an executor that reports to no sink.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            events: Arc::new(NoOpEventSink),
            run_id: Uuid::nil(),
        }
    }

    /// Reports `stage.retry_scheduled` events for `run_id` to `events`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>, run_id: Uuid) -> Self {
        self.events = events;
        self.run_id = run_id;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `stage`, retrying transient failures.
    ///
    /// Every call starts from cleared retry hints, and the returned state has
    /// them cleared again, so hints never carry into the next stage.
    ///
    /// Returns the first successful state. Raises a non-retryable error
    /// immediately, and the last error once `max_retries` attempts are spent.
    pub async fn execute_with_retry(
        &self,
        stage: &dyn StageFunction,
        state: PipelineState,
    ) -> Result<PipelineState, StageError> {
        let name = stage.stage();
        let mut attempt: u32 = 1;
        let mut current = state.with_retry_hint(0, false);

        loop {
            let error = match stage.run(current.clone()).await {
                Ok(next) => {
                    if attempt > 1 {
                        tracing::info!(stage = %name, attempt, "Stage succeeded after retry");
                    }
                    return Ok(next.with_retry_hint(0, false));
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                tracing::warn!(
                    stage = %name,
                    attempt,
                    class = %error.class(),
                    error = %error,
                    "Non-retryable stage error"
                );
                return Err(error);
            }

            if attempt >= self.config.max_retries {
                tracing::error!(
                    stage = %name,
                    attempts = attempt,
                    error = %error,
                    "Stage failed after exhausting retries"
                );
                return Err(error);
            }

            let delay = self.config.delay_for_attempt(attempt);
            tracing::debug!(
                stage = %name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying after error"
            );
            self.events
                .emit(
                    PipelineEvent::for_stage(EventKind::StageRetryScheduled, self.run_id, name)
                        .with_data(serde_json::json!({
                            "attempt": attempt,
                            "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "error": error.message(),
                        })),
                )
                .await;
            tokio::time::sleep(delay).await;

            attempt += 1;
            let use_alternative = current.use_alternative_prompt || attempt == 2;
            current = current.with_retry_hint(attempt - 1, use_alternative);
        }
    }

    /// Runs `primary`; on any failure runs `fallback` on the original state.
    ///
    /// When both fail only the fallback's error is returned. The primary's
    /// error is logged and then dropped.
    pub async fn execute_with_fallback(
        &self,
        primary: &dyn StageFunction,
        fallback: &dyn StageFunction,
        state: PipelineState,
    ) -> Result<PipelineState, StageError> {
        match primary.run(state.clone()).await {
            Ok(next) => Ok(next),
            Err(error) => {
                tracing::warn!(
                    stage = %primary.stage(),
                    error = %error,
                    "Primary stage failed, running fallback"
                );
                fallback.run(state).await
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
