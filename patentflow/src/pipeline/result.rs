//! The value returned by a pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::ExecutionPolicy;
use crate::errors::ErrorClass;
use crate::metrics::AggregateMetrics;
use crate::state::{PipelineState, StageName};

/// Outcome of [`execute_pipeline`](super::PipelineOrchestrator::execute_pipeline).
///
/// Metrics are attached to both successful and failed results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Whether every stage completed.
    pub success: bool,
    /// The final state, or the partial state at the point of failure.
    pub state: PipelineState,
    /// Metrics snapshot taken when the run finished.
    pub metrics: AggregateMetrics,
    /// Caller-facing error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifier of this run.
    pub run_id: Uuid,
    /// Policy the run was executed with.
    pub policy: ExecutionPolicy,
    /// Whether the state came from the whole-pipeline cache.
    pub cache_hit: bool,
    /// Stage that stopped the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageName>,
    /// Class of the failure that stopped the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// Elapsed time in milliseconds.
    pub duration_ms: f64,
}

/// Identity and timing of a run in progress.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunInfo {
    pub(crate) run_id: Uuid,
    pub(crate) policy: ExecutionPolicy,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl RunInfo {
    pub(crate) fn start(policy: ExecutionPolicy) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            policy,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn finish(&self, state: PipelineState, metrics: AggregateMetrics) -> PipelineResult {
        PipelineResult {
            success: true,
            state,
            metrics,
            error: None,
            run_id: self.run_id,
            policy: self.policy,
            cache_hit: false,
            failed_stage: None,
            error_class: None,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    pub(crate) fn completed(&self, state: PipelineState, metrics: AggregateMetrics) -> PipelineResult {
        self.finish(state, metrics)
    }

    pub(crate) fn cache_hit(&self, state: PipelineState, metrics: AggregateMetrics) -> PipelineResult {
        PipelineResult {
            cache_hit: true,
            ..self.finish(state, metrics)
        }
    }

    pub(crate) fn failed(
        &self,
        state: PipelineState,
        metrics: AggregateMetrics,
        stage: StageName,
        error: String,
        class: ErrorClass,
    ) -> PipelineResult {
        PipelineResult {
            success: false,
            error: Some(error),
            failed_stage: Some(stage),
            error_class: Some(class),
            ..self.finish(state, metrics)
        }
    }
}

impl PipelineResult {
    /// Returns true if the run stopped on a quota or authorization failure.
    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        self.error_class.is_some_and(ErrorClass::is_terminal)
    }
}
