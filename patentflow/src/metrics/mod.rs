//! Per-stage and aggregate execution statistics.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;

use crate::state::StageName;

/// Statistics for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Number of finished timers.
    pub executions: u64,
    /// Sum of elapsed times in milliseconds.
    pub total_time_ms: f64,
    /// `total_time_ms / executions`.
    pub average_time_ms: f64,
    /// Timers ended with success.
    pub success_count: u64,
    /// Timers ended with failure.
    pub failure_count: u64,
}

/// Statistics for every stage plus global totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Per-stage statistics.
    pub stages: BTreeMap<StageName, StageMetrics>,
    /// Sum of all elapsed times in milliseconds.
    pub total_execution_time_ms: f64,
    /// Timers ended with success.
    pub successful_executions: u64,
    /// Timers ended with failure.
    pub failed_executions: u64,
    /// `total_execution_time_ms / (successful + failed)`, or 0 with no data.
    pub average_response_time_ms: f64,
}

impl AggregateMetrics {
    /// Returns the number of finished timers.
    #[must_use]
    pub fn total_executions(&self) -> u64 {
        self.successful_executions + self.failed_executions
    }

    /// Returns the statistics for `stage`, if it ever ran.
    #[must_use]
    pub fn stage(&self, stage: StageName) -> Option<&StageMetrics> {
        self.stages.get(&stage)
    }
}

/// A running timer returned by [`MetricsRecorder::start_timer`].
#[derive(Debug)]
#[must_use = "a timer records nothing until it is ended"]
pub struct TimerHandle {
    stage: StageName,
    started: Instant,
}

impl TimerHandle {
    /// Returns the stage being timed.
    pub fn stage(&self) -> StageName {
        self.stage
    }
}

/// Thread-safe metrics accumulator.
///
/// One lock covers both the per-stage entry and the totals, so concurrent
/// `end_timer` calls never interleave their average updates.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: Mutex<AggregateMetrics>,
}

impl MetricsRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing `stage`.
    pub fn start_timer(&self, stage: StageName) -> TimerHandle {
        TimerHandle {
            stage,
            started: Instant::now(),
        }
    }

    /// Stops `handle` and records the outcome. Returns the elapsed time in ms.
    pub fn end_timer(&self, handle: TimerHandle, success: bool) -> f64 {
        let elapsed_ms = handle.started.elapsed().as_secs_f64() * 1000.0;
        self.record(handle.stage, elapsed_ms, success);
        elapsed_ms
    }

    /// Records a measurement taken elsewhere.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&self, stage: StageName, elapsed_ms: f64, success: bool) {
        let mut metrics = self.inner.lock();

        let entry = metrics.stages.entry(stage).or_default();
        entry.executions += 1;
        entry.total_time_ms += elapsed_ms;
        entry.average_time_ms = entry.total_time_ms / entry.executions as f64;
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }

        metrics.total_execution_time_ms += elapsed_ms;
        if success {
            metrics.successful_executions += 1;
        } else {
            metrics.failed_executions += 1;
        }
        let finished = metrics.total_executions();
        metrics.average_response_time_ms = if finished == 0 {
            0.0
        } else {
            metrics.total_execution_time_ms / finished as f64
        };

        tracing::trace!(stage = %stage, elapsed_ms, success, "Recorded stage timing");
    }

    /// Returns a copy of the current statistics.
    #[must_use]
    pub fn snapshot(&self) -> AggregateMetrics {
        self.inner.lock().clone()
    }

    /// Discards all history.
    pub fn reset(&self) {
        *self.inner.lock() = AggregateMetrics::default();
    }
}
