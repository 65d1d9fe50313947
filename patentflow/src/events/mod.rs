//! Lifecycle events emitted by the orchestrator.
//!
//! Sinks are injected into the orchestrator; there is no process-global
//! sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::state::StageName;

/// The kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A run began (after the cache check missed).
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    /// A run was answered from the whole-pipeline cache.
    #[serde(rename = "pipeline.cache_hit")]
    PipelineCacheHit,
    /// A run finished successfully.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    /// A run stopped on a failure.
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    /// A stage invocation began.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage invocation returned a completed state.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A stage reported or raised a failure.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// The retry executor is about to sleep and try again.
    #[serde(rename = "stage.retry_scheduled")]
    StageRetryScheduled,
    /// A stage was answered from the per-stage cache.
    #[serde(rename = "stage.cache_hit")]
    StageCacheHit,
}

impl EventKind {
    /// Returns the dotted event name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::PipelineCacheHit => "pipeline.cache_hit",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::StageRetryScheduled => "stage.retry_scheduled",
            Self::StageCacheHit => "stage.cache_hit",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// What happened.
    pub kind: EventKind,
    /// The run this event belongs to.
    pub run_id: Uuid,
    /// The stage involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Free-form payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PipelineEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn new(kind: EventKind, run_id: Uuid) -> Self {
        Self {
            kind,
            run_id,
            stage: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    /// Creates a stage-level event.
    #[must_use]
    pub fn for_stage(kind: EventKind, run_id: Uuid, stage: StageName) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(kind, run_id)
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
