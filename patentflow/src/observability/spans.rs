//! Span constructors and stage attributes shared by logs and events.

use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

use crate::errors::ErrorClass;
use crate::pipeline::ExecutionPolicy;
use crate::state::{CurrentStep, StageName};

/// Span covering a whole run.
pub fn pipeline_span(run_id: Uuid, policy: ExecutionPolicy) -> Span {
    tracing::info_span!("pipeline", run_id = %run_id, policy = %policy)
}

/// Span covering one stage invocation.
pub fn stage_span(run_id: Uuid, stage: StageName) -> Span {
    tracing::info_span!("stage", run_id = %run_id, stage = %stage)
}

/// A stage span that logs the invocation's outcome inside itself.
#[derive(Debug, Clone)]
pub struct StageSpan {
    span: Span,
    stage: StageName,
}

impl StageSpan {
    /// Opens the span for `stage` in run `run_id`.
    #[must_use]
    pub fn new(run_id: Uuid, stage: StageName) -> Self {
        Self {
            span: stage_span(run_id, stage),
            stage,
        }
    }

    /// Returns the underlying span.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the stage.
    #[must_use]
    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Logs the outcome inside the span.
    pub fn record(&self, attributes: &StageSpanAttributes) {
        let _entered = self.span.enter();
        match &attributes.error {
            None => tracing::info!(
                stage = %self.stage,
                duration_ms = attributes.duration_ms,
                "Stage completed"
            ),
            Some(error) => tracing::warn!(
                stage = %self.stage,
                duration_ms = attributes.duration_ms,
                error = %error,
                "Stage failed"
            ),
        }
    }
}

/// Outcome attributes of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage: StageName,
    /// Step recorded by the stage, if it returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<CurrentStep>,
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// Error message if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error class if the stage raised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl StageSpanAttributes {
    /// Creates attributes for `stage`.
    #[must_use]
    pub fn new(stage: StageName, duration_ms: f64) -> Self {
        Self {
            stage,
            step: None,
            duration_ms,
            error: None,
            error_class: None,
        }
    }

    /// Sets the recorded step.
    #[must_use]
    pub fn with_step(mut self, step: CurrentStep) -> Self {
        self.step = Some(step);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>, class: Option<ErrorClass>) -> Self {
        self.error = Some(error.into());
        self.error_class = class;
        self
    }

    /// Converts to an event payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_attributes_payload() {
        let attrs = StageSpanAttributes::new(StageName::Claims, 12.5)
            .with_step(CurrentStep::Failed(StageName::Claims))
            .with_error("bad json", Some(ErrorClass::Parse));

        let json = attrs.to_json();
        assert_eq!(json["stage"], "claims");
        assert_eq!(json["step"], "claims_failed");
        assert_eq!(json["duration_ms"], 12.5);
        assert_eq!(json["error_class"], "parse");
    }

    #[test]
    fn test_payload_omits_empty_fields() {
        let json = StageSpanAttributes::new(StageName::Search, 1.0).to_json();
        assert!(json.get("error").is_none());
        assert!(json.get("step").is_none());
    }
}
