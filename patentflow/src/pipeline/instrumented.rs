//! Stage decorators applied by the orchestrator.
//!
//! Every policy drives the same stage functions. What differs is the
//! wrapping: all invocations are timed and reported through
//! [`InstrumentedStage`], and the retry-hardened policy additionally turns
//! failures reported through the state into raised errors with
//! [`RaisingStage`] so the retry executor can see them.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::errors::StageError;
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::metrics::MetricsRecorder;
use crate::observability::{StageSpan, StageSpanAttributes};
use crate::stages::{SharedStage, StageFunction};
use crate::state::{PipelineState, StageName};

/// Returns the failure a returned state reports for `stage`, if any.
///
/// A quota or authorization marker anywhere in the error log counts, as
/// does a `<stage>_failed` step.
pub(crate) fn reported_failure(stage: StageName, state: &PipelineState) -> Option<StageError> {
    if let Some(marker) = state.terminal_error() {
        return Some(StageError::classify(marker));
    }
    if state.current_step.is_failure_of(stage) {
        let message = state
            .errors()
            .last()
            .cloned()
            .unwrap_or_else(|| format!("{stage} reported failure"));
        return Some(StageError::classify(message));
    }
    None
}

/// Times a stage with the metrics recorder and reports it to the event sink.
pub(crate) struct InstrumentedStage {
    inner: SharedStage,
    metrics: Arc<MetricsRecorder>,
    events: Arc<dyn EventSink>,
    run_id: Uuid,
}

impl InstrumentedStage {
    pub(crate) fn new(
        inner: SharedStage,
        metrics: Arc<MetricsRecorder>,
        events: Arc<dyn EventSink>,
        run_id: Uuid,
    ) -> Self {
        Self {
            inner,
            metrics,
            events,
            run_id,
        }
    }
}

#[async_trait]
impl StageFunction for InstrumentedStage {
    fn stage(&self) -> StageName {
        self.inner.stage()
    }

    async fn run(&self, state: PipelineState) -> Result<PipelineState, StageError> {
        let stage = self.inner.stage();
        let span = StageSpan::new(self.run_id, stage);

        self.events
            .emit(
                PipelineEvent::for_stage(EventKind::StageStarted, self.run_id, stage).with_data(
                    serde_json::json!({
                        "retry_count": state.retry_count,
                        "use_alternative_prompt": state.use_alternative_prompt,
                    }),
                ),
            )
            .await;

        let timer = self.metrics.start_timer(stage);
        let result = self.inner.run(state).instrument(span.span().clone()).await;

        let failure = match &result {
            Ok(next) => reported_failure(stage, next),
            Err(error) => Some(error.clone()),
        };
        let duration_ms = self.metrics.end_timer(timer, failure.is_none());

        let mut attributes = StageSpanAttributes::new(stage, duration_ms);
        if let Ok(next) = &result {
            attributes = attributes.with_step(next.current_step);
        }
        let kind = match &failure {
            None => EventKind::StageCompleted,
            Some(error) => {
                let class = result.is_err().then_some(error.class());
                attributes = attributes.with_error(error.message(), class);
                EventKind::StageFailed
            }
        };
        span.record(&attributes);

        self.events
            .emit(PipelineEvent::for_stage(kind, self.run_id, stage).with_data(attributes.to_json()))
            .await;

        result
    }
}

/// Raises the failure a stage reports through its returned state.
pub(crate) struct RaisingStage {
    inner: SharedStage,
}

impl RaisingStage {
    pub(crate) fn new(inner: SharedStage) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StageFunction for RaisingStage {
    fn stage(&self) -> StageName {
        self.inner.stage()
    }

    async fn run(&self, state: PipelineState) -> Result<PipelineState, StageError> {
        let stage = self.inner.stage();
        let next = self.inner.run(state).await?;
        match reported_failure(stage, &next) {
            Some(error) => Err(error),
            None => Ok(next),
        }
    }
}
