//! Stub stage functions for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::fixtures::stub_output;
use crate::errors::StageError;
use crate::stages::StageFunction;
use crate::state::{PipelineState, StageName};

/// A stage that fills its owned fields with canned output.
#[derive(Debug)]
pub struct StubStage {
    stage: StageName,
    latency: Option<Duration>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<PipelineState>>,
}

impl StubStage {
    /// Creates a stub for `stage`.
    #[must_use]
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            latency: None,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Sleeps for `latency` before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the states the stub was invoked with.
    #[must_use]
    pub fn recorded_inputs(&self) -> Vec<PipelineState> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl StageFunction for StubStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn run(&self, state: PipelineState) -> Result<PipelineState, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(state.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(stub_output(self.stage, state))
    }
}

/// A stage that always raises the configured error.
#[derive(Debug)]
pub struct FailingStage {
    stage: StageName,
    error: StageError,
    calls: AtomicUsize,
}

impl FailingStage {
    /// Creates a stage that raises `error`.
    #[must_use]
    pub fn new(stage: StageName, error: StageError) -> Self {
        Self {
            stage,
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageFunction for FailingStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn run(&self, _state: PipelineState) -> Result<PipelineState, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// A stage that reports failure through the state, the way provider-backed
/// stages report expected failures.
#[derive(Debug)]
pub struct SoftFailStage {
    stage: StageName,
    message: String,
    calls: AtomicUsize,
}

impl SoftFailStage {
    /// Creates a stage that records `message` and marks itself failed.
    #[must_use]
    pub fn new(stage: StageName, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageFunction for SoftFailStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn run(&self, state: PipelineState) -> Result<PipelineState, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(state.failed(self.stage, &self.message))
    }
}

/// A stage that raises a transient error a fixed number of times, then
/// behaves like [`StubStage`].
#[derive(Debug)]
pub struct FlakyStage {
    stage: StageName,
    failures: usize,
    calls: AtomicUsize,
    inputs: Mutex<Vec<PipelineState>>,
}

impl FlakyStage {
    /// Creates a stage that fails its first `failures` invocations.
    #[must_use]
    pub fn new(stage: StageName, failures: usize) -> Self {
        Self {
            stage,
            failures,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the states the stage was invoked with.
    #[must_use]
    pub fn recorded_inputs(&self) -> Vec<PipelineState> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl StageFunction for FlakyStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn run(&self, state: PipelineState) -> Result<PipelineState, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(state.clone());
        if call < self.failures {
            return Err(StageError::transient(format!(
                "{} timed out (attempt {})",
                self.stage,
                call + 1
            )));
        }
        Ok(stub_output(self.stage, state))
    }
}
