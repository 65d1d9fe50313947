//! The stage-function contract and its adapters.
//!
//! Stage functions are supplied by the LLM integration layer. The
//! orchestrator only knows that a stage takes the full state, suspends while
//! it talks to its provider, and hands back a new state.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use crate::errors::{PatentflowError, StageError};
use crate::state::{PipelineState, StageName};

/// Trait for pipeline stage functions.
///
/// Implementations must set `current_step` to `<name>_completed` or
/// `<name>_failed` on the returned state and append to `errors` on failure.
/// Expected application-level failures are encoded in the state; only
/// unexpected conditions are raised as a [`StageError`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageFunction: Send + Sync {
    /// Returns the stage this function implements.
    fn stage(&self) -> StageName;

    /// Runs the stage.
    ///
    /// # Arguments
    ///
    /// * `state` - The full state as left by the previous stage
    ///
    /// # Returns
    ///
    /// A new state equal to the input except for the fields this stage owns,
    /// `current_step` and possibly `errors`.
    async fn run(&self, state: PipelineState) -> Result<PipelineState, StageError>;
}

/// Shared handle to a stage function.
pub type SharedStage = Arc<dyn StageFunction>;

/// An async closure-backed stage.
///
/// The closure may fail with anything convertible into [`StageError`],
/// including `anyhow::Error`, which is classified on the way through.
pub struct FnStage<F> {
    stage: StageName,
    func: F,
}

impl<F> FnStage<F> {
    /// Creates a new function-based stage.
    pub fn new<Fut, E>(stage: StageName, func: F) -> Self
    where
        F: Fn(PipelineState) -> Fut + Send + Sync,
        Fut: Future<Output = Result<PipelineState, E>> + Send,
        E: Into<StageError>,
    {
        Self { stage, func }
    }
}

impl<F> Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("stage", &self.stage)
            .finish()
    }
}

#[async_trait]
impl<F, Fut, E> StageFunction for FnStage<F>
where
    F: Fn(PipelineState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PipelineState, E>> + Send,
    E: Into<StageError>,
{
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn run(&self, state: PipelineState) -> Result<PipelineState, StageError> {
        (self.func)(state).await.map_err(Into::into)
    }
}

/// The five stage functions a run needs, keyed by stage.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: BTreeMap<StageName, SharedStage>,
}

impl StageSet {
    /// Creates an empty stage set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage under the name it reports.
    #[must_use]
    pub fn with_stage(mut self, stage: SharedStage) -> Self {
        self.stages.insert(stage.stage(), stage);
        self
    }

    /// Registers a stage under an explicit name.
    ///
    /// [`validate`](Self::validate) rejects a function registered under a
    /// name other than its own.
    #[must_use]
    pub fn with_stage_as(mut self, name: StageName, stage: SharedStage) -> Self {
        self.stages.insert(name, stage);
        self
    }

    /// Returns the stage function for `name`.
    pub fn get(&self, name: StageName) -> Result<&SharedStage, PatentflowError> {
        self.stages
            .get(&name)
            .ok_or_else(|| PatentflowError::InvalidStageSet(format!("missing stage '{name}'")))
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stages are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks that all five stages are present and correctly keyed.
    pub fn validate(&self) -> Result<(), PatentflowError> {
        for name in StageName::ALL {
            let stage = self.get(name)?;
            if stage.stage() != name {
                return Err(PatentflowError::InvalidStageSet(format!(
                    "stage '{}' registered as '{name}'",
                    stage.stage()
                )));
            }
        }
        Ok(())
    }
}

impl Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;

    #[tokio::test]
    async fn test_fn_stage_runs_closure() {
        let stage = FnStage::new(StageName::Research, |state: PipelineState| async move {
            Ok::<_, StageError>(
                state
                    .with_novelty_analysis("novel")
                    .completed(StageName::Research),
            )
        });

        assert_eq!(stage.stage(), StageName::Research);
        let out = stage.run(PipelineState::new("x")).await.unwrap();
        assert_eq!(out.novelty_analysis, "novel");
    }

    #[tokio::test]
    async fn test_fn_stage_classifies_anyhow_errors() {
        let stage = FnStage::new(StageName::Search, |_state: PipelineState| async move {
            Err::<PipelineState, _>(anyhow::anyhow!("You exceeded your current quota"))
        });

        let err = stage.run(PipelineState::new("x")).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Quota);
    }

    #[test]
    fn test_stage_set_validation() {
        let mut mock = MockStageFunction::new();
        mock.expect_stage().return_const(StageName::Search);
        let search: SharedStage = Arc::new(mock);

        let set = StageSet::new().with_stage(search.clone());
        assert_eq!(set.len(), 1);
        assert!(matches!(
            set.validate(),
            Err(PatentflowError::InvalidStageSet(_))
        ));

        let misregistered = StageSet::new().with_stage_as(StageName::Claims, search);
        let registered = misregistered.get(StageName::Claims).map(|s| s.stage()).unwrap();
        assert_eq!(registered, StageName::Search);
    }
}
