//! The pipeline orchestrator.

use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

use super::instrumented::{reported_failure, InstrumentedStage, RaisingStage};
use super::result::RunInfo;
use super::{ExecutionPolicy, PipelineResult};
use crate::cache::{CacheKey, CacheStats, CacheStore};
use crate::concurrency::{ConcurrencyLimiter, StageMap};
use crate::config::OrchestratorConfig;
use crate::errors::{PatentflowError, StageError};
use crate::events::{EventKind, EventSink, NoOpEventSink, PipelineEvent};
use crate::metrics::{AggregateMetrics, MetricsRecorder};
use crate::observability::pipeline_span;
use crate::retry::RetryExecutor;
use crate::stages::{SharedStage, StageSet};
use crate::state::{CurrentStep, PipelineState, StageName};

/// The two stages that depend only on the abstract.
const ROOTS: [StageName; 2] = [StageName::Search, StageName::Research];

/// The linear tail fed by the roots.
const TAIL: [StageName; 3] = [StageName::Claims, StageName::Document, StageName::Diagram];

/// The five stage functions, resolved once at construction.
struct StageTable {
    search: SharedStage,
    research: SharedStage,
    claims: SharedStage,
    document: SharedStage,
    diagram: SharedStage,
}

impl StageTable {
    fn resolve(set: &StageSet) -> Result<Self, PatentflowError> {
        set.validate()?;
        Ok(Self {
            search: set.get(StageName::Search)?.clone(),
            research: set.get(StageName::Research)?.clone(),
            claims: set.get(StageName::Claims)?.clone(),
            document: set.get(StageName::Document)?.clone(),
            diagram: set.get(StageName::Diagram)?.clone(),
        })
    }

    fn get(&self, stage: StageName) -> &SharedStage {
        match stage {
            StageName::Search => &self.search,
            StageName::Research => &self.research,
            StageName::Claims => &self.claims,
            StageName::Document => &self.document,
            StageName::Diagram => &self.diagram,
        }
    }
}

/// The point at which a run stopped.
struct Halt {
    state: PipelineState,
    stage: StageName,
    error: StageError,
}

type StageRun = Result<PipelineState, Box<Halt>>;

/// How a sequential segment invokes its stages.
#[derive(Clone, Copy)]
enum Invocation<'a> {
    Direct,
    Retried(&'a RetryExecutor),
    Cached,
}

/// Drives the five patent stages under a chosen [`ExecutionPolicy`].
///
/// The cache, metrics recorder and concurrency limiter are shared handles.
/// Hosts that want one of each per process construct them once and pass
/// them to every orchestrator with the `with_*` methods.
pub struct PipelineOrchestrator {
    stages: StageTable,
    config: OrchestratorConfig,
    cache: Arc<CacheStore<PipelineState>>,
    metrics: Arc<MetricsRecorder>,
    limiter: Arc<ConcurrencyLimiter>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("config", &self.config)
            .field("cache_entries", &self.cache.len())
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator with its own cache, recorder and limiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is out of range or the stage
    /// set is incomplete.
    pub fn new(stages: StageSet, config: OrchestratorConfig) -> Result<Self, PatentflowError> {
        config.validate()?;
        let stages = StageTable::resolve(&stages)?;
        Ok(Self {
            stages,
            cache: Arc::new(CacheStore::from_config(&config.cache)),
            metrics: Arc::new(MetricsRecorder::new()),
            limiter: Arc::new(ConcurrencyLimiter::from_config(&config.concurrency)),
            events: Arc::new(NoOpEventSink),
            config,
        })
    }

    /// Uses a shared cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheStore<PipelineState>>) -> Self {
        self.cache = cache;
        self
    }

    /// Uses a shared metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Uses a shared concurrency limiter.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Reports lifecycle events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns the result cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore<PipelineState>> {
        &self.cache
    }

    /// Returns the concurrency limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// Drops every cached state.
    pub fn clear_cache(&self) {
        self.cache.clear();
        tracing::info!("Pipeline cache cleared");
    }

    /// Returns the cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Returns a copy of the current metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> AggregateMetrics {
        self.metrics.snapshot()
    }

    /// Clears all metrics.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Runs the pipeline for `invention_abstract` under the policy named
    /// `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`PatentflowError::InvalidPolicy`] for an unknown name. No
    /// stage is run in that case.
    pub async fn execute_pipeline_named(
        &self,
        invention_abstract: &str,
        policy: &str,
    ) -> Result<PipelineResult, PatentflowError> {
        let policy = policy.parse::<ExecutionPolicy>()?;
        Ok(self.execute_pipeline(invention_abstract, policy).await)
    }

    /// Runs the pipeline under the configured default policy.
    pub async fn execute_default(&self, invention_abstract: &str) -> PipelineResult {
        self.execute_pipeline(invention_abstract, self.config.default_policy)
            .await
    }

    /// Runs the pipeline for `invention_abstract` under `policy`.
    ///
    /// A whole-pipeline cache hit returns the stored state without running
    /// any stage. Stage failures never surface as an `Err`: the result
    /// carries the partial state, the error message and the metrics.
    pub async fn execute_pipeline(
        &self,
        invention_abstract: &str,
        policy: ExecutionPolicy,
    ) -> PipelineResult {
        let run = RunInfo::start(policy);
        let span = pipeline_span(run.run_id, policy);
        self.execute_run(run, invention_abstract)
            .instrument(span)
            .await
    }

    async fn execute_run(&self, run: RunInfo, invention_abstract: &str) -> PipelineResult {
        let workflow_key = CacheKey::workflow(invention_abstract);

        if self.config.cache.enabled {
            if let Some(state) = self.cache.get(&workflow_key) {
                tracing::info!(key = %workflow_key, "Pipeline cache hit");
                self.events
                    .emit(
                        PipelineEvent::new(EventKind::PipelineCacheHit, run.run_id)
                            .with_data(serde_json::json!({ "key": workflow_key.to_string() })),
                    )
                    .await;
                return run.cache_hit(state, self.metrics.snapshot());
            }
        }

        if self.config.reset_metrics_per_run {
            self.metrics.reset();
        }

        tracing::info!(key = %workflow_key, "Pipeline started");
        self.events
            .emit(
                PipelineEvent::new(EventKind::PipelineStarted, run.run_id).with_data(
                    serde_json::json!({
                        "policy": run.policy,
                        "key": workflow_key.to_string(),
                    }),
                ),
            )
            .await;

        let initial = PipelineState::new(invention_abstract);
        let outcome = match run.policy {
            ExecutionPolicy::Sequential => {
                self.run_sequence(&run, &StageName::ALL, initial, Invocation::Direct, false)
                    .await
            }
            ExecutionPolicy::Parallel => self.run_parallel(&run, initial).await,
            ExecutionPolicy::RetryHardened => {
                let executor = RetryExecutor::new(self.config.retry.clone())
                    .with_events(self.events.clone(), run.run_id);
                self.run_sequence(
                    &run,
                    &StageName::ALL,
                    initial,
                    Invocation::Retried(&executor),
                    false,
                )
                .await
            }
            ExecutionPolicy::CachedFirst => {
                self.run_sequence(&run, &StageName::ALL, initial, Invocation::Cached, false)
                    .await
            }
        };

        match outcome {
            Ok(state) => {
                if self.config.cache.enabled {
                    self.cache.set(workflow_key, state.clone());
                }
                let result = run.completed(state, self.metrics.snapshot());
                tracing::info!(duration_ms = result.duration_ms, "Pipeline completed");
                self.events
                    .emit(
                        PipelineEvent::new(EventKind::PipelineCompleted, run.run_id).with_data(
                            serde_json::json!({ "duration_ms": result.duration_ms }),
                        ),
                    )
                    .await;
                result
            }
            Err(halt) => {
                let Halt { state, stage, error } = *halt;
                let message = error.user_message();
                tracing::warn!(
                    stage = %stage,
                    class = %error.class(),
                    error = %message,
                    "Pipeline failed"
                );
                self.events
                    .emit(
                        PipelineEvent::for_stage(EventKind::PipelineFailed, run.run_id, stage)
                            .with_data(serde_json::json!({
                                "error": message,
                                "error_class": error.class(),
                            })),
                    )
                    .await;
                run.failed(state, self.metrics.snapshot(), stage, message, error.class())
            }
        }
    }

    /// Runs `stages` strictly in order, halting on the first failure.
    ///
    /// `pause` requests a pacing delay before the first invoked stage.
    async fn run_sequence(
        &self,
        run: &RunInfo,
        stages: &[StageName],
        mut state: PipelineState,
        invocation: Invocation<'_>,
        mut pause: bool,
    ) -> StageRun {
        let per_stage_cache = matches!(invocation, Invocation::Cached) && self.config.cache.enabled;

        for &stage in stages {
            let key = CacheKey::stage(stage, state.invention_abstract());
            if per_stage_cache {
                if let Some(cached) = self.cache.get(&key) {
                    tracing::debug!(stage = %stage, "Stage cache hit");
                    self.events
                        .emit(PipelineEvent::for_stage(
                            EventKind::StageCacheHit,
                            run.run_id,
                            stage,
                        ))
                        .await;
                    state = state.merge_owned_from(stage, &cached);
                    continue;
                }
            }

            if pause {
                self.pace().await;
            }
            pause = true;

            let stage_fn = self.instrumented(run, stage);
            let outcome = match invocation {
                Invocation::Retried(executor) => {
                    let raising = RaisingStage::new(stage_fn);
                    executor.execute_with_retry(&raising, state.clone()).await
                }
                Invocation::Direct | Invocation::Cached => stage_fn.run(state.clone()).await,
            };
            let retried = matches!(invocation, Invocation::Retried(_));
            state = Self::check_stage(stage, state, outcome, retried)?;

            if per_stage_cache {
                self.cache.set(key, state.clone());
            }
        }

        Ok(state)
    }

    /// Runs the two roots concurrently, merges them, then runs the tail.
    ///
    /// Research runs on the initial state, so it never sees the prior art
    /// search produces in the same run.
    async fn run_parallel(&self, run: &RunInfo, initial: PipelineState) -> StageRun {
        let roots: StageMap = ROOTS
            .iter()
            .map(|&stage| (stage, self.instrumented(run, stage)))
            .collect();
        let mut settled = self.limiter.run_all_settled(&roots, &initial).await;

        let mut merged = initial;
        let mut halt: Option<(StageName, StageError)> = None;
        for stage in ROOTS {
            let outcome = settled.remove(&stage).unwrap_or_else(|| {
                Err(StageError::Internal(format!("{stage} produced no outcome")))
            });
            match outcome {
                Ok(output) => {
                    merged = merged.merge_owned_from(stage, &output);
                    if halt.is_none() {
                        halt = reported_failure(stage, &output).map(|error| (stage, error));
                    }
                }
                Err(error) => {
                    merged = merged.failed(stage, error.message());
                    if halt.is_none() {
                        halt = Some((stage, error));
                    }
                }
            }
        }

        if let Some((stage, error)) = halt {
            return Err(Box::new(Halt {
                state: merged.with_step(CurrentStep::Failed(stage)),
                stage,
                error,
            }));
        }

        let merged = merged.completed(StageName::Research);
        self.run_sequence(run, &TAIL, merged, Invocation::Direct, true)
            .await
    }

    /// Turns one stage outcome into the next state or a halt.
    ///
    /// A raised error under the retry policy leaves the state as it was
    /// before the stage; otherwise it is recorded into the state.
    fn check_stage(
        stage: StageName,
        previous: PipelineState,
        outcome: Result<PipelineState, StageError>,
        retried: bool,
    ) -> StageRun {
        match outcome {
            Ok(next) => match reported_failure(stage, &next) {
                None => Ok(next),
                Some(error) => Err(Box::new(Halt {
                    state: next,
                    stage,
                    error,
                })),
            },
            Err(error) if retried => Err(Box::new(Halt {
                state: previous,
                stage,
                error,
            })),
            Err(error) => Err(Box::new(Halt {
                state: previous.failed(stage, error.message()),
                stage,
                error,
            })),
        }
    }

    fn instrumented(&self, run: &RunInfo, stage: StageName) -> SharedStage {
        Arc::new(InstrumentedStage::new(
            self.stages.get(stage).clone(),
            self.metrics.clone(),
            self.events.clone(),
            run.run_id,
        ))
    }

    async fn pace(&self) {
        let delay = self.config.stage_delay();
        if !delay.is_zero() {
            tracing::debug!(delay_ms = self.config.stage_delay_ms, "Pacing before next stage");
            tokio::time::sleep(delay).await;
        }
    }
}
