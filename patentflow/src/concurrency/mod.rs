//! Bounded concurrent stage execution.
//!
//! Built on a tokio [`Semaphore`], which queues waiters first-come,
//! first-served and wakes exactly one waiter per released permit.
//! Invocations are polled cooperatively on the caller's task; nothing is
//! spawned and nothing is cancelled once dispatched.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::errors::{PatentflowError, StageError};
use crate::stages::{SharedStage, StageFunction};
use crate::state::{PipelineState, StageName};

/// Concurrency bound configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum stage invocations in flight.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    3
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl ConcurrencyConfig {
    /// Sets the bound.
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), PatentflowError> {
        if self.max_concurrent == 0 {
            return Err(PatentflowError::InvalidConfig(
                "concurrency.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stage functions keyed by the stage they run as.
pub type StageMap = BTreeMap<StageName, SharedStage>;

/// Per-stage outcomes of [`ConcurrencyLimiter::run_all_settled`].
pub type SettledResults = BTreeMap<StageName, Result<PipelineState, StageError>>;

/// Limits how many stage invocations run at once.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the in-flight counter when an invocation ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting `max_concurrent` invocations.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Creates a limiter from configuration.
    #[must_use]
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(config.max_concurrent)
    }

    /// Returns the bound.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Returns the number of invocations currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the highest in-flight count observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Returns the number of free slots.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Runs one stage once a slot is free.
    pub async fn run_bounded(
        &self,
        stage: &dyn StageFunction,
        state: PipelineState,
    ) -> Result<PipelineState, StageError> {
        let name = stage.stage();
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| StageError::Internal("concurrency limiter closed".to_string()))?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);
        tracing::debug!(stage = %name, in_flight = now, "Acquired concurrency slot");

        stage.run(state).await
    }

    /// Runs every stage concurrently under the bound and waits for all.
    ///
    /// A failure does not cancel the others. Each outcome is reported under
    /// the name the stage was given in `stages`.
    pub async fn run_all_settled(&self, stages: &StageMap, state: &PipelineState) -> SettledResults {
        let runs = stages.iter().map(|(&name, stage)| {
            let state = state.clone();
            async move { (name, self.run_bounded(stage.as_ref(), state).await) }
        });
        join_all(runs).await.into_iter().collect()
    }

    /// Runs every stage concurrently and fails only after all have finished.
    ///
    /// On failure the error of the first failing stage, in stage order, is
    /// returned.
    pub async fn run_all(
        &self,
        stages: &StageMap,
        state: &PipelineState,
    ) -> Result<BTreeMap<StageName, PipelineState>, StageError> {
        let mut outputs = BTreeMap::new();
        for (name, outcome) in self.run_all_settled(stages, state).await {
            outputs.insert(name, outcome?);
        }
        Ok(outputs)
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::from_config(&ConcurrencyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::FnStage;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// A stage that sleeps and records how many copies run at once.
    fn tracked_stage(
        name: StageName,
        active: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<StageName>>>,
    ) -> SharedStage {
        Arc::new(FnStage::new(name, move |state: PipelineState| {
            let active = active.clone();
            let max_seen = max_seen.clone();
            let order = order.clone();
            async move {
                order.lock().push(name);
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, StageError>(state.completed(name))
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_bounded_caps_in_flight() {
        let limiter = ConcurrencyLimiter::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let stage = tracked_stage(StageName::Search, active, max_seen.clone(), order.clone());

        let runs = (0..8).map(|_| limiter.run_bounded(stage.as_ref(), PipelineState::new("x")));
        let results = join_all(runs).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(order.lock().len(), 8);
        assert_eq!(max_seen.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.peak_in_flight(), 3);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<SharedStage> = StageName::ALL
            .into_iter()
            .map(|name| tracked_stage(name, active.clone(), max_seen.clone(), order.clone()))
            .collect();

        let runs = stages
            .iter()
            .map(|stage| limiter.run_bounded(stage.as_ref(), PipelineState::new("x")));
        join_all(runs).await;

        assert_eq!(*order.lock(), StageName::ALL.to_vec());
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_waits_for_every_stage_before_failing() {
        let limiter = ConcurrencyLimiter::new(3);
        let finished = Arc::new(AtomicUsize::new(0));

        let failing: SharedStage = Arc::new(FnStage::new(StageName::Search, |_state: PipelineState| async {
            Err::<PipelineState, _>(StageError::transient("search down"))
        }));
        let slow_finished = finished.clone();
        let slow: SharedStage = Arc::new(FnStage::new(StageName::Research, move |state: PipelineState| {
            let finished = slow_finished.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StageError>(state.completed(StageName::Research))
            }
        }));

        let stages: StageMap = [(StageName::Search, failing), (StageName::Research, slow)]
            .into_iter()
            .collect();

        let err = limiter
            .run_all(&stages, &PipelineState::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err, StageError::transient("search down"));
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let settled = limiter.run_all_settled(&stages, &PipelineState::new("x")).await;
        assert!(settled[&StageName::Search].is_err());
        assert!(settled[&StageName::Research].is_ok());
    }

    #[tokio::test]
    async fn test_run_all_collects_outputs_by_stage() {
        let limiter = ConcurrencyLimiter::default();
        let stages: StageMap = [StageName::Search, StageName::Research]
            .into_iter()
            .map(|name| {
                let stage: SharedStage = Arc::new(FnStage::new(name, move |state: PipelineState| async move {
                    Ok::<_, StageError>(state.completed(name))
                }));
                (name, stage)
            })
            .collect();

        let outputs = limiter.run_all(&stages, &PipelineState::new("x")).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            outputs[&StageName::Research].current_step,
            crate::state::CurrentStep::Completed(StageName::Research)
        );
    }

    #[tokio::test]
    async fn test_each_entry_runs_once_per_key() {
        let limiter = ConcurrencyLimiter::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let failing: SharedStage = Arc::new(FnStage::new(StageName::Claims, move |_state: PipelineState| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err::<PipelineState, _>(StageError::transient("claims down"))
            }
        }));
        let stages: StageMap = [
            (StageName::Claims, failing.clone()),
            (StageName::Document, failing),
        ]
        .into_iter()
        .collect();

        let settled = limiter.run_all_settled(&stages, &PipelineState::new("x")).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(settled.len(), 2);
        assert!(settled[&StageName::Claims].is_err());
        assert!(settled[&StageName::Document].is_err());
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(ConcurrencyConfig::default().max_concurrent, 3);
        assert!(ConcurrencyConfig::default().with_max_concurrent(0).validate().is_err());
    }
}
