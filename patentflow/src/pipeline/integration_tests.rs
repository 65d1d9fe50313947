//! End-to-end runs of the orchestrator against stub stages.

#[cfg(test)]
mod tests {
    use crate::cache::{CacheConfig, CacheKey};
    use crate::config::OrchestratorConfig;
    use crate::errors::{ErrorClass, StageError, BILLING_SUGGESTION};
    use crate::events::{CollectingEventSink, EventKind};
    use crate::pipeline::{ExecutionPolicy, PipelineOrchestrator};
    use crate::retry::RetryConfig;
    use crate::stages::FnStage;
    use crate::state::{CurrentStep, PipelineState, StageName};
    use crate::testing::{
        fast_config, stub_output, FailingStage, FlakyStage, SoftFailStage, StubPipeline,
        StubStage, WIDGET_ABSTRACT,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn orchestrator(stubs: &StubPipeline) -> PipelineOrchestrator {
        orchestrator_with(stubs, fast_config())
    }

    fn orchestrator_with(stubs: &StubPipeline, config: OrchestratorConfig) -> PipelineOrchestrator {
        PipelineOrchestrator::new(stubs.stage_set(), config).unwrap()
    }

    #[tokio::test]
    async fn test_sequential_end_to_end() {
        let stubs = StubPipeline::new();
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = orchestrator(&stubs).with_events(events.clone());

        let result = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;

        assert!(result.success);
        assert!(!result.cache_hit);
        assert_eq!(result.error, None);
        assert_eq!(result.state.prior_art.len(), 3);
        assert_eq!(result.state.claims.len(), 2);
        assert!(!result.state.patent_draft.is_empty());
        assert_eq!(result.state.current_step, CurrentStep::Completed(StageName::Diagram));
        assert!(result.state.errors().is_empty());
        assert_eq!(
            serde_json::to_value(&result.state).unwrap()["currentStep"],
            "diagram_completed"
        );

        assert_eq!(result.metrics.total_executions(), 5);
        assert_eq!(result.metrics.successful_executions, 5);
        for stage in StageName::ALL {
            assert_eq!(stubs.call_count(stage), 1);
        }

        let kinds = events.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::PipelineStarted));
        assert_eq!(kinds.last(), Some(&EventKind::PipelineCompleted));
        assert_eq!(events.events_of_kind(EventKind::StageCompleted).len(), 5);
        assert!(events.events().iter().all(|e| e.run_id == result.run_id));
    }

    #[tokio::test]
    async fn test_sequential_stages_see_upstream_output() {
        let stubs = StubPipeline::new();
        orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;

        let research_input = &stubs.stub(StageName::Research).recorded_inputs()[0];
        assert_eq!(research_input.prior_art.len(), 3);
        let document_input = &stubs.stub(StageName::Document).recorded_inputs()[0];
        assert_eq!(document_input.claims.len(), 2);
    }

    #[tokio::test]
    async fn test_sequential_short_circuits_on_failed_step() {
        let search = Arc::new(SoftFailStage::new(StageName::Search, "no results from provider"));
        let stubs = StubPipeline::new().with_override(StageName::Search, search.clone());

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;

        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(StageName::Search));
        assert_eq!(result.state.current_step, CurrentStep::Failed(StageName::Search));
        assert_eq!(result.state.errors(), ["search: no results from provider"]);
        assert!(result.state.novelty_analysis.is_empty());
        assert!(result.state.claims.is_empty());
        assert_eq!(search.call_count(), 1);
        for stage in [StageName::Research, StageName::Claims, StageName::Document, StageName::Diagram] {
            assert_eq!(stubs.call_count(stage), 0);
        }
        assert_eq!(result.metrics.failed_executions, 1);
    }

    #[tokio::test]
    async fn test_sequential_records_raised_error() {
        let claims = Arc::new(FailingStage::new(
            StageName::Claims,
            StageError::transient("connection reset by peer"),
        ));
        let stubs = StubPipeline::new().with_override(StageName::Claims, claims.clone());

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;

        assert!(!result.success);
        assert_eq!(result.error_class, Some(ErrorClass::Transient));
        assert_eq!(result.error.as_deref(), Some("connection reset by peer"));
        assert_eq!(result.state.current_step, CurrentStep::Failed(StageName::Claims));
        assert_eq!(result.state.errors(), ["claims: connection reset by peer"]);
        assert_eq!(result.state.prior_art.len(), 3);
        assert!(!result.state.novelty_analysis.is_empty());
        assert_eq!(claims.call_count(), 1);
        assert_eq!(stubs.call_count(StageName::Document), 0);
    }

    #[tokio::test]
    async fn test_quota_marker_stops_run() {
        let research = FnStage::new(StageName::Research, |state: PipelineState| async move {
            Ok::<_, StageError>(
                stub_output(StageName::Research, state)
                    .with_error("research: 429 You exceeded your current quota"),
            )
        });
        let stubs = StubPipeline::new().with_override(StageName::Research, Arc::new(research));

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;

        assert!(!result.success);
        assert!(result.is_terminal_failure());
        assert_eq!(result.failed_stage, Some(StageName::Research));
        let error = result.error.unwrap();
        assert!(error.contains("exceeded your current quota"));
        assert!(error.contains(BILLING_SUGGESTION));
        assert_eq!(stubs.call_count(StageName::Claims), 0);
    }

    #[tokio::test]
    async fn test_whole_pipeline_cache_hit() {
        let stubs = StubPipeline::new();
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = orchestrator(&stubs).with_events(events.clone());

        let first = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;
        events.clear();
        let second = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;

        assert!(second.success);
        assert!(second.cache_hit);
        assert_eq!(second.state, first.state);
        assert_eq!(second.metrics, first.metrics);
        assert_eq!(orchestrator.metrics_snapshot(), first.metrics);
        for stage in StageName::ALL {
            assert_eq!(stubs.call_count(stage), 1);
        }
        assert_eq!(events.kinds(), vec![EventKind::PipelineCacheHit]);
        assert_eq!(orchestrator.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_ignores_policy() {
        let stubs = StubPipeline::new();
        let orchestrator = orchestrator(&stubs);

        orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;
        let second = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Parallel)
            .await;

        assert!(second.cache_hit);
        assert_eq!(second.policy, ExecutionPolicy::Parallel);
        assert_eq!(stubs.call_count(StageName::Search), 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_reruns_stages() {
        let stubs = StubPipeline::new();
        let config = fast_config().with_cache(CacheConfig::new().disabled());
        let orchestrator = orchestrator_with(&stubs, config);

        for _ in 0..2 {
            let result = orchestrator
                .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
                .await;
            assert!(!result.cache_hit);
        }

        assert_eq!(stubs.call_count(StageName::Diagram), 2);
        assert!(orchestrator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_is_not_cached() {
        let search = Arc::new(SoftFailStage::new(StageName::Search, "provider unavailable"));
        let stubs = StubPipeline::new().with_override(StageName::Search, search.clone());
        let orchestrator = orchestrator(&stubs);

        for _ in 0..2 {
            orchestrator
                .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
                .await;
        }

        assert_eq!(search.call_count(), 2);
        assert!(!orchestrator.cache().contains(&CacheKey::workflow(WIDGET_ABSTRACT)));
    }

    #[tokio::test]
    async fn test_metrics_reset_per_run() {
        let stubs = StubPipeline::new();
        let orchestrator = orchestrator(&stubs);

        orchestrator
            .execute_pipeline("first abstract", ExecutionPolicy::Sequential)
            .await;
        let second = orchestrator
            .execute_pipeline("second abstract", ExecutionPolicy::Sequential)
            .await;

        assert_eq!(second.metrics.total_executions(), 5);
    }

    #[tokio::test]
    async fn test_metrics_accumulate_without_reset() {
        let stubs = StubPipeline::new();
        let orchestrator =
            orchestrator_with(&stubs, fast_config().with_reset_metrics_per_run(false));

        orchestrator
            .execute_pipeline("first abstract", ExecutionPolicy::Sequential)
            .await;
        let second = orchestrator
            .execute_pipeline("second abstract", ExecutionPolicy::Sequential)
            .await;

        assert_eq!(second.metrics.total_executions(), 10);
        assert_eq!(second.metrics.stage(StageName::Claims).unwrap().executions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_paces_between_stages() {
        let stubs = StubPipeline::new();
        let orchestrator = orchestrator_with(&stubs, fast_config().with_stage_delay_ms(1000));

        let start = Instant::now();
        let result = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Sequential)
            .await;

        assert!(result.success);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_paces_claims_and_tail() {
        let stubs = StubPipeline::new();
        let orchestrator = orchestrator_with(&stubs, fast_config().with_stage_delay_ms(1000));

        let start = Instant::now();
        let result = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Parallel)
            .await;

        assert!(result.success);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hardened_paces_and_backs_off() {
        let claims = Arc::new(FlakyStage::new(StageName::Claims, 2));
        let stubs = StubPipeline::new().with_override(StageName::Claims, claims.clone());
        let config = fast_config()
            .with_stage_delay_ms(1000)
            .with_retry(RetryConfig::default());
        let orchestrator = orchestrator_with(&stubs, config);

        let start = Instant::now();
        let result = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::RetryHardened)
            .await;

        assert!(result.success);
        assert_eq!(claims.call_count(), 3);
        // Four pacing delays plus backoffs of 2 s and 4 s.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_runs_roots_concurrently() {
        let search = Arc::new(StubStage::new(StageName::Search).with_latency(Duration::from_secs(3)));
        let research =
            Arc::new(StubStage::new(StageName::Research).with_latency(Duration::from_secs(3)));
        let stubs = StubPipeline::new()
            .with_override(StageName::Search, search.clone())
            .with_override(StageName::Research, research.clone());
        let orchestrator = orchestrator(&stubs);

        let start = Instant::now();
        let result = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Parallel)
            .await;

        assert!(result.success);
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(orchestrator.limiter().peak_in_flight(), 2);
        assert_eq!(result.state.prior_art.len(), 3);
        assert!(!result.state.novelty_analysis.is_empty());
        assert_eq!(result.state.current_step, CurrentStep::Completed(StageName::Diagram));

        // research ran without the prior art search was producing
        assert!(research.recorded_inputs()[0].prior_art.is_empty());
        let claims_input = &stubs.stub(StageName::Claims).recorded_inputs()[0];
        assert_eq!(claims_input.prior_art.len(), 3);
        assert!(!claims_input.novelty_analysis.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_root_failure_waits_for_sibling() {
        let search = Arc::new(FailingStage::new(
            StageName::Search,
            StageError::transient("search backend timed out"),
        ));
        let stubs = StubPipeline::new().with_override(StageName::Search, search);

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Parallel)
            .await;

        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(StageName::Search));
        assert_eq!(stubs.call_count(StageName::Research), 1);
        assert_eq!(stubs.call_count(StageName::Claims), 0);
        assert!(!result.state.novelty_analysis.is_empty());
        assert_eq!(result.state.errors(), ["search: search backend timed out"]);
        assert_eq!(result.state.current_step, CurrentStep::Failed(StageName::Search));
    }

    #[tokio::test]
    async fn test_parallel_soft_failure_in_tail() {
        let document = Arc::new(SoftFailStage::new(StageName::Document, "draft rejected"));
        let stubs = StubPipeline::new().with_override(StageName::Document, document);

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::Parallel)
            .await;

        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(StageName::Document));
        assert_eq!(result.state.claims.len(), 2);
        assert_eq!(stubs.call_count(StageName::Diagram), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hardened_recovers_transient_failures() {
        let claims = Arc::new(FlakyStage::new(StageName::Claims, 2));
        let stubs = StubPipeline::new().with_override(StageName::Claims, claims.clone());
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = orchestrator(&stubs).with_events(events.clone());

        let result = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::RetryHardened)
            .await;

        assert!(result.success);
        assert_eq!(claims.call_count(), 3);
        let hints: Vec<_> = claims
            .recorded_inputs()
            .iter()
            .map(|s| (s.retry_count, s.use_alternative_prompt))
            .collect();
        assert_eq!(hints, vec![(0, false), (1, true), (2, true)]);
        assert_eq!(events.events_of_kind(EventKind::StageRetryScheduled).len(), 2);

        let document_inputs = stubs.stub(StageName::Document).recorded_inputs();
        assert_eq!(document_inputs.len(), 1);
        assert_eq!(
            (document_inputs[0].retry_count, document_inputs[0].use_alternative_prompt),
            (0, false)
        );
        assert_eq!((result.state.retry_count, result.state.use_alternative_prompt), (0, false));

        let claims_metrics = result.metrics.stage(StageName::Claims).unwrap();
        assert_eq!(claims_metrics.failure_count, 2);
        assert_eq!(claims_metrics.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hardened_aborts_after_exhaustion() {
        let document = Arc::new(FailingStage::new(
            StageName::Document,
            StageError::transient("upstream 503"),
        ));
        let stubs = StubPipeline::new().with_override(StageName::Document, document.clone());

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::RetryHardened)
            .await;

        assert!(!result.success);
        assert_eq!(document.call_count(), 3);
        assert_eq!(result.failed_stage, Some(StageName::Document));
        assert_eq!(result.error.as_deref(), Some("upstream 503"));
        assert_eq!(result.state.current_step, CurrentStep::Completed(StageName::Claims));
        assert!(result.state.errors().is_empty());
        assert_eq!(stubs.call_count(StageName::Diagram), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hardened_does_not_retry_quota() {
        let search = Arc::new(FailingStage::new(
            StageName::Search,
            StageError::classify("Error 429: quota exceeded"),
        ));
        let stubs = StubPipeline::new().with_override(StageName::Search, search.clone());

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::RetryHardened)
            .await;

        assert!(!result.success);
        assert_eq!(search.call_count(), 1);
        assert_eq!(result.error_class, Some(ErrorClass::Quota));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hardened_retries_reported_failures() {
        let claims = Arc::new(SoftFailStage::new(StageName::Claims, "claims did not parse"));
        let stubs = StubPipeline::new().with_override(StageName::Claims, claims.clone());

        let result = orchestrator(&stubs)
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::RetryHardened)
            .await;

        assert!(!result.success);
        assert_eq!(claims.call_count(), 3);
        assert_eq!(result.error_class, Some(ErrorClass::Parse));
    }

    #[tokio::test]
    async fn test_cached_first_reuses_stage_outputs() {
        let stubs = StubPipeline::new();
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = orchestrator(&stubs).with_events(events.clone());

        let first = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::CachedFirst)
            .await;
        assert!(first.success);
        assert_eq!(orchestrator.cache().len(), 6);

        orchestrator
            .cache()
            .remove(&CacheKey::workflow(WIDGET_ABSTRACT));
        events.clear();
        let second = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::CachedFirst)
            .await;

        assert!(second.success);
        assert!(!second.cache_hit);
        assert_eq!(second.state, first.state);
        assert_eq!(events.events_of_kind(EventKind::StageCacheHit).len(), 5);
        assert_eq!(second.metrics.total_executions(), 0);
        for stage in StageName::ALL {
            assert_eq!(stubs.call_count(stage), 1);
        }
    }

    #[tokio::test]
    async fn test_cached_first_runs_only_uncached_stages() {
        let stubs = StubPipeline::new();
        let orchestrator = orchestrator(&stubs);
        let cached = stub_output(StageName::Search, PipelineState::new(WIDGET_ABSTRACT));
        orchestrator
            .cache()
            .set(CacheKey::stage(StageName::Search, WIDGET_ABSTRACT), cached);

        let result = orchestrator
            .execute_pipeline(WIDGET_ABSTRACT, ExecutionPolicy::CachedFirst)
            .await;

        assert!(result.success);
        assert_eq!(stubs.call_count(StageName::Search), 0);
        assert_eq!(stubs.call_count(StageName::Research), 1);
        assert_eq!(result.state.prior_art.len(), 3);
    }

    #[tokio::test]
    async fn test_named_policy_runs() {
        let stubs = StubPipeline::new();
        let result = tokio_test::assert_ok!(
            orchestrator(&stubs)
                .execute_pipeline_named(WIDGET_ABSTRACT, "parallel")
                .await
        );

        assert!(result.success);
        assert_eq!(result.policy, ExecutionPolicy::Parallel);
    }

    #[tokio::test]
    async fn test_default_policy_from_config() {
        let stubs = StubPipeline::new();
        let config = fast_config().with_default_policy(ExecutionPolicy::CachedFirst);

        let result = orchestrator_with(&stubs, config)
            .execute_default(WIDGET_ABSTRACT)
            .await;

        assert_eq!(result.policy, ExecutionPolicy::CachedFirst);
        assert!(result.success);
    }
}
