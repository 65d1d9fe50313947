//! Test fixtures for pipeline testing.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::mocks::StubStage;
use crate::concurrency::ConcurrencyConfig;
use crate::config::OrchestratorConfig;
use crate::retry::RetryConfig;
use crate::stages::{SharedStage, StageSet};
use crate::state::{Claim, DiagramSuggestion, PipelineState, PriorArtItem, StageName};

/// Sample abstract used throughout the tests.
pub const WIDGET_ABSTRACT: &str = "A widget that senses temperature and reports it wirelessly";

/// Fills the fields `stage` owns with canned output and marks it completed.
#[must_use]
pub fn stub_output(stage: StageName, state: PipelineState) -> PipelineState {
    let state = match stage {
        StageName::Search => state.with_prior_art(vec![
            PriorArtItem::new("Wireless thermometer", "Probe reporting over a radio link")
                .with_reference("US 6,123,456")
                .with_relevance(0.82),
            PriorArtItem::new("Sensor mesh node", "Battery node relaying sensor readings")
                .with_relevance(0.64),
            PriorArtItem::new("Smart thermostat", "Thermostat with remote display")
                .with_relevance(0.41),
        ]),
        StageName::Research => {
            let references = state.prior_art.len();
            state.with_novelty_analysis(format!(
                "Compared against {references} references; combining on-board sensing \
                 with duty-cycled radio reporting is not disclosed."
            ))
        }
        StageName::Claims => state.with_claims(vec![
            Claim::independent(1, "A widget comprising a temperature sensor and a radio."),
            Claim::dependent(2, 1, "The widget of claim 1, wherein the radio reports periodically."),
        ]),
        StageName::Document => {
            let claims = state
                .claims
                .iter()
                .map(|c| format!("{}. {}", c.number, c.text))
                .collect::<Vec<_>>()
                .join("\n");
            state.with_patent_draft(format!("TITLE: Widget\n\nCLAIMS\n{claims}"))
        }
        StageName::Diagram => state.with_diagrams(vec![
            DiagramSuggestion::new("FIG. 1", "Perspective view of the widget", "perspective"),
            DiagramSuggestion::new("FIG. 2", "Block diagram of the sensor and radio", "block"),
        ]),
    };
    state.completed(stage)
}

/// Returns a complete stage set of fresh [`StubStage`]s.
#[must_use]
pub fn stub_stage_set() -> StageSet {
    StubPipeline::new().stage_set()
}

/// Configuration with no pacing delay and millisecond retry backoff.
#[must_use]
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_stage_delay_ms(0)
        .with_retry(RetryConfig::new().with_base_delay_ms(1).with_max_delay_ms(10))
        .with_concurrency(ConcurrencyConfig::default())
}

/// A complete stage set backed by [`StubStage`]s, with handles kept for
/// call-count assertions.
pub struct StubPipeline {
    stubs: BTreeMap<StageName, Arc<StubStage>>,
    overrides: BTreeMap<StageName, SharedStage>,
}

impl std::fmt::Debug for StubPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubPipeline")
            .field("stubs", &self.stubs)
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for StubPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl StubPipeline {
    /// Creates stubs for all five stages.
    #[must_use]
    pub fn new() -> Self {
        let stubs = StageName::ALL
            .iter()
            .map(|&stage| (stage, Arc::new(StubStage::new(stage))))
            .collect();
        Self {
            stubs,
            overrides: BTreeMap::new(),
        }
    }

    /// Replaces the stub for `stage` with `replacement`.
    #[must_use]
    pub fn with_override(mut self, stage: StageName, replacement: SharedStage) -> Self {
        self.overrides.insert(stage, replacement);
        self
    }

    /// Returns the stub for `stage`.
    #[must_use]
    pub fn stub(&self, stage: StageName) -> &Arc<StubStage> {
        &self.stubs[&stage]
    }

    /// Returns how often the stub for `stage` ran.
    #[must_use]
    pub fn call_count(&self, stage: StageName) -> usize {
        self.stub(stage).call_count()
    }

    /// Builds the stage set, preferring overrides over stubs.
    #[must_use]
    pub fn stage_set(&self) -> StageSet {
        StageName::ALL.iter().fold(StageSet::new(), |set, stage| {
            let stage_fn: SharedStage = match self.overrides.get(stage) {
                Some(replacement) => replacement.clone(),
                None => self.stubs[stage].clone(),
            };
            set.with_stage(stage_fn)
        })
    }
}
