//! The pipeline state threaded through every stage.
//!
//! [`PipelineState`] is never mutated in place by the orchestrator. Stages
//! take a state by value and hand back a new one built with the `with_*`
//! methods, so the only shared mutable data in a run lives in the cache and
//! the metrics recorder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PatentflowError;

/// The five stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Prior-art search.
    Search,
    /// Novelty analysis.
    Research,
    /// Claim drafting.
    Claims,
    /// Full application draft.
    Document,
    /// Diagram suggestions.
    Diagram,
}

impl StageName {
    /// All stages in sequential order.
    pub const ALL: [Self; 5] = [
        Self::Search,
        Self::Research,
        Self::Claims,
        Self::Document,
        Self::Diagram,
    ];

    /// Returns the wire name of the stage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Research => "research",
            Self::Claims => "claims",
            Self::Document => "document",
            Self::Diagram => "diagram",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = PatentflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PatentflowError::Internal(format!("unknown stage name: {s}")))
    }
}

/// The control signal recorded after every stage.
///
/// Serialized as `started`, `<stage>_completed` or `<stage>_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CurrentStep {
    /// No stage has finished yet.
    #[default]
    Started,
    /// The stage finished and wrote its fields.
    Completed(StageName),
    /// The stage reported an application-level failure.
    Failed(StageName),
}

impl CurrentStep {
    /// Returns true if this marks the failure of `stage`.
    #[must_use]
    pub fn is_failure_of(self, stage: StageName) -> bool {
        self == Self::Failed(stage)
    }
}

impl fmt::Display for CurrentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => f.write_str("started"),
            Self::Completed(stage) => write!(f, "{stage}_completed"),
            Self::Failed(stage) => write!(f, "{stage}_failed"),
        }
    }
}

impl From<CurrentStep> for String {
    fn from(step: CurrentStep) -> Self {
        step.to_string()
    }
}

impl TryFrom<String> for CurrentStep {
    type Error = PatentflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for CurrentStep {
    type Err = PatentflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "started" {
            return Ok(Self::Started);
        }
        if let Some(stage) = s.strip_suffix("_completed") {
            return Ok(Self::Completed(stage.parse()?));
        }
        if let Some(stage) = s.strip_suffix("_failed") {
            return Ok(Self::Failed(stage.parse()?));
        }
        Err(PatentflowError::Internal(format!("unknown step: {s}")))
    }
}

/// A prior-art reference found by the search stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorArtItem {
    /// Title of the reference.
    pub title: String,
    /// Publication or patent number, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Short summary of the reference.
    pub summary: String,
    /// Relevance score in `[0, 1]`.
    #[serde(default)]
    pub relevance: f64,
}

impl PriorArtItem {
    /// Creates a new prior-art item.
    #[must_use]
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            reference: None,
            summary: summary.into(),
            relevance: 0.0,
        }
    }

    /// Sets the publication reference.
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Sets the relevance score.
    #[must_use]
    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }
}

/// A drafted patent claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Claim number, starting at 1.
    pub number: u32,
    /// Claim text.
    pub text: String,
    /// The claim this one depends on; `None` for independent claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<u32>,
}

impl Claim {
    /// Creates an independent claim.
    #[must_use]
    pub fn independent(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
            depends_on: None,
        }
    }

    /// Creates a claim depending on `parent`.
    #[must_use]
    pub fn dependent(number: u32, parent: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
            depends_on: Some(parent),
        }
    }

    /// Returns true if the claim stands alone.
    #[must_use]
    pub fn is_independent(&self) -> bool {
        self.depends_on.is_none()
    }
}

/// A suggested figure for the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramSuggestion {
    /// Figure title.
    pub title: String,
    /// What the figure should show.
    pub description: String,
    /// Kind of figure (block diagram, flowchart, ...).
    #[serde(default)]
    pub kind: String,
}

impl DiagramSuggestion {
    /// Creates a new diagram suggestion.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            kind: kind.into(),
        }
    }
}

/// The record threaded through all stages of one run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    /// The invention abstract. Set once at construction.
    #[serde(rename = "abstract")]
    invention_abstract: String,
    /// Produced by `search`.
    pub prior_art: Vec<PriorArtItem>,
    /// Produced by `research`.
    pub novelty_analysis: String,
    /// Produced by `claims`.
    pub claims: Vec<Claim>,
    /// Produced by `document`.
    pub patent_draft: String,
    /// Produced by `diagram`.
    pub diagrams: Vec<DiagramSuggestion>,
    /// Append-only error log.
    errors: Vec<String>,
    /// Control signal for the orchestrator.
    pub current_step: CurrentStep,
    /// Number of retries already spent on the current stage.
    pub retry_count: u32,
    /// Hint that the stage should use its simplified prompt.
    pub use_alternative_prompt: bool,
}

impl PipelineState {
    /// Creates a fresh state for `invention_abstract`.
    #[must_use]
    pub fn new(invention_abstract: impl Into<String>) -> Self {
        Self {
            invention_abstract: invention_abstract.into(),
            ..Self::default()
        }
    }

    /// Returns the invention abstract.
    #[must_use]
    pub fn invention_abstract(&self) -> &str {
        &self.invention_abstract
    }

    /// Returns the accumulated errors.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Returns the latest error log entry carrying a quota/auth marker.
    #[must_use]
    pub fn terminal_error(&self) -> Option<&str> {
        self.errors
            .iter()
            .rev()
            .find(|e| crate::errors::is_terminal_marker(e))
            .map(String::as_str)
    }

    /// Sets the prior art.
    #[must_use]
    pub fn with_prior_art(mut self, prior_art: Vec<PriorArtItem>) -> Self {
        self.prior_art = prior_art;
        self
    }

    /// Sets the novelty analysis.
    #[must_use]
    pub fn with_novelty_analysis(mut self, analysis: impl Into<String>) -> Self {
        self.novelty_analysis = analysis.into();
        self
    }

    /// Sets the claims.
    #[must_use]
    pub fn with_claims(mut self, claims: Vec<Claim>) -> Self {
        self.claims = claims;
        self
    }

    /// Sets the patent draft.
    #[must_use]
    pub fn with_patent_draft(mut self, draft: impl Into<String>) -> Self {
        self.patent_draft = draft.into();
        self
    }

    /// Sets the diagram suggestions.
    #[must_use]
    pub fn with_diagrams(mut self, diagrams: Vec<DiagramSuggestion>) -> Self {
        self.diagrams = diagrams;
        self
    }

    /// Appends an error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    /// Sets the current step.
    #[must_use]
    pub fn with_step(mut self, step: CurrentStep) -> Self {
        self.current_step = step;
        self
    }

    /// Marks `stage` completed.
    #[must_use]
    pub fn completed(self, stage: StageName) -> Self {
        self.with_step(CurrentStep::Completed(stage))
    }

    /// Marks `stage` failed and records `error` prefixed with the stage name.
    #[must_use]
    pub fn failed(self, stage: StageName, error: impl fmt::Display) -> Self {
        self.with_error(format!("{stage}: {error}"))
            .with_step(CurrentStep::Failed(stage))
    }

    /// Sets the retry hint fields.
    #[must_use]
    pub fn with_retry_hint(mut self, retry_count: u32, use_alternative_prompt: bool) -> Self {
        self.retry_count = retry_count;
        self.use_alternative_prompt = use_alternative_prompt;
        self
    }

    /// Copies the fields `stage` owns from `other`, plus its step and any
    /// errors `other` recorded beyond the ones already present here.
    #[must_use]
    pub fn merge_owned_from(mut self, stage: StageName, other: &Self) -> Self {
        match stage {
            StageName::Search => self.prior_art.clone_from(&other.prior_art),
            StageName::Research => self.novelty_analysis.clone_from(&other.novelty_analysis),
            StageName::Claims => self.claims.clone_from(&other.claims),
            StageName::Document => self.patent_draft.clone_from(&other.patent_draft),
            StageName::Diagram => self.diagrams.clone_from(&other.diagrams),
        }
        for error in &other.errors {
            if !self.errors.contains(error) {
                self.errors.push(error.clone());
            }
        }
        self.current_step = other.current_step;
        self
    }

    /// Returns true if the fields owned by `stage` are populated.
    #[must_use]
    pub fn has_output_of(&self, stage: StageName) -> bool {
        match stage {
            StageName::Search => !self.prior_art.is_empty(),
            StageName::Research => !self.novelty_analysis.is_empty(),
            StageName::Claims => !self.claims.is_empty(),
            StageName::Document => !self.patent_draft.is_empty(),
            StageName::Diagram => !self.diagrams.is_empty(),
        }
    }
}
