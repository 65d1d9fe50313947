//! # Patentflow
//!
//! The orchestration core of a patent drafting assistant.
//!
//! An invention abstract is run through five stages (`search`, `research`,
//! `claims`, `document`, `diagram`) whose functions are supplied by the
//! host. Patentflow provides:
//!
//! - **Execution policies**: sequential, parallel roots, retry-hardened and
//!   cached-first runs over the same stage functions
//! - **Result caching**: a bounded, time-expiring cache keyed by a scoped
//!   SHA-256 fingerprint of the abstract
//! - **Retry with backoff**: exponential backoff with prompt variation hints
//! - **Bounded concurrency**: a FIFO-fair limiter for concurrent stages
//! - **Metrics and events**: per-stage timing plus lifecycle events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use patentflow::prelude::*;
//!
//! let stages = StageSet::new()
//!     .with_stage(Arc::new(SearchStage::new(client.clone())))
//!     .with_stage(Arc::new(ResearchStage::new(client.clone())))
//!     .with_stage(Arc::new(ClaimsStage::new(client.clone())))
//!     .with_stage(Arc::new(DocumentStage::new(client.clone())))
//!     .with_stage(Arc::new(DiagramStage::new(client)));
//!
//! let orchestrator = PipelineOrchestrator::new(stages, OrchestratorConfig::default())?;
//! let result = orchestrator
//!     .execute_pipeline(abstract_text, ExecutionPolicy::Sequential)
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod stages;
pub mod state;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheConfig, CacheKey, CacheScope, CacheStats, CacheStore};
    pub use crate::concurrency::{ConcurrencyConfig, ConcurrencyLimiter, StageMap};
    pub use crate::config::OrchestratorConfig;
    pub use crate::errors::{ErrorClass, PatentflowError, StageError};
    pub use crate::events::{
        CollectingEventSink, EventKind, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent,
    };
    pub use crate::metrics::{AggregateMetrics, MetricsRecorder, StageMetrics};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{ExecutionPolicy, PipelineOrchestrator, PipelineResult};
    pub use crate::retry::{JitterStrategy, RetryConfig, RetryExecutor};
    pub use crate::stages::{FnStage, SharedStage, StageFunction, StageSet};
    pub use crate::state::{
        Claim, CurrentStep, DiagramSuggestion, PipelineState, PriorArtItem, StageName,
    };
    pub use std::sync::Arc;
}
