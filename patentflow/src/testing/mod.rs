//! Testing utilities for patentflow pipelines.
//!
//! This module provides:
//! - Stub stage functions with canned outputs and call tracking
//! - Failure-injecting stages for each failure path
//! - A ready-made five-stage set and a fast configuration

mod fixtures;
mod mocks;

pub use fixtures::{fast_config, stub_output, stub_stage_set, StubPipeline, WIDGET_ABSTRACT};
pub use mocks::{FailingStage, FlakyStage, SoftFailStage, StubStage};
