//! Pipeline orchestration.
//!
//! This module provides:
//! - Execution policy selection
//! - The orchestrator driving the five stages under a policy
//! - The result returned to callers

mod instrumented;
mod integration_tests;
mod orchestrator;
mod policy;
mod result;

pub use orchestrator::PipelineOrchestrator;
pub use policy::ExecutionPolicy;
pub use result::PipelineResult;
