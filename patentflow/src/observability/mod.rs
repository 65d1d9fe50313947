//! Logging bootstrap and span helpers.

mod logging;
mod spans;

pub use logging::{init_logging, LogFormat};
pub use spans::{pipeline_span, stage_span, StageSpan, StageSpanAttributes};
