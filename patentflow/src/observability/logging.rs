//! `tracing-subscriber` installation for hosts embedding the orchestrator.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, human oriented.
    Pretty,
    /// Single-line text.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns false if a subscriber was already installed.
pub fn init_logging(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    installed.is_ok()
}
