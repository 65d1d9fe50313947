//! Execution policy selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PatentflowError;

/// How a run drives the five stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionPolicy {
    /// All stages strictly in order, halting on the first failure.
    #[default]
    Sequential,
    /// `search` and `research` concurrently, then the tail in order.
    Parallel,
    /// Sequential with every stage wrapped in the retry executor.
    RetryHardened,
    /// Sequential with a per-stage cache in front of every stage.
    CachedFirst,
}

impl ExecutionPolicy {
    /// All policies.
    pub const ALL: [Self; 4] = [
        Self::Sequential,
        Self::Parallel,
        Self::RetryHardened,
        Self::CachedFirst,
    ];

    /// Returns the policy name as accepted by [`FromStr`].
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::RetryHardened => "retryHardened",
            Self::CachedFirst => "cachedFirst",
        }
    }
}

impl fmt::Display for ExecutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionPolicy {
    type Err = PatentflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "retryHardened" | "retry_hardened" => Ok(Self::RetryHardened),
            "cachedFirst" | "cached_first" => Ok(Self::CachedFirst),
            other => Err(PatentflowError::InvalidPolicy(other.to_string())),
        }
    }
}
