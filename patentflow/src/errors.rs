//! Error types for the patentflow orchestrator.
//!
//! Two layers are kept apart here. [`StageError`] is what a stage function
//! raises at the provider boundary, already classified. [`PatentflowError`]
//! is what the orchestrator itself returns for configuration and
//! programming errors.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Suggestion attached to authorization and quota failures.
pub const BILLING_SUGGESTION: &str = "check your API billing and credentials";

static QUOTA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|quota|exceeded|rate[ _-]?limit|too many requests")
        .expect("quota pattern is valid")
});

static AUTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b40[13]\b|unauthori[sz]ed|forbidden|authentication|invalid[ _-]api[ _-]key|permission denied",
    )
    .expect("auth pattern is valid")
});

static PARSE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)parse|invalid json|unexpected token|malformed").expect("parse pattern is valid")
});

/// The class of a stage failure, without its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Quota exhausted or rate limited upstream.
    Quota,
    /// Credentials rejected (401/403).
    Unauthorized,
    /// Network hiccup, timeout, 5xx and anything unrecognized.
    Transient,
    /// The stage output failed structural validation.
    Parse,
    /// A stage broke its own contract.
    Internal,
}

impl ErrorClass {
    /// Returns true if the retry executor may try again.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Parse | Self::Internal)
    }

    /// Returns true if the run must stop regardless of policy.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Quota | Self::Unauthorized)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quota => write!(f, "quota"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Transient => write!(f, "transient"),
            Self::Parse => write!(f, "parse"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// An error raised by a stage function.
///
/// The message is kept verbatim so it can be surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StageError {
    /// Upstream quota exceeded (HTTP 429 and friends).
    #[error("{0}")]
    Quota(String),

    /// Upstream rejected credentials (HTTP 401/403).
    #[error("{0}")]
    Unauthorized(String),

    /// A transient failure worth retrying.
    #[error("{0}")]
    Transient(String),

    /// Stage output could not be parsed.
    #[error("{0}")]
    Parse(String),

    /// Stage broke its contract.
    #[error("{0}")]
    Internal(String),
}

impl StageError {
    /// Classifies a raw provider message.
    ///
    /// Quota markers win over auth markers, and both win over parse markers.
    #[must_use]
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if QUOTA_PATTERN.is_match(&message) {
            Self::Quota(message)
        } else if AUTH_PATTERN.is_match(&message) {
            Self::Unauthorized(message)
        } else if PARSE_PATTERN.is_match(&message) {
            Self::Parse(message)
        } else {
            Self::Transient(message)
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a quota error.
    #[must_use]
    pub fn quota(message: impl Into<String>) -> Self {
        Self::Quota(message.into())
    }

    /// Creates an authorization error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Creates a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Returns the class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Quota(_) => ErrorClass::Quota,
            Self::Unauthorized(_) => ErrorClass::Unauthorized,
            Self::Transient(_) => ErrorClass::Transient,
            Self::Parse(_) => ErrorClass::Parse,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Returns the verbatim message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Quota(m)
            | Self::Unauthorized(m)
            | Self::Transient(m)
            | Self::Parse(m)
            | Self::Internal(m) => m,
        }
    }

    /// Returns true if the retry executor may try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Returns true if the run must stop regardless of policy.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.class().is_terminal()
    }

    /// Message shown to the caller, with the billing hint for terminal errors.
    #[must_use]
    pub fn user_message(&self) -> String {
        if self.is_terminal() {
            format!("{} ({})", self.message(), BILLING_SUGGESTION)
        } else {
            self.message().to_string()
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(stage_err) = err.downcast_ref::<StageError>() {
            return stage_err.clone();
        }
        Self::classify(format!("{err:#}"))
    }
}

/// Returns true if an entry of a state's error list marks a terminal failure.
#[must_use]
pub fn is_terminal_marker(message: &str) -> bool {
    QUOTA_PATTERN.is_match(message) || AUTH_PATTERN.is_match(message)
}

/// The main error type for orchestrator operations.
#[derive(Debug, Error)]
pub enum PatentflowError {
    /// A policy name did not match any known policy.
    #[error("Unknown execution policy: {0}")]
    InvalidPolicy(String),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A stage set is missing or misregisters a stage.
    #[error("Invalid stage set: {0}")]
    InvalidStageSet(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PatentflowError {
    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        let kind = match self {
            Self::InvalidPolicy(name) => {
                map.insert("policy".to_string(), serde_json::json!(name));
                "InvalidPolicy"
            }
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::InvalidStageSet(_) => "InvalidStageSet",
            Self::Serialization(_) => "Serialization",
            Self::Internal(_) => "Internal",
        };
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}
