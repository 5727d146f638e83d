//! Step error and options

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Error type for step failures
///
/// Recorded verbatim in the step log, so a replayed step re-raises exactly
/// the error its first execution produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether another attempt may succeed
    ///
    /// Only consulted when the step runs with a retry policy.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub(crate) fn serialization(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type("SERIALIZATION")
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        Self::retryable(err.to_string()).with_type("IO")
    }
}

/// Options for a single step call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepOptions {
    /// Retry policy applied before a failure is recorded
    ///
    /// `None` runs the step exactly once.
    pub retry_policy: Option<RetryPolicy>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Total attempts allowed for this step
    pub fn max_attempts(&self) -> u32 {
        self.retry_policy
            .as_ref()
            .map(|p| p.max_attempts.max(1))
            .unwrap_or(1)
    }
}
