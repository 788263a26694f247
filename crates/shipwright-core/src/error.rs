//! Error types for Shipwright Core
//!
//! Provides error handling for:
//! - External collaborator calls (transient vs permanent)
//! - Retry exhaustion
//! - Task pipeline failures
//! - Admission control
//! - Configuration loading

use crate::types::Phase;

/// Failure of one call to an external collaborator
///
/// The classification is the single decision point the retry executor uses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Timeouts, rate limits, 5xx-like backend unavailability
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid input, auth rejection, content-policy rejection, missing state
    #[error("permanent: {0}")]
    Permanent(String),
}

impl CallError {
    /// Create a transient error
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a permanent error
    #[inline]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Underlying message without the classification prefix
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// Terminal failure of the retry executor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryError {
    /// Last error observed
    pub error: CallError,
    /// Number of attempts made, including the failing one
    pub attempts: u32,
}

impl RetryError {
    /// All attempts failed transiently
    #[inline]
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.error.is_retryable()
    }

    /// Aborted on a permanent error
    #[inline]
    #[must_use]
    pub fn aborted(&self) -> bool {
        !self.error.is_retryable()
    }
}

/// Why a task pipeline ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Task failed intake validation
    #[error("invalid task: {0}")]
    InvalidTask(#[from] IntakeError),

    /// An attachment could not be resolved
    #[error("attachment '{name}' unavailable: {source}")]
    Attachment {
        /// Attachment name
        name: String,
        /// Underlying failure
        source: RetryError,
    },

    /// Update round without a readable prior artifact
    #[error("prior artifact unavailable for round {round}: {reason}")]
    PriorArtifactMissing {
        /// Round number of the task
        round: u32,
        /// What went wrong
        reason: String,
    },

    /// Generation failed with nothing to fall back to, or permanently
    #[error("generation failed: {0}")]
    Generation(RetryError),

    /// Generator produced empty output on a first round
    #[error("generated artifact is empty and there is no previous artifact")]
    EmptyArtifact,

    /// Publishing failed
    #[error("publish failed: {0}")]
    Publish(RetryError),

    /// Cancelled before generation started
    #[error("cancelled")]
    Cancelled,

    /// Internal state machine violation
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current phase
        from: Phase,
        /// Requested phase
        to: Phase,
    },
}

/// Task intake validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntakeError {
    /// Missing task identifier
    #[error("task identifier is empty")]
    EmptyId,

    /// Round must be positive
    #[error("round must be >= 1, got {0}")]
    InvalidRound(u32),

    /// Missing brief
    #[error("brief is empty")]
    EmptyBrief,

    /// Callback is not an absolute http(s) address
    #[error("callback address '{0}' is not an http(s) url")]
    InvalidCallback(String),

    /// Attachment without a name
    #[error("attachment #{0} has no name")]
    UnnamedAttachment(usize),
}

/// Admission control errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// Queue at capacity
    #[error("queue full (capacity: {0})")]
    QueueFull(usize),

    /// Gate no longer accepts tasks
    #[error("gate is closed")]
    Closed,

    /// Same task and round already in flight
    #[error("task {0} is already in flight")]
    Duplicate(String),

    /// Task failed intake validation
    #[error("invalid task: {0}")]
    InvalidTask(#[from] IntakeError),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file malformed
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Value out of range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field path
        field: String,
        /// Constraint that failed
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_is_retryable() {
        assert!(CallError::transient("429").is_retryable());
        assert!(!CallError::permanent("401").is_retryable());
    }

    #[test]
    fn call_error_display() {
        let err = CallError::permanent("content policy");
        assert_eq!(err.to_string(), "permanent: content policy");
        assert_eq!(err.message(), "content policy");
    }

    #[test]
    fn retry_error_classification() {
        let exhausted = RetryError {
            error: CallError::transient("timeout"),
            attempts: 3,
        };
        assert!(exhausted.exhausted());
        assert!(!exhausted.aborted());
        assert!(exhausted.to_string().contains("3 attempt(s)"));

        let aborted = RetryError {
            error: CallError::permanent("auth"),
            attempts: 1,
        };
        assert!(aborted.aborted());
    }

    #[test]
    fn pipeline_error_display() {
        let err = PipelineError::PriorArtifactMissing {
            round: 2,
            reason: "not found".into(),
        };
        assert!(err.to_string().contains("round 2"));
    }
}
