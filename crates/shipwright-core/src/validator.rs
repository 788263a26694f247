//! Safety validator
//!
//! Decides whether a generated candidate may replace the previously
//! published artifact. A rejection on an update round always resolves to the
//! previous content, so the pipeline can still publish.

use crate::config::SafetyConfig;
use std::fmt;

/// Verdict classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerdictKind {
    /// Candidate is published
    Accept,
    /// Candidate shrank below the destructive-shrink threshold
    RejectSize,
    /// Candidate is empty
    RejectEmpty,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accept => "accept",
            Self::RejectSize => "reject_size",
            Self::RejectEmpty => "reject_empty",
        };
        f.write_str(s)
    }
}

/// Outcome of validating one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationVerdict {
    /// Classification
    pub kind: VerdictKind,
    /// Content to publish; `None` only for an empty first-round candidate
    pub content: Option<Vec<u8>>,
    /// Human-readable reason
    pub reason: String,
    /// `len(candidate) / len(previous)` when a non-empty previous exists
    pub shrink_ratio: Option<f64>,
}

impl ValidationVerdict {
    /// Check if the candidate was accepted
    #[inline]
    #[must_use]
    pub fn is_accept(&self) -> bool {
        self.kind == VerdictKind::Accept
    }

    /// Check if the verdict resolved to the previous artifact
    #[inline]
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        !self.is_accept() && self.content.is_some()
    }
}

/// Stateless update-safety check
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyValidator {
    shrink_threshold: f64,
    min_previous_bytes: usize,
}

impl SafetyValidator {
    /// Create validator with a destructive-shrink threshold
    #[inline]
    #[must_use]
    pub fn new(shrink_threshold: f64) -> Self {
        Self {
            shrink_threshold,
            min_previous_bytes: 0,
        }
    }

    /// Create validator from configuration
    #[inline]
    #[must_use]
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self {
            shrink_threshold: config.shrink_threshold,
            min_previous_bytes: config.min_previous_bytes,
        }
    }

    /// Configured threshold
    #[inline]
    #[must_use]
    pub fn shrink_threshold(&self) -> f64 {
        self.shrink_threshold
    }

    /// Validate `candidate` against the previously published content
    #[must_use]
    pub fn validate(&self, previous: Option<&[u8]>, candidate: &[u8]) -> ValidationVerdict {
        let Some(previous) = previous else {
            if candidate.is_empty() {
                return ValidationVerdict {
                    kind: VerdictKind::RejectEmpty,
                    content: None,
                    reason: "candidate is empty and there is no previous artifact".into(),
                    shrink_ratio: None,
                };
            }
            return ValidationVerdict {
                kind: VerdictKind::Accept,
                content: Some(candidate.to_vec()),
                reason: format!("first artifact accepted ({} bytes)", candidate.len()),
                shrink_ratio: None,
            };
        };

        if candidate.is_empty() {
            return ValidationVerdict {
                kind: VerdictKind::RejectEmpty,
                content: Some(previous.to_vec()),
                reason: format!(
                    "candidate is empty, keeping previous artifact ({} bytes)",
                    previous.len()
                ),
                shrink_ratio: (!previous.is_empty()).then_some(0.0),
            };
        }

        if previous.is_empty() {
            return ValidationVerdict {
                kind: VerdictKind::Accept,
                content: Some(candidate.to_vec()),
                reason: "previous artifact was empty".into(),
                shrink_ratio: None,
            };
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = candidate.len() as f64 / previous.len() as f64;

        if previous.len() >= self.min_previous_bytes && ratio < self.shrink_threshold {
            return ValidationVerdict {
                kind: VerdictKind::RejectSize,
                content: Some(previous.to_vec()),
                reason: format!(
                    "candidate shrank to {ratio:.3} of previous ({} -> {} bytes), below threshold {}",
                    previous.len(),
                    candidate.len(),
                    self.shrink_threshold
                ),
                shrink_ratio: Some(ratio),
            };
        }

        ValidationVerdict {
            kind: VerdictKind::Accept,
            content: Some(candidate.to_vec()),
            reason: format!("size ratio {ratio:.3} within threshold"),
            shrink_ratio: Some(ratio),
        }
    }
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::from_config(&SafetyConfig::default())
    }
}
