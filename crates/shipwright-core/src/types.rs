//! Core types for Shipwright
//!
//! Defines the fundamental types for the engine:
//! - Tasks, attachments and their identifiers
//! - Generation flows and contexts
//! - Pipeline phases and outcomes
//! - Collaborator payloads

use crate::error::IntakeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;
use url::Url;

/// Client-supplied task identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create task ID
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key: one entry per task identifier and round
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    /// Task identifier
    pub id: TaskId,
    /// Round number
    pub round: u32,
}

impl TaskKey {
    /// Create task key
    #[inline]
    pub fn new(id: impl Into<String>, round: u32) -> Self {
        Self {
            id: TaskId::new(id),
            round,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.round)
    }
}

/// Attachment reference as delivered by the intake layer
///
/// `url` is either a `data:` URI carrying the bytes inline or an
/// absolute address the bytes can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name the generated application refers to
    pub name: String,
    /// `data:` URI or remote address
    pub url: String,
}

impl Attachment {
    /// Create attachment
    #[inline]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Attachment bytes after resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    /// Attachment name
    pub name: String,
    /// Media type, when known
    pub media_type: Option<String>,
    /// Raw bytes
    pub bytes: Vec<u8>,
}

/// Immutable task brief
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    #[serde(alias = "task")]
    pub id: TaskId,
    /// Round number, starting at 1
    pub round: u32,
    /// Natural-language description of the application
    pub brief: String,
    /// Attachments referenced by the brief
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Evaluator callback address
    #[serde(alias = "evaluation_url")]
    pub callback: Url,
    /// Task-scoped correlation token, echoed back to the evaluator
    #[serde(default)]
    pub nonce: String,
}

impl Task {
    /// Create a task with no attachments and a fresh nonce
    pub fn new(id: impl Into<String>, round: u32, brief: impl Into<String>, callback: Url) -> Self {
        Self {
            id: TaskId::new(id),
            round,
            brief: brief.into(),
            attachments: Vec::new(),
            callback,
            nonce: Ulid::new().to_string(),
        }
    }

    /// With attachments
    #[inline]
    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// With explicit nonce
    #[inline]
    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = nonce.into();
        self
    }

    /// Registry key for this task
    #[inline]
    #[must_use]
    pub fn key(&self) -> TaskKey {
        TaskKey {
            id: self.id.clone(),
            round: self.round,
        }
    }

    /// Check the brief is complete enough to run
    ///
    /// # Errors
    /// Returns the first [`IntakeError`] found.
    pub fn validate(&self) -> Result<(), IntakeError> {
        if self.id.as_str().trim().is_empty() {
            return Err(IntakeError::EmptyId);
        }
        if self.round == 0 {
            return Err(IntakeError::InvalidRound(self.round));
        }
        if self.brief.trim().is_empty() {
            return Err(IntakeError::EmptyBrief);
        }
        if !matches!(self.callback.scheme(), "http" | "https") {
            return Err(IntakeError::InvalidCallback(self.callback.to_string()));
        }
        if let Some(idx) = self.attachments.iter().position(|a| a.name.trim().is_empty()) {
            return Err(IntakeError::UnnamedAttachment(idx));
        }
        Ok(())
    }
}

/// Generation flow selected for a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Round 1: generate the application from scratch
    FullGeneration,
    /// Round >= 2: minimal targeted edit of the existing artifact
    SurgicalUpdate,
}

/// Everything one generation attempt needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationContext {
    /// Selected flow
    pub flow: Flow,
    /// Task identifier
    pub task_id: TaskId,
    /// Round number
    pub round: u32,
    /// Brief text
    pub brief: String,
    /// Resolved attachments
    pub attachments: Vec<ResolvedAttachment>,
    /// Verbatim current artifact; `None` for full generation
    pub prior_content: Option<Vec<u8>>,
}

/// Output of one generation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateArtifact {
    /// Generated content
    pub content: Vec<u8>,
}

impl CandidateArtifact {
    /// Create candidate
    #[inline]
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// Byte length
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Check if empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Pipeline phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepted by the gate, waiting for a worker
    Admitted,
    /// Resolving attachments and building context
    Verifying,
    /// Calling the generator
    Generating,
    /// Running the safety validator
    Validating,
    /// Publishing the final content
    Publishing,
    /// Notifying the evaluator
    Notifying,
    /// Published (and notified or notification given up)
    Completed,
    /// Terminal failure
    Failed,
}

impl Phase {
    /// Check if phase is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Terminal outcome of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    /// The new candidate was published
    Success,
    /// The previous artifact was republished unchanged
    SuccessWithFallback,
    /// Nothing was published
    Failed {
        /// Failure reason
        reason: String,
    },
}

impl Outcome {
    /// Check if anything was published
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Commit reference in the hosted repository
    pub commit_ref: String,
    /// Address the application is served from
    pub public_url: String,
}

/// Status reported to the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// Candidate published
    Success,
    /// Previous artifact republished
    SuccessWithFallback,
}

/// Evaluator notification body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Task identifier
    #[serde(rename = "task")]
    pub task_id: TaskId,
    /// Round number
    pub round: u32,
    /// Correlation token from the brief
    pub nonce: String,
    /// Commit reference
    pub commit_ref: String,
    /// Public address
    pub public_url: String,
    /// Final status
    pub status: NotificationStatus,
}
