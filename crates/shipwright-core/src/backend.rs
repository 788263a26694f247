//! External collaborator boundaries
//!
//! The engine never talks to an LLM provider, hosting provider or evaluator
//! directly; it only sees these traits. Every method fails with a classified
//! [`CallError`] so the retry executor can decide what to repeat.

use crate::error::CallError;
use crate::types::{CandidateArtifact, GenerationContext, NotificationPayload, PublishReceipt, TaskId};
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

/// Produces artifact content from a generation context
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate or surgically update the artifact
    async fn generate(&self, context: &GenerationContext) -> Result<CandidateArtifact, CallError>;
}

/// Hosted repository holding the published artifact
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    /// Current artifact content; `Ok(None)` when no repository or artifact exists
    async fn fetch_current(&self, task_id: &TaskId) -> Result<Option<Vec<u8>>, CallError>;

    /// Publish content
    ///
    /// Must be idempotent at the content level: republishing identical
    /// content is a successful no-op.
    async fn publish(&self, task_id: &TaskId, content: &[u8]) -> Result<PublishReceipt, CallError>;
}

/// Delivers the final status to the evaluator
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post `payload` to `callback`
    async fn notify(&self, callback: &Url, payload: &NotificationPayload) -> Result<(), CallError>;
}

/// Downloads remote attachments
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Raw bytes behind `url`
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, CallError>;
}

/// Bundle of collaborators shared by every pipeline
#[derive(Clone)]
pub struct Collaborators {
    /// LLM generator
    pub generator: Arc<dyn Generator>,
    /// Repository backend
    pub repository: Arc<dyn RepositoryBackend>,
    /// Evaluator notifier
    pub notifier: Arc<dyn Notifier>,
    /// Remote attachment fetcher
    pub fetcher: Arc<dyn AttachmentFetcher>,
}

impl Collaborators {
    /// Create bundle with a fetcher that refuses every remote attachment
    pub fn new(
        generator: Arc<dyn Generator>,
        repository: Arc<dyn RepositoryBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            generator,
            repository,
            notifier,
            fetcher: Arc::new(InlineOnly),
        }
    }

    /// With remote attachment fetcher
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn AttachmentFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Fetcher used when only inline attachments are supported
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineOnly;

#[async_trait]
impl AttachmentFetcher for InlineOnly {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, CallError> {
        Err(CallError::permanent(format!(
            "remote attachments are not supported: {url}"
        )))
    }
}
