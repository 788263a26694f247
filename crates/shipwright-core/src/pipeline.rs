//! Task pipeline
//!
//! Per-task state machine:
//! `Admitted → Verifying → Generating → Validating → Publishing → Notifying → Completed`,
//! with `Failed` reachable from every non-terminal phase.
//!
//! Side effects are strictly ordered: nothing is published before it has been
//! validated (or is the unchanged previous artifact), empty content is never
//! published, and the evaluator is only notified after a successful publish.

use crate::attachments;
use crate::backend::Collaborators;
use crate::config::{EngineConfig, RetryConfig};
use crate::error::{PipelineError, RetryError};
use crate::registry::TaskRegistry;
use crate::retry::{retry, Idempotency};
use crate::state_machine::validate_transition;
use crate::strategy::{build_context, plan_flow, RepositoryState};
use crate::types::{
    Flow, GenerationContext, NotificationPayload, NotificationStatus, Outcome, Phase,
    PublishReceipt, Task, TaskKey,
};
use crate::validator::{SafetyValidator, VerdictKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Policy shared read-only by every pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Update-safety check
    pub validator: SafetyValidator,
    /// Retry policies per call type
    pub retry: RetryConfig,
}

impl PipelineSettings {
    /// Derive settings from engine configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            validator: SafetyValidator::from_config(&config.safety),
            retry: config.retry.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// What happened to one task
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Task identifier and round
    pub key: TaskKey,
    /// Terminal outcome
    pub outcome: Outcome,
    /// Flow used, if verification got that far
    pub flow: Option<Flow>,
    /// Generator attempts made (0 if never invoked)
    pub generation_attempts: u32,
    /// Validator verdict, if generation produced a candidate
    pub verdict: Option<VerdictKind>,
    /// Publish result, if publishing succeeded
    pub receipt: Option<PublishReceipt>,
    /// Evaluator could not be reached
    pub notification_failed: bool,
}

impl PipelineReport {
    fn new(key: TaskKey) -> Self {
        Self {
            key,
            outcome: Outcome::Failed {
                reason: "not started".into(),
            },
            flow: None,
            generation_attempts: 0,
            verdict: None,
            receipt: None,
            notification_failed: false,
        }
    }
}

/// Content chosen for publishing
struct FinalContent {
    content: Vec<u8>,
    fallback: bool,
}

/// One execution of one task
pub struct TaskPipeline {
    task: Task,
    phase: Phase,
    registry: Arc<TaskRegistry>,
    collaborators: Collaborators,
    settings: Arc<PipelineSettings>,
    cancel: CancellationToken,
    report: PipelineReport,
}

impl TaskPipeline {
    /// Create pipeline for an admitted task
    ///
    /// The task must already be recorded in `registry`.
    pub fn new(
        task: Task,
        registry: Arc<TaskRegistry>,
        collaborators: Collaborators,
        settings: Arc<PipelineSettings>,
        cancel: CancellationToken,
    ) -> Self {
        let report = PipelineReport::new(task.key());
        Self {
            task,
            phase: Phase::Admitted,
            registry,
            collaborators,
            settings,
            cancel,
            report,
        }
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the task to a terminal phase
    pub async fn run(mut self) -> PipelineReport {
        let span = tracing::info_span!("task", task = %self.task.id, round = self.task.round);
        async move {
            tracing::info!("pipeline started");
            match self.execute().await {
                Ok(outcome) => {
                    tracing::info!(?outcome, "pipeline completed");
                    self.report.outcome = outcome.clone();
                    self.phase = Phase::Completed;
                    self.registry.complete(&self.report.key, outcome);
                }
                Err(error) => {
                    tracing::error!(%error, phase = ?self.phase, "pipeline failed");
                    let outcome = Outcome::Failed {
                        reason: error.to_string(),
                    };
                    self.report.outcome = outcome.clone();
                    self.phase = Phase::Failed;
                    self.registry.complete(&self.report.key, outcome);
                }
            }
            self.report
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self) -> Result<Outcome, PipelineError> {
        self.transition(Phase::Verifying)?;
        let context = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            context = self.verify() => context?,
        };
        self.report.flow = Some(context.flow);

        // Past this point cancellation is ignored.
        self.transition(Phase::Generating)?;
        let chosen = self.generate_and_validate(&context).await?;

        if chosen.content.is_empty() {
            return Err(PipelineError::EmptyArtifact);
        }

        let receipt = self.publish(&chosen.content).await?;
        self.report.receipt = Some(receipt.clone());

        let status = if chosen.fallback {
            NotificationStatus::SuccessWithFallback
        } else {
            NotificationStatus::Success
        };
        self.notify(receipt, status).await?;

        Ok(if chosen.fallback {
            Outcome::SuccessWithFallback
        } else {
            Outcome::Success
        })
    }

    /// Resolve attachments, pick the flow, and load the base artifact
    async fn verify(&self) -> Result<GenerationContext, PipelineError> {
        self.task.validate()?;

        let resolved = attachments::resolve_all(
            &self.task.attachments,
            self.collaborators.fetcher.as_ref(),
            &self.settings.retry.attachment,
        )
        .await?;

        let flow = plan_flow(&self.task);
        let repository = match flow {
            Flow::FullGeneration => RepositoryState::Missing,
            Flow::SurgicalUpdate => {
                let repo = &self.collaborators.repository;
                let id = &self.task.id;
                let fetched = retry("fetch", &self.settings.retry.fetch, Idempotency::Idempotent, |_| {
                    repo.fetch_current(id)
                })
                .await
                .map_err(|e| PipelineError::PriorArtifactMissing {
                    round: self.task.round,
                    reason: e.to_string(),
                })?;
                RepositoryState::from(fetched.value)
            }
        };

        tracing::debug!(?flow, attachments = resolved.len(), "context assembled");
        build_context(flow, &self.task, resolved, repository)
    }

    async fn generate_and_validate(
        &mut self,
        context: &GenerationContext,
    ) -> Result<FinalContent, PipelineError> {
        let generator = &self.collaborators.generator;
        let generated = retry(
            "generate",
            &self.settings.retry.generate,
            Idempotency::Idempotent,
            |_| generator.generate(context),
        )
        .await;

        let candidate = match generated {
            Ok(candidate) => {
                self.report.generation_attempts = candidate.attempts;
                candidate.value
            }
            Err(error) => {
                self.report.generation_attempts = error.attempts;
                return self.generation_fallback(context, error);
            }
        };

        self.transition(Phase::Validating)?;
        let verdict = self
            .settings
            .validator
            .validate(context.prior_content.as_deref(), &candidate.content);
        self.report.verdict = Some(verdict.kind);

        let fallback = verdict.is_fallback();
        match verdict.content {
            Some(content) => {
                if fallback {
                    tracing::warn!(verdict = %verdict.kind, reason = %verdict.reason, "candidate rejected, keeping previous artifact");
                } else {
                    tracing::info!(bytes = content.len(), reason = %verdict.reason, "candidate accepted");
                }
                Ok(FinalContent { content, fallback })
            }
            None => Err(PipelineError::EmptyArtifact),
        }
    }

    /// Generation gave up: republish the previous artifact if one exists
    fn generation_fallback(
        &mut self,
        context: &GenerationContext,
        error: RetryError,
    ) -> Result<FinalContent, PipelineError> {
        match &context.prior_content {
            Some(prior) if error.exhausted() && !prior.is_empty() => {
                tracing::warn!(%error, "generation exhausted, republishing previous artifact");
                Ok(FinalContent {
                    content: prior.clone(),
                    fallback: true,
                })
            }
            _ => Err(PipelineError::Generation(error)),
        }
    }

    async fn publish(&mut self, content: &[u8]) -> Result<PublishReceipt, PipelineError> {
        self.transition(Phase::Publishing)?;
        let repo = &self.collaborators.repository;
        let id = &self.task.id;
        let published = retry(
            "publish",
            &self.settings.retry.publish,
            Idempotency::Idempotent,
            |_| repo.publish(id, content),
        )
        .await
        .map_err(PipelineError::Publish)?;

        tracing::info!(
            commit = %published.value.commit_ref,
            url = %published.value.public_url,
            attempts = published.attempts,
            "published"
        );
        Ok(published.value)
    }

    async fn notify(
        &mut self,
        receipt: PublishReceipt,
        status: NotificationStatus,
    ) -> Result<(), PipelineError> {
        self.transition(Phase::Notifying)?;
        let payload = NotificationPayload {
            task_id: self.task.id.clone(),
            round: self.task.round,
            nonce: self.task.nonce.clone(),
            commit_ref: receipt.commit_ref,
            public_url: receipt.public_url,
            status,
        };

        let notifier = &self.collaborators.notifier;
        let callback = &self.task.callback;
        let payload_ref = &payload;
        let notified = retry(
            "notify",
            &self.settings.retry.notify,
            Idempotency::Idempotent,
            |_| notifier.notify(callback, payload_ref),
        )
        .await;

        if let Err(error) = notified {
            // The deployment stands even if the evaluator is unreachable.
            tracing::error!(%error, callback = %callback, "evaluator notification failed");
            self.report.notification_failed = true;
            self.registry.mark_notification_failed(&self.report.key);
        }
        Ok(())
    }

    fn transition(&mut self, to: Phase) -> Result<(), PipelineError> {
        validate_transition(self.phase, to)?;
        tracing::debug!(from = ?self.phase, to = ?to, "transition");
        self.phase = to;
        self.registry.update(&self.report.key, to);
        Ok(())
    }
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("task", &self.task.key())
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
