//! Round strategy
//!
//! Maps a round number to a generation flow and assembles the context for
//! that flow. Round 1 always regenerates from scratch; every later round is a
//! surgical update of the verbatim current artifact.

use crate::error::PipelineError;
use crate::types::{Flow, GenerationContext, ResolvedAttachment, Task};

/// Repository contents as seen by the pipeline before generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryState {
    /// No repository or no artifact yet
    Missing,
    /// Current artifact content
    Present(Vec<u8>),
}

impl From<Option<Vec<u8>>> for RepositoryState {
    fn from(value: Option<Vec<u8>>) -> Self {
        value.map_or(Self::Missing, Self::Present)
    }
}

/// Select the flow for a task
///
/// Pure function of the round number.
#[inline]
#[must_use]
pub fn plan_flow(task: &Task) -> Flow {
    flow_for_round(task.round)
}

/// Select the flow for a round number
#[inline]
#[must_use]
pub fn flow_for_round(round: u32) -> Flow {
    if round <= 1 {
        Flow::FullGeneration
    } else {
        Flow::SurgicalUpdate
    }
}

/// Build the generation context for `flow`
///
/// # Errors
/// `PipelineError::PriorArtifactMissing` when a surgical update has no
/// current artifact to work from.
pub fn build_context(
    flow: Flow,
    task: &Task,
    attachments: Vec<ResolvedAttachment>,
    repository: RepositoryState,
) -> Result<GenerationContext, PipelineError> {
    let prior_content = match (flow, repository) {
        (Flow::FullGeneration, _) => None,
        (Flow::SurgicalUpdate, RepositoryState::Present(content)) => Some(content),
        (Flow::SurgicalUpdate, RepositoryState::Missing) => {
            return Err(PipelineError::PriorArtifactMissing {
                round: task.round,
                reason: "repository has no published artifact".into(),
            });
        }
    };

    Ok(GenerationContext {
        flow,
        task_id: task.id.clone(),
        round: task.round,
        brief: task.brief.clone(),
        attachments,
        prior_content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use url::Url;

    fn task(round: u32) -> Task {
        Task::new(
            "calc",
            round,
            "build a calculator",
            Url::parse("https://eval.example/notify").unwrap(),
        )
    }

    #[test]
    fn first_round_is_full_generation_without_prior() {
        let t = task(1);
        let flow = plan_flow(&t);
        assert_eq!(flow, Flow::FullGeneration);

        // Existing content is ignored on round 1.
        let ctx = build_context(flow, &t, vec![], RepositoryState::Present(b"old".to_vec())).unwrap();
        assert!(ctx.prior_content.is_none());
        assert_eq!(ctx.brief, "build a calculator");
    }

    #[test]
    fn update_round_carries_verbatim_prior() {
        let t = task(2);
        let flow = plan_flow(&t);
        assert_eq!(flow, Flow::SurgicalUpdate);

        let ctx = build_context(flow, &t, vec![], RepositoryState::Present(b"<html>v1</html>".to_vec()))
            .unwrap();
        assert_eq!(ctx.prior_content.as_deref(), Some(&b"<html>v1</html>"[..]));
        assert_eq!(ctx.round, 2);
    }

    #[test]
    fn update_round_without_prior_is_permanent_error() {
        let t = task(3);
        let err = build_context(Flow::SurgicalUpdate, &t, vec![], RepositoryState::Missing).unwrap_err();
        assert!(matches!(err, PipelineError::PriorArtifactMissing { round: 3, .. }));
    }

    #[test]
    fn repository_state_from_option() {
        assert_eq!(RepositoryState::from(None), RepositoryState::Missing);
        assert_eq!(
            RepositoryState::from(Some(b"x".to_vec())),
            RepositoryState::Present(b"x".to_vec())
        );
    }

    proptest! {
        #[test]
        fn prop_round_determines_flow(round in 1u32..10_000) {
            let expected = if round == 1 { Flow::FullGeneration } else { Flow::SurgicalUpdate };
            prop_assert_eq!(plan_flow(&task(round)), expected);
        }
    }
}
