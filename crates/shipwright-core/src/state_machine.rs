//! Pipeline phase transition table

use crate::error::PipelineError;
use crate::types::Phase;

/// Validates a pipeline phase transition.
///
/// `Generating -> Publishing` is the generation-exhausted fallback on update
/// rounds; it skips validation because the content is the already-published
/// artifact.
///
/// # Errors
/// `PipelineError::IllegalTransition` if `to` is not reachable from `from`.
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), PipelineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(PipelineError::IllegalTransition { from, to })
    }
}

/// Phases reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Phase) -> Vec<Phase> {
    use Phase::{Admitted, Completed, Failed, Generating, Notifying, Publishing, Validating, Verifying};
    match from {
        Admitted => vec![Verifying, Failed],
        Verifying => vec![Generating, Failed],
        Generating => vec![Validating, Publishing, Failed],
        Validating => vec![Publishing, Failed],
        Publishing => vec![Notifying, Failed],
        Notifying => vec![Completed, Failed],
        Completed | Failed => vec![],
    }
}

fn allowed(from: Phase, to: Phase) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
