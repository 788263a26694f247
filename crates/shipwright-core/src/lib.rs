//! Shipwright Core - task orchestration and update-safety engine
//!
//! Takes task briefs for LLM-generated web applications and:
//! - Bounds how many tasks run at once, queuing the rest FIFO
//! - Chooses full generation (round 1) or surgical update (round >= 2)
//! - Retries unreliable external calls with exponential backoff
//! - Refuses to replace a working deployment with an empty or drastically
//!   shrunken artifact, republishing the previous one instead
//! - Publishes, then notifies the evaluator exactly once
//!
//! # Example
//!
//! ```rust,ignore
//! use shipwright_core::prelude::*;
//!
//! # async fn example(collaborators: Collaborators, task: Task) -> Result<(), GateError> {
//! let config = EngineConfig::new().with_capacity(2);
//! let gate = ConcurrencyGate::start(&config, collaborators);
//!
//! let admission = gate.admit(task)?;
//! println!("admitted {}", admission.key);
//!
//! gate.shutdown().await;
//! for record in gate.registry().snapshot() {
//!     println!("{} {:?}", record.key, record.phase);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod attachments;
pub mod backend;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod state_machine;
pub mod strategy;
pub mod types;
pub mod validator;

// Re-exports for convenience
pub use backend::{AttachmentFetcher, Collaborators, Generator, InlineOnly, Notifier, RepositoryBackend};
pub use config::{EngineConfig, GateConfig, LogFormat, LoggingConfig, RegistryConfig, RetryConfig, SafetyConfig};
pub use error::{CallError, ConfigError, GateError, IntakeError, PipelineError, RetryError};
pub use gate::{Admission, ConcurrencyGate, GateStats};
pub use pipeline::{PipelineReport, PipelineSettings, TaskPipeline};
pub use registry::{TaskRecord, TaskRegistry};
pub use retry::{retry, Idempotency, Retried, RetryPolicy};
pub use strategy::{build_context, plan_flow, RepositoryState};
pub use types::{
    Attachment, CandidateArtifact, Flow, GenerationContext, NotificationPayload,
    NotificationStatus, Outcome, Phase, PublishReceipt, ResolvedAttachment, Task, TaskId, TaskKey,
};
pub use validator::{SafetyValidator, ValidationVerdict, VerdictKind};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Shipwright Core
    pub use crate::{
        Admission, CallError, Collaborators, ConcurrencyGate, EngineConfig, GateError, Generator,
        Notifier, Outcome, Phase, RepositoryBackend, Task, TaskKey, TaskRegistry,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
