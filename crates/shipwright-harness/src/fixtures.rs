//! Task and configuration fixtures

use crate::scripted::{MemoryRepository, RecordingNotifier, ScriptedGenerator};
use shipwright_core::{Collaborators, EngineConfig, RetryPolicy, Task};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Evaluator address used by fixture tasks
pub const CALLBACK: &str = "https://eval.example/notify";

/// Task with a fixed brief and nonce
///
/// # Panics
/// Never; the callback constant is a valid URL.
#[must_use]
pub fn task(id: &str, round: u32) -> Task {
    let callback = Url::parse(CALLBACK).expect("fixture callback is valid");
    Task::new(id, round, "build a calculator", callback).with_nonce(format!("nonce-{id}-{round}"))
}

/// Task with a custom brief
#[must_use]
pub fn task_with_brief(id: &str, round: u32, brief: &str) -> Task {
    let mut t = task(id, round);
    t.brief = brief.to_string();
    t
}

/// HTML-ish content of exactly `len` bytes
#[must_use]
pub fn html(len: usize) -> Vec<u8> {
    const OPEN: &[u8] = b"<html>";
    const CLOSE: &[u8] = b"</html>";
    if len < OPEN.len() + CLOSE.len() {
        return vec![b'x'; len];
    }
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(OPEN);
    out.resize(len - CLOSE.len(), b'.');
    out.extend_from_slice(CLOSE);
    out
}

/// Retry policy that waits 1ms between attempts
#[must_use]
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), 2.0)
}

/// Engine configuration with fast retries everywhere
#[must_use]
pub fn fast_config(capacity: usize) -> EngineConfig {
    EngineConfig::new()
        .with_capacity(capacity)
        .with_uniform_retry(fast_policy(3))
}

/// Bundle scripted collaborators
#[must_use]
pub fn collaborators(
    generator: &Arc<ScriptedGenerator>,
    repository: &Arc<MemoryRepository>,
    notifier: &Arc<RecordingNotifier>,
) -> Collaborators {
    Collaborators::new(
        Arc::clone(generator) as _,
        Arc::clone(repository) as _,
        Arc::clone(notifier) as _,
    )
}
