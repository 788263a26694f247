//! Scripted collaborators
//!
//! In-memory stand-ins for the generator, repository, notifier and fetcher.
//! Each one replays a queue of scripted responses and records every call so
//! tests can assert on ordering and content.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use shipwright_core::{
    AttachmentFetcher, CallError, CandidateArtifact, GenerationContext, Generator,
    NotificationPayload, Notifier, PublishReceipt, RepositoryBackend, TaskId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

/// Generator replaying a queue of responses
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Vec<u8>, CallError>>>,
    exhausted: Result<Vec<u8>, CallError>,
    delay: Duration,
    contexts: Mutex<Vec<GenerationContext>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedGenerator {
    /// Empty script; calls past the end fail permanently
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            exhausted: Err(CallError::permanent("generator script exhausted")),
            delay: Duration::ZERO,
            contexts: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Always return `content`
    #[must_use]
    pub fn always(content: impl Into<Vec<u8>>) -> Self {
        Self::new().then_always(Ok(content.into()))
    }

    /// Append a successful response
    #[must_use]
    pub fn then_ok(self, content: impl Into<Vec<u8>>) -> Self {
        self.script.lock().push_back(Ok(content.into()));
        self
    }

    /// Append a failure
    #[must_use]
    pub fn then_err(self, error: CallError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Response once the script runs out
    #[must_use]
    pub fn then_always(mut self, response: Result<Vec<u8>, CallError>) -> Self {
        self.exhausted = response;
        self
    }

    /// Sleep this long inside every call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Contexts received, in call order
    #[must_use]
    pub fn contexts(&self) -> Vec<GenerationContext> {
        self.contexts.lock().clone()
    }

    /// Number of calls made
    #[must_use]
    pub fn calls(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Highest number of overlapping calls observed
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts a call as active until dropped, including when a timeout drops it
struct ActiveCall<'a>(&'a AtomicUsize);

impl<'a> ActiveCall<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, context: &GenerationContext) -> Result<CandidateArtifact, CallError> {
        self.contexts.lock().push(context.clone());
        let _active = ActiveCall::enter(&self.active, &self.peak);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.exhausted.clone());

        response.map(CandidateArtifact::new)
    }
}

/// One call to [`MemoryRepository::publish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEvent {
    /// Task published
    pub task_id: TaskId,
    /// Content-derived commit reference
    pub commit_ref: String,
    /// Published bytes
    pub content: Vec<u8>,
    /// `false` when identical content was already live
    pub changed: bool,
}

#[derive(Debug, Default)]
struct RepoState {
    artifacts: HashMap<TaskId, Vec<u8>>,
    publishes: Vec<PublishEvent>,
    fetch_calls: usize,
    publish_attempts: usize,
}

/// Repository keeping one artifact per task in memory
///
/// Commit references are derived from content, so republishing identical
/// content yields the same reference.
#[derive(Debug)]
pub struct MemoryRepository {
    state: Mutex<RepoState>,
    fetch_failures: Mutex<VecDeque<CallError>>,
    publish_failures: Mutex<VecDeque<CallError>>,
    pages_base: String,
}

impl MemoryRepository {
    /// Empty repository
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RepoState::default()),
            fetch_failures: Mutex::new(VecDeque::new()),
            publish_failures: Mutex::new(VecDeque::new()),
            pages_base: "https://pages.example".to_string(),
        }
    }

    /// With a live artifact for `task_id`
    #[must_use]
    pub fn with_artifact(self, task_id: &str, content: impl Into<Vec<u8>>) -> Self {
        self.seed(task_id, content);
        self
    }

    /// Store a live artifact for `task_id`
    pub fn seed(&self, task_id: &str, content: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .artifacts
            .insert(TaskId::new(task_id), content.into());
    }

    /// Fail the next fetches with these errors, in order
    #[must_use]
    pub fn failing_fetch(self, errors: impl IntoIterator<Item = CallError>) -> Self {
        self.fetch_failures.lock().extend(errors);
        self
    }

    /// Fail the next publishes with these errors, in order
    #[must_use]
    pub fn failing_publish(self, errors: impl IntoIterator<Item = CallError>) -> Self {
        self.publish_failures.lock().extend(errors);
        self
    }

    /// Live artifact for `task_id`
    #[must_use]
    pub fn current(&self, task_id: &str) -> Option<Vec<u8>> {
        self.state.lock().artifacts.get(&TaskId::new(task_id)).cloned()
    }

    /// Successful publishes, in order
    #[must_use]
    pub fn publishes(&self) -> Vec<PublishEvent> {
        self.state.lock().publishes.clone()
    }

    /// Number of fetch calls, including failed ones
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetch_calls
    }

    /// Number of publish calls, including failed ones
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.state.lock().publish_attempts
    }

    fn commit_ref(content: &[u8]) -> String {
        let digest = Sha256::digest(content);
        hex::encode(&digest[..20])
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepositoryBackend for MemoryRepository {
    async fn fetch_current(&self, task_id: &TaskId) -> Result<Option<Vec<u8>>, CallError> {
        self.state.lock().fetch_calls += 1;
        if let Some(error) = self.fetch_failures.lock().pop_front() {
            return Err(error);
        }
        Ok(self.state.lock().artifacts.get(task_id).cloned())
    }

    async fn publish(&self, task_id: &TaskId, content: &[u8]) -> Result<PublishReceipt, CallError> {
        self.state.lock().publish_attempts += 1;
        if let Some(error) = self.publish_failures.lock().pop_front() {
            return Err(error);
        }

        let commit_ref = Self::commit_ref(content);
        let mut state = self.state.lock();
        let changed = state.artifacts.get(task_id).map(Vec::as_slice) != Some(content);
        if changed {
            state.artifacts.insert(task_id.clone(), content.to_vec());
        }
        state.publishes.push(PublishEvent {
            task_id: task_id.clone(),
            commit_ref: commit_ref.clone(),
            content: content.to_vec(),
            changed,
        });

        Ok(PublishReceipt {
            commit_ref,
            public_url: format!("{}/{}/", self.pages_base, task_id),
        })
    }
}

/// Notifier recording every payload
#[derive(Debug)]
pub struct RecordingNotifier {
    failures: Mutex<VecDeque<CallError>>,
    always_fail: Option<CallError>,
    delivered: Mutex<Vec<(Url, NotificationPayload)>>,
    attempts: AtomicUsize,
}

impl RecordingNotifier {
    /// Notifier that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next calls with these errors, in order
    #[must_use]
    pub fn failing(self, errors: impl IntoIterator<Item = CallError>) -> Self {
        self.failures.lock().extend(errors);
        self
    }

    /// Fail every call
    #[must_use]
    pub fn unreachable(mut self, error: CallError) -> Self {
        self.always_fail = Some(error);
        self
    }

    /// Delivered payloads, in order
    #[must_use]
    pub fn delivered(&self) -> Vec<(Url, NotificationPayload)> {
        self.delivered.lock().clone()
    }

    /// Number of calls, including failed ones
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, callback: &Url, payload: &NotificationPayload) -> Result<(), CallError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.always_fail {
            return Err(error.clone());
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.delivered.lock().push((callback.clone(), payload.clone()));
        Ok(())
    }
}

/// Fetcher serving a fixed set of addresses
#[derive(Debug, Default)]
pub struct StaticFetcher {
    files: HashMap<String, Vec<u8>>,
}

impl StaticFetcher {
    /// Empty fetcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `content` at `url`
    #[must_use]
    pub fn with_file(mut self, url: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(url.to_string(), content.into());
        self
    }
}

#[async_trait]
impl AttachmentFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, CallError> {
        self.files
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| CallError::permanent(format!("404 for {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn repository_publish_is_idempotent_by_content() {
        let repo = MemoryRepository::new();
        let id = TaskId::new("calc");

        let first = repo.publish(&id, b"<html>v1</html>").await.unwrap();
        let second = repo.publish(&id, b"<html>v1</html>").await.unwrap();
        assert_eq!(first, second);

        let events = repo.publishes();
        assert!(events[0].changed);
        assert!(!events[1].changed);
        assert_eq!(repo.current("calc").unwrap(), b"<html>v1</html>");
    }

    #[tokio::test]
    async fn generator_replays_script_then_fallback() {
        let generator = ScriptedGenerator::new()
            .then_err(CallError::transient("429"))
            .then_ok("page")
            .then_always(Err(CallError::permanent("done")));
        let ctx = GenerationContext {
            flow: shipwright_core::Flow::FullGeneration,
            task_id: TaskId::new("t"),
            round: 1,
            brief: "b".into(),
            attachments: vec![],
            prior_content: None,
        };

        assert!(generator.generate(&ctx).await.is_err());
        assert_eq!(generator.generate(&ctx).await.unwrap().content, b"page");
        assert_eq!(
            generator.generate(&ctx).await.unwrap_err(),
            CallError::permanent("done")
        );
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn timed_out_call_is_no_longer_counted_active() {
        let generator = ScriptedGenerator::always("page").with_delay(Duration::from_millis(200));
        let ctx = GenerationContext {
            flow: shipwright_core::Flow::FullGeneration,
            task_id: TaskId::new("t"),
            round: 1,
            brief: "b".into(),
            attachments: vec![],
            prior_content: None,
        };

        let timed_out =
            tokio::time::timeout(Duration::from_millis(5), generator.generate(&ctx)).await;
        assert!(timed_out.is_err());

        // With the first call dropped, a second one is the only one in flight.
        generator.generate(&ctx).await.unwrap();
        assert_eq!(generator.peak_concurrency(), 1);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_precede_success() {
        let repo = MemoryRepository::new()
            .with_artifact("t", "old")
            .failing_fetch([CallError::transient("502")]);
        let id = TaskId::new("t");
        assert!(repo.fetch_current(&id).await.is_err());
        assert_eq!(repo.fetch_current(&id).await.unwrap().unwrap(), b"old");
        assert_eq!(repo.fetch_calls(), 2);
    }
}
