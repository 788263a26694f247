//! Concurrency gate behaviour under load.
//!
//! Core guarantees exercised here:
//! - No more than `capacity` pipelines run at once.
//! - Queued tasks start in admission order.
//! - Admission is refused, not silently dropped, when the queue is full,
//!   the gate is closed, or the same task and round is already in flight.
//! - Every admitted task reaches a terminal phase.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use shipwright_core::{
    CallError, CandidateArtifact, Collaborators, ConcurrencyGate, GateError, GenerationContext,
    Generator, Outcome, Phase, TaskKey,
};
use shipwright_harness::fixtures::{collaborators, fast_config, html, task, task_with_brief};
use shipwright_harness::{MemoryRepository, RecordingNotifier, ScriptedGenerator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    generator: Arc<ScriptedGenerator>,
    repository: Arc<MemoryRepository>,
    notifier: Arc<RecordingNotifier>,
}

impl Rig {
    fn new(delay: Duration) -> Self {
        Self {
            generator: Arc::new(ScriptedGenerator::always(html(4000)).with_delay(delay)),
            repository: Arc::new(MemoryRepository::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        collaborators(&self.generator, &self.repository, &self.notifier)
    }
}

/// Poll until `condition` holds, failing the test after two seconds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

/// Tenet: the gate never runs more pipelines than its capacity.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_pipelines_never_exceed_capacity() {
    let rig = Rig::new(Duration::from_millis(20));
    let gate = ConcurrencyGate::start(&fast_config(3), rig.collaborators());

    // Count records that report an active phase, as an observer would see them.
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let registry = gate.registry();
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut peak = 0;
            while !stop.load(Ordering::SeqCst) {
                let active = registry
                    .snapshot()
                    .iter()
                    .filter(|r| !r.is_terminal() && r.phase != Phase::Admitted)
                    .count();
                peak = peak.max(active);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            peak
        })
    };

    for i in 0..12 {
        gate.admit(task(&format!("app-{i}"), 1)).unwrap();
    }
    gate.shutdown().await;
    stop.store(true, Ordering::SeqCst);
    let reported_peak = sampler.await.unwrap();
    assert!(reported_peak <= 3, "{reported_peak} pipelines reported active phases");
    assert!(reported_peak > 0);

    let stats = gate.stats();
    assert!(stats.peak_running <= 3, "peak {}", stats.peak_running);
    assert!(rig.generator.peak_concurrency() <= 3);
    assert!(rig.generator.peak_concurrency() > 1);
    assert_eq!(stats.admitted_total, 12);
    assert_eq!(stats.running, 0);

    let registry = gate.registry();
    assert_eq!(registry.len(), 12);
    assert_eq!(registry.in_flight(), 0);
    assert!(registry
        .snapshot()
        .iter()
        .all(|r| r.phase == Phase::Completed && r.outcome == Some(Outcome::Success)));
    assert_eq!(rig.notifier.delivered().len(), 12);
}

/// Tenet: with a single slot, tasks start in the order they were admitted.
#[tokio::test]
async fn queued_tasks_start_in_admission_order() {
    let rig = Rig::new(Duration::from_millis(2));
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());

    let ids = ["first", "second", "third", "fourth", "fifth"];
    for id in ids {
        gate.admit(task(id, 1)).unwrap();
    }
    gate.shutdown().await;

    let started: Vec<String> = rig
        .generator
        .contexts()
        .iter()
        .map(|c| c.task_id.to_string())
        .collect();
    assert_eq!(started, ids);
}

/// Tenet: admission acknowledges immediately with the task's key and nonce.
#[tokio::test]
async fn admission_echoes_key_and_nonce() {
    let rig = Rig::new(Duration::from_millis(50));
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());

    let admission = gate.admit(task("calc", 1)).unwrap();
    assert_eq!(admission.key, TaskKey::new("calc", 1));
    assert_eq!(admission.nonce, "nonce-calc-1");
    assert!(!gate.registry().get(&admission.key).unwrap().is_terminal());

    gate.shutdown().await;
}

/// Tenet: a full queue refuses admission instead of growing.
#[tokio::test]
async fn full_queue_refuses_admission() {
    let rig = Rig::new(Duration::from_millis(200));
    let config = fast_config(1).with_queue_capacity(1);
    let gate = ConcurrencyGate::start(&config, rig.collaborators());

    gate.admit(task("running", 1)).unwrap();
    wait_until(|| gate.stats().running == 1).await;
    gate.admit(task("queued", 1)).unwrap();

    let refused = gate.admit(task("overflow", 1));
    assert!(matches!(refused, Err(GateError::QueueFull(1))), "{refused:?}");
    assert!(gate.registry().get(&TaskKey::new("overflow", 1)).is_none());

    gate.shutdown().await;
    assert_eq!(gate.registry().len(), 2);
}

/// Tenet: the same task and round cannot be in flight twice.
#[tokio::test]
async fn duplicate_in_flight_round_is_refused() {
    let rig = Rig::new(Duration::from_millis(100));
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());

    gate.admit(task("calc", 1)).unwrap();
    let again = gate.admit(task("calc", 1));
    assert!(matches!(again, Err(GateError::Duplicate(_))), "{again:?}");

    // A different round of the same task is a different key.
    gate.admit(task("calc", 2)).unwrap();
    gate.shutdown().await;

    // Once finished, the round may be resubmitted.
    let registry = gate.registry();
    let gate = ConcurrencyGate::start_with_registry(&fast_config(1), rig.collaborators(), registry);
    gate.admit(task("calc", 1)).unwrap();
    gate.shutdown().await;
    assert_eq!(rig.generator.calls(), 3);
}

/// Tenet: a resubmitted round stays cancellable while it waits for a slot.
#[tokio::test]
async fn resubmitted_round_is_cancellable_while_queued() {
    let rig = Rig::new(Duration::from_millis(50));
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());
    let registry = gate.registry();

    let first = gate.admit(task("calc", 1)).unwrap();
    wait_until(|| registry.get(&first.key).is_some_and(|r| r.is_terminal())).await;

    gate.admit(task("blocker", 1)).unwrap();
    let again = gate.admit(task("calc", 1)).unwrap();
    // Let the worker that ran the first submission finish unwinding.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(gate.cancel(&again.key));

    gate.shutdown().await;
    assert_eq!(
        registry.get(&again.key).unwrap().outcome,
        Some(Outcome::Failed {
            reason: "cancelled".into()
        })
    );
    assert_eq!(rig.generator.calls(), 2);
    assert_eq!(rig.notifier.delivered().len(), 2);
}

/// Tenet: malformed briefs are rejected at the door.
#[tokio::test]
async fn invalid_task_is_rejected_synchronously() {
    let rig = Rig::new(Duration::ZERO);
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());

    let refused = gate.admit(task_with_brief("calc", 1, "   "));
    assert!(matches!(refused, Err(GateError::InvalidTask(_))), "{refused:?}");
    assert!(gate.registry().is_empty());

    gate.shutdown().await;
    assert_eq!(rig.generator.calls(), 0);
}

/// Tenet: a closed gate refuses new work but finishes what it accepted.
#[tokio::test]
async fn closed_gate_refuses_but_drains() {
    let rig = Rig::new(Duration::from_millis(10));
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());

    gate.admit(task("a", 1)).unwrap();
    gate.admit(task("b", 1)).unwrap();
    gate.close();

    assert!(matches!(gate.admit(task("c", 1)), Err(GateError::Closed)));

    gate.shutdown().await;
    assert_eq!(rig.generator.calls(), 2);
    assert_eq!(gate.registry().in_flight(), 0);
}

/// Tenet: a task cancelled while queued never reaches a collaborator.
#[tokio::test]
async fn cancelling_a_queued_task_skips_all_work() {
    let rig = Rig::new(Duration::from_millis(100));
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());

    gate.admit(task("blocker", 1)).unwrap();
    let queued = gate.admit(task("doomed", 1)).unwrap();
    assert!(gate.cancel(&queued.key));

    gate.shutdown().await;

    let record = gate.registry().get(&queued.key).unwrap();
    assert_eq!(record.phase, Phase::Failed);
    assert_eq!(rig.generator.calls(), 1);
    assert_eq!(rig.repository.publishes().len(), 1);
    assert_eq!(rig.notifier.delivered().len(), 1);
    assert!(!gate.cancel(&queued.key));
}

#[tokio::test]
async fn cancelling_unknown_task_is_a_no_op() {
    let rig = Rig::new(Duration::ZERO);
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());
    assert!(!gate.cancel(&TaskKey::new("ghost", 1)));
    gate.shutdown().await;
}

/// Tenet: every finished pipeline is reported exactly once.
#[tokio::test]
async fn reports_stream_one_entry_per_task() {
    let rig = Rig::new(Duration::ZERO);
    let gate = ConcurrencyGate::start(&fast_config(2), rig.collaborators());
    let mut reports = gate.take_reports().unwrap();
    assert!(gate.take_reports().is_none());

    for id in ["x", "y", "z"] {
        gate.admit(task(id, 1)).unwrap();
    }
    gate.shutdown().await;

    let mut keys = Vec::new();
    while let Ok(report) = reports.try_recv() {
        assert_eq!(report.outcome, Outcome::Success);
        keys.push(report.key.id.to_string());
    }
    keys.sort();
    assert_eq!(keys, ["x", "y", "z"]);
}

/// Tenet: nothing is buffered for a subscriber that does not exist yet.
#[tokio::test]
async fn reports_before_subscription_are_not_kept() {
    let rig = Rig::new(Duration::ZERO);
    let gate = ConcurrencyGate::start(&fast_config(1), rig.collaborators());
    let registry = gate.registry();

    let early = gate.admit(task("early", 1)).unwrap();
    wait_until(|| {
        registry.get(&early.key).is_some_and(|r| r.is_terminal()) && gate.stats().running == 0
    })
    .await;

    let mut reports = gate.take_reports().unwrap();
    gate.admit(task("late", 1)).unwrap();
    gate.shutdown().await;

    let keys: Vec<String> = std::iter::from_fn(|| reports.try_recv().ok())
        .map(|r| r.key.id.to_string())
        .collect();
    assert_eq!(keys, ["late"]);
}

/// Tenet: an idle subscriber holds a bounded number of reports.
#[tokio::test]
async fn idle_subscriber_receives_bounded_reports() {
    let rig = Rig::new(Duration::ZERO);
    let config = fast_config(1).with_queue_capacity(1);
    let gate = ConcurrencyGate::start(&config, rig.collaborators());
    let registry = gate.registry();
    let mut reports = gate.take_reports().unwrap();

    for id in ["a", "b", "c", "d", "e"] {
        let admission = gate.admit(task(id, 1)).unwrap();
        wait_until(|| {
            registry.get(&admission.key).is_some_and(|r| r.is_terminal())
                && gate.stats().running == 0
        })
        .await;
    }
    gate.shutdown().await;

    let keys: Vec<String> = std::iter::from_fn(|| reports.try_recv().ok())
        .map(|r| r.key.id.to_string())
        .collect();
    assert_eq!(keys, ["a", "b"]);
    assert_eq!(registry.in_flight(), 0);
    assert_eq!(rig.generator.calls(), 5);
}

/// Generator that panics on a marked brief.
struct Volatile;

#[async_trait]
impl Generator for Volatile {
    async fn generate(&self, context: &GenerationContext) -> Result<CandidateArtifact, CallError> {
        assert!(!context.brief.contains("boom"), "generator crashed");
        Ok(CandidateArtifact::new(html(4000)))
    }
}

/// Tenet: a crashing pipeline fails its task but not its worker.
#[tokio::test]
async fn panicking_pipeline_does_not_kill_worker() {
    let rig = Rig::new(Duration::ZERO);
    let collaborators = Collaborators::new(
        Arc::new(Volatile),
        Arc::clone(&rig.repository) as _,
        Arc::clone(&rig.notifier) as _,
    );
    let gate = ConcurrencyGate::start(&fast_config(1), collaborators);

    let crashed = gate.admit(task_with_brief("crash", 1, "boom")).unwrap();
    let healthy = gate.admit(task("healthy", 1)).unwrap();
    gate.shutdown().await;

    let registry = gate.registry();
    match registry.get(&crashed.key).unwrap().outcome {
        Some(Outcome::Failed { reason }) => assert!(reason.contains("aborted"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(registry.get(&healthy.key).unwrap().outcome, Some(Outcome::Success));
}
