//! Concurrency gate
//!
//! Admission control in front of the task pipelines:
//! - `admit` acknowledges immediately and enqueues the task
//! - a fixed pool of `capacity` workers drains one bounded FIFO queue
//! - a full queue refuses admission instead of growing without bound
//! - queued or verifying tasks can be cancelled
//! - finished pipelines are reported on an opt-in, bounded stream

use crate::backend::Collaborators;
use crate::config::EngineConfig;
use crate::error::GateError;
use crate::pipeline::{PipelineReport, PipelineSettings, TaskPipeline};
use crate::registry::TaskRegistry;
use crate::types::{Outcome, Task, TaskKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Acknowledgment returned by [`ConcurrencyGate::admit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Task identifier and round
    pub key: TaskKey,
    /// Correlation token echoed to the evaluator
    pub nonce: String,
    /// Admission time
    pub admitted_at: DateTime<Utc>,
}

/// Gate statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Maximum concurrent pipelines
    pub capacity: usize,
    /// Pipelines currently running
    pub running: usize,
    /// Tasks waiting for a worker
    pub queued: usize,
    /// Highest number of pipelines ever running at once
    pub peak_running: usize,
    /// Tasks admitted since start
    pub admitted_total: u64,
}

struct Queued {
    task: Task,
    seq: u64,
    cancel: CancellationToken,
}

/// State shared by every worker
struct WorkerContext {
    registry: Arc<TaskRegistry>,
    collaborators: Collaborators,
    settings: Arc<PipelineSettings>,
    /// Cancel handle per key, tagged with the admission that owns it
    cancels: DashMap<TaskKey, (u64, CancellationToken)>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    reports: Mutex<Option<mpsc::Sender<PipelineReport>>>,
}

impl WorkerContext {
    fn publish_report(&self, report: PipelineReport) {
        let Some(sender) = self.reports.lock().clone() else {
            return;
        };
        match sender.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                tracing::warn!(task = %report.key, "report stream full, dropping report");
            }
            Err(TrySendError::Closed(_)) => {
                *self.reports.lock() = None;
            }
        }
    }
}

/// Bounded admission control over a fixed worker pool
pub struct ConcurrencyGate {
    sender: Mutex<Option<mpsc::Sender<Queued>>>,
    context: Arc<WorkerContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reports_taken: AtomicBool,
    capacity: usize,
    queue_capacity: usize,
    admitted_total: AtomicU64,
}

impl ConcurrencyGate {
    /// Start the worker pool
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: &EngineConfig, collaborators: Collaborators) -> Self {
        let registry = Arc::new(TaskRegistry::new(&config.registry));
        Self::start_with_registry(config, collaborators, registry)
    }

    /// Start the worker pool recording into an existing registry
    #[must_use]
    pub fn start_with_registry(
        config: &EngineConfig,
        collaborators: Collaborators,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let capacity = config.gate.capacity.max(1);
        let queue_capacity = config.gate.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity);

        let context = Arc::new(WorkerContext {
            registry,
            collaborators,
            settings: Arc::new(PipelineSettings::from_config(config)),
            cancels: DashMap::new(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            reports: Mutex::new(None),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..capacity)
            .map(|worker| tokio::spawn(worker_loop(worker, Arc::clone(&rx), Arc::clone(&context))))
            .collect();

        tracing::info!(capacity, queue_capacity, "concurrency gate started");

        Self {
            sender: Mutex::new(Some(tx)),
            context,
            workers: Mutex::new(workers),
            reports_taken: AtomicBool::new(false),
            capacity,
            queue_capacity,
            admitted_total: AtomicU64::new(0),
        }
    }

    /// Accept a task for asynchronous processing
    ///
    /// Returns as soon as the task is queued; processing happens on a worker.
    ///
    /// # Errors
    /// - `GateError::InvalidTask` if the brief fails validation
    /// - `GateError::Closed` after [`close`](Self::close)
    /// - `GateError::QueueFull` if the queue is at capacity
    /// - `GateError::Duplicate` if the same task and round is in flight
    pub fn admit(&self, task: Task) -> Result<Admission, GateError> {
        task.validate()?;

        let sender = self.sender.lock().clone().ok_or(GateError::Closed)?;
        let permit = sender.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => GateError::QueueFull(self.queue_capacity),
            TrySendError::Closed(()) => GateError::Closed,
        })?;

        let key = task.key();
        let record = self.context.registry.try_record(key.clone())?;

        // A finished run of the same key may still be unwinding on a worker;
        // the sequence number keeps it from removing this admission's handle.
        let seq = self.admitted_total.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.context.cancels.insert(key.clone(), (seq, cancel.clone()));
        let nonce = task.nonce.clone();
        permit.send(Queued { task, seq, cancel });

        tracing::info!(task = %key.id, round = key.round, "task admitted");
        Ok(Admission {
            key,
            nonce,
            admitted_at: record.started_at,
        })
    }

    /// Cancel a task that has not started generating
    ///
    /// Returns `false` if the task is unknown or already finished. A task
    /// already past verification ignores the request.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        match self.context.cancels.get(key) {
            Some(entry) => {
                entry.1.cancel();
                tracing::info!(task = %key.id, round = key.round, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Stop accepting tasks; queued tasks still run
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            tracing::info!("concurrency gate closed");
        }
    }

    /// Close intake and wait for every queued and running pipeline
    pub async fn shutdown(&self) {
        self.close();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            if let Err(error) = result {
                tracing::error!(%error, "worker terminated abnormally");
            }
        }
        tracing::info!("concurrency gate drained");
    }

    /// Subscribe to the stream of finished pipeline reports
    ///
    /// Only the first call returns a receiver. Pipelines that finished before
    /// the call are not reported. The stream holds `capacity + queue_capacity`
    /// reports; while it is full, further reports are dropped with a warning.
    /// Dropping the receiver ends the subscription.
    pub fn take_reports(&self) -> Option<mpsc::Receiver<PipelineReport>> {
        if self.reports_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.capacity + self.queue_capacity);
        *self.context.reports.lock() = Some(tx);
        Some(rx)
    }

    /// Shared task registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.context.registry)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> GateStats {
        let queued = self
            .sender
            .lock()
            .as_ref()
            .map_or(0, |s| s.max_capacity() - s.capacity());
        GateStats {
            capacity: self.capacity,
            running: self.context.running.load(Ordering::SeqCst),
            queued,
            peak_running: self.context.peak_running.load(Ordering::SeqCst),
            admitted_total: self.admitted_total.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("capacity", &self.capacity)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>,
    ctx: Arc<WorkerContext>,
) {
    tracing::debug!(worker, "worker started");
    loop {
        // Holding the lock while waiting keeps dequeue order FIFO across workers.
        let next = queue.lock().await.recv().await;
        let Some(Queued { task, seq, cancel }) = next else {
            break;
        };
        let key = task.key();

        let running = ctx.running.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.peak_running.fetch_max(running, Ordering::SeqCst);

        let pipeline = TaskPipeline::new(
            task,
            Arc::clone(&ctx.registry),
            ctx.collaborators.clone(),
            Arc::clone(&ctx.settings),
            cancel,
        );

        // A panicking pipeline must not take the worker slot with it.
        let report = match tokio::spawn(pipeline.run()).await {
            Ok(report) => report,
            Err(error) => {
                tracing::error!(worker, task = %key, %error, "pipeline aborted");
                let reason = format!("pipeline aborted: {error}");
                ctx.registry.complete(&key, Outcome::Failed { reason: reason.clone() });
                PipelineReport {
                    key: key.clone(),
                    outcome: Outcome::Failed { reason },
                    flow: None,
                    generation_attempts: 0,
                    verdict: None,
                    receipt: None,
                    notification_failed: false,
                }
            }
        };

        ctx.cancels.remove_if(&key, |_, (owner, _)| *owner == seq);
        ctx.publish_report(report);
        ctx.running.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!(worker, "worker stopped");
}
