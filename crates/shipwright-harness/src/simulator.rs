//! Shipwright Simulator
//!
//! Pushes a batch of synthetic tasks through a real [`ConcurrencyGate`] backed
//! by randomly misbehaving collaborators, then checks the engine's
//! invariants against what the collaborators observed:
//! - never more pipelines running than the gate capacity
//! - never an empty publish
//! - never a destructive shrink published on an update round
//! - never a notification without a publish
//! - every admitted task reaches a terminal phase

use crate::fixtures::{fast_policy, html, task};
use crate::scripted::{MemoryRepository, RecordingNotifier};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shipwright_core::{
    CallError, CandidateArtifact, Collaborators, ConcurrencyGate, EngineConfig, GenerationContext,
    Generator, Outcome, Phase,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Tasks to submit
    pub tasks: usize,
    /// Gate capacity
    pub capacity: usize,
    /// Fraction of tasks that are update rounds of a live artifact
    pub update_ratio: f64,
    /// Probability a generation attempt fails transiently
    pub transient_rate: f64,
    /// Probability a generation attempt fails permanently
    pub permanent_rate: f64,
    /// Probability a generation attempt returns a truncated artifact
    pub shrink_rate: f64,
    /// Upper bound of simulated generator latency
    pub max_latency: Duration,
    /// Destructive-shrink threshold
    pub shrink_threshold: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tasks: 200,
            capacity: 4,
            update_ratio: 0.5,
            transient_rate: 0.2,
            permanent_rate: 0.02,
            shrink_rate: 0.1,
            max_latency: Duration::from_millis(3),
            shrink_threshold: 0.5,
        }
    }
}

/// Generator with seeded random failures
#[derive(Debug)]
pub struct SimulatedGenerator {
    rng: Mutex<StdRng>,
    transient_rate: f64,
    permanent_rate: f64,
    shrink_rate: f64,
    max_latency: Duration,
}

impl SimulatedGenerator {
    /// Create generator from simulator settings
    #[must_use]
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            transient_rate: config.transient_rate.clamp(0.0, 1.0),
            permanent_rate: config.permanent_rate.clamp(0.0, 1.0),
            shrink_rate: config.shrink_rate.clamp(0.0, 1.0),
            max_latency: config.max_latency,
        }
    }
}

#[async_trait]
impl Generator for SimulatedGenerator {
    async fn generate(&self, context: &GenerationContext) -> Result<CandidateArtifact, CallError> {
        let (latency, roll, size) = {
            let mut rng = self.rng.lock();
            let max_ms = u64::try_from(self.max_latency.as_millis()).unwrap_or(u64::MAX);
            (
                Duration::from_millis(rng.random_range(0..=max_ms)),
                rng.random::<f64>(),
                rng.random_range(2_000..6_000usize),
            )
        };
        tokio::time::sleep(latency).await;

        let mut threshold = self.transient_rate;
        if roll < threshold {
            return Err(CallError::transient("simulated rate limit"));
        }
        threshold += self.permanent_rate;
        if roll < threshold {
            return Err(CallError::permanent("simulated content policy rejection"));
        }
        threshold += self.shrink_rate;
        if roll < threshold {
            return Ok(CandidateArtifact::new(html(size / 20)));
        }

        let content = match &context.prior_content {
            Some(prior) => {
                let mut updated = prior.clone();
                updated.extend_from_slice(b"<!-- revised -->");
                updated
            }
            None => html(size),
        };
        Ok(CandidateArtifact::new(content))
    }
}

/// A broken invariant
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// More pipelines ran at once than the gate allows
    CapacityExceeded {
        /// Observed peak
        peak: usize,
        /// Gate capacity
        capacity: usize,
    },
    /// Empty content reached the repository
    EmptyPublish {
        /// Task identifier
        task: String,
    },
    /// An update round published a destructive shrink
    DestructiveShrinkPublished {
        /// Task identifier
        task: String,
        /// Published / previous size
        ratio: f64,
    },
    /// Evaluator notified for a task that never published
    NotifiedWithoutPublish {
        /// Task identifier
        task: String,
    },
    /// Task never reached a terminal phase
    NotTerminal {
        /// Task key
        task: String,
        /// Phase it was stuck in
        phase: Phase,
    },
}

/// Statistics for simulation
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    /// Tasks offered to the gate
    pub submitted: usize,
    /// Tasks the gate refused
    pub rejected_at_admission: usize,
    /// Completed with freshly generated content
    pub succeeded: usize,
    /// Completed by republishing the previous artifact
    pub succeeded_with_fallback: usize,
    /// Terminated in Failed
    pub failed: usize,
    /// Successful publish calls
    pub publishes: usize,
    /// Delivered notifications
    pub notifications: usize,
    /// Most pipelines observed running at once
    pub peak_running: usize,
    /// Wall-clock duration
    pub elapsed_ms: u128,
}

/// Final report from simulator
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    /// Settings the run used
    pub config: SimulatorConfig,
    /// Counters
    pub stats: SimulatorStats,
    /// Broken invariants, empty on a clean run
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// Check if simulation passed all criteria
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Shipwright Simulator Report ===\n\n");
        report.push_str(&format!("Seed: {}\n", self.config.seed));
        report.push_str(&format!("Capacity: {}\n", self.config.capacity));
        report.push_str(&format!("Tasks Submitted: {}\n", self.stats.submitted));
        report.push_str(&format!("Rejected At Admission: {}\n", self.stats.rejected_at_admission));
        report.push_str(&format!("Succeeded: {}\n", self.stats.succeeded));
        report.push_str(&format!("Succeeded With Fallback: {}\n", self.stats.succeeded_with_fallback));
        report.push_str(&format!("Failed: {}\n", self.stats.failed));
        report.push_str(&format!("Publishes: {}\n", self.stats.publishes));
        report.push_str(&format!("Notifications: {}\n", self.stats.notifications));
        report.push_str(&format!("Peak Running: {}\n", self.stats.peak_running));
        report.push_str(&format!("Elapsed: {}ms\n", self.stats.elapsed_ms));
        report.push_str(&format!("Violations: {}\n", self.violations.len()));

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                report.push_str(&format!("{}. {:?}\n", i + 1, v));
            }
        }

        report.push_str(&format!(
            "\n=== Result: {} ===\n",
            if self.passed() { "PASS" } else { "FAIL" }
        ));

        report
    }
}

/// Run the Shipwright Simulator
///
/// Must be called from within a tokio runtime.
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let started = Instant::now();
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));

    let repository = Arc::new(MemoryRepository::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let generator = Arc::new(SimulatedGenerator::new(&config));

    let mut tasks = Vec::with_capacity(config.tasks);
    let mut priors = Vec::new();
    for i in 0..config.tasks {
        let id = format!("sim-{i:04}");
        if rng.random_bool(config.update_ratio.clamp(0.0, 1.0)) {
            let prior = html(rng.random_range(2_000..6_000usize));
            repository.seed(&id, prior.clone());
            priors.push((id.clone(), prior.len()));
            tasks.push(task(&id, 2));
        } else {
            tasks.push(task(&id, 1));
        }
    }

    let engine_config = EngineConfig::new()
        .with_capacity(config.capacity)
        .with_queue_capacity(config.tasks.max(1))
        .with_shrink_threshold(config.shrink_threshold)
        .with_uniform_retry(fast_policy(3));

    let collaborators = Collaborators::new(
        generator as _,
        Arc::clone(&repository) as _,
        Arc::clone(&notifier) as _,
    );
    let gate = ConcurrencyGate::start(&engine_config, collaborators);

    let mut stats = SimulatorStats::default();
    for t in tasks {
        stats.submitted += 1;
        if let Err(error) = gate.admit(t) {
            tracing::warn!(%error, "simulated task rejected");
            stats.rejected_at_admission += 1;
        }
    }

    gate.shutdown().await;

    let mut violations = Vec::new();
    let gate_stats = gate.stats();
    stats.peak_running = gate_stats.peak_running;
    if gate_stats.peak_running > config.capacity {
        violations.push(Violation::CapacityExceeded {
            peak: gate_stats.peak_running,
            capacity: config.capacity,
        });
    }

    for record in gate.registry().snapshot() {
        match &record.outcome {
            Some(Outcome::Success) => stats.succeeded += 1,
            Some(Outcome::SuccessWithFallback) => stats.succeeded_with_fallback += 1,
            Some(Outcome::Failed { .. }) => stats.failed += 1,
            None => violations.push(Violation::NotTerminal {
                task: record.key.to_string(),
                phase: record.phase,
            }),
        }
    }

    let publishes = repository.publishes();
    stats.publishes = publishes.len();
    let published: HashSet<String> = publishes.iter().map(|p| p.task_id.to_string()).collect();
    for event in &publishes {
        if event.content.is_empty() {
            violations.push(Violation::EmptyPublish {
                task: event.task_id.to_string(),
            });
        }
    }
    for (id, prior_len) in &priors {
        for event in publishes.iter().filter(|p| p.task_id.as_str() == id) {
            #[allow(clippy::cast_precision_loss)]
            let ratio = event.content.len() as f64 / *prior_len as f64;
            if ratio < config.shrink_threshold {
                violations.push(Violation::DestructiveShrinkPublished {
                    task: id.clone(),
                    ratio,
                });
            }
        }
    }

    let delivered = notifier.delivered();
    stats.notifications = delivered.len();
    for (_, payload) in delivered {
        if !published.contains(payload.task_id.as_str()) {
            violations.push(Violation::NotifiedWithoutPublish {
                task: payload.task_id.to_string(),
            });
        }
    }

    stats.elapsed_ms = started.elapsed().as_millis();
    SimulatorReport {
        config,
        stats,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_simulation_passes() {
        let report = run_simulator(SimulatorConfig {
            tasks: 60,
            ..SimulatorConfig::default()
        })
        .await;
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.submitted, 60);
        assert_eq!(
            report.stats.succeeded + report.stats.succeeded_with_fallback + report.stats.failed,
            60
        );
        assert!(report.stats.peak_running <= 4);
    }

    #[tokio::test]
    async fn hostile_generator_still_never_regresses() {
        let report = run_simulator(SimulatorConfig {
            tasks: 40,
            capacity: 3,
            update_ratio: 1.0,
            transient_rate: 0.5,
            permanent_rate: 0.0,
            shrink_rate: 0.4,
            ..SimulatorConfig::default()
        })
        .await;
        assert!(report.passed(), "{}", report.generate_text());
        // Every update round has a live artifact to fall back to.
        assert_eq!(report.stats.failed, 0);
    }

    #[test]
    fn report_text_mentions_result() {
        let report = SimulatorReport {
            config: SimulatorConfig::default(),
            stats: SimulatorStats::default(),
            violations: vec![Violation::EmptyPublish { task: "x".into() }],
        };
        let text = report.generate_text();
        assert!(text.contains("Result: FAIL"));
        assert!(text.contains("EmptyPublish"));
    }
}
