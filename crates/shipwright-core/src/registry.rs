//! Task registry
//!
//! Process-wide record of in-flight and recently finished tasks. Records are
//! sharded in a [`DashMap`] so status readers only ever hold one shard's read
//! lock at a time; eviction bookkeeping sits behind a separate mutex that
//! readers never touch.

use crate::config::RegistryConfig;
use crate::error::GateError;
use crate::types::{Outcome, Phase, TaskKey};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Registry entry for one task round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier and round
    pub key: TaskKey,
    /// Current phase
    pub phase: Phase,
    /// Admission time
    pub started_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
    /// Terminal outcome, once finished
    pub outcome: Option<Outcome>,
    /// Evaluator could not be reached
    pub notification_failed: bool,
}

impl TaskRecord {
    fn admitted(key: TaskKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            phase: Phase::Admitted,
            started_at: now,
            updated_at: now,
            outcome: None,
            notification_failed: false,
        }
    }

    /// Check if record is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[derive(Debug, Default)]
struct Retention {
    /// Terminal records in completion order
    finished: VecDeque<(TaskKey, DateTime<Utc>)>,
    last_completed: Option<TaskKey>,
}

/// Thread-safe task registry
#[derive(Debug)]
pub struct TaskRegistry {
    records: DashMap<TaskKey, TaskRecord>,
    retention: Mutex<Retention>,
    max_records: usize,
    max_age: chrono::Duration,
}

impl TaskRegistry {
    /// Create registry with retention limits
    #[must_use]
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            records: DashMap::new(),
            retention: Mutex::new(Retention::default()),
            max_records: config.max_records.max(1),
            max_age: chrono::Duration::from_std(config.max_age())
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Record a newly admitted task, replacing any earlier record for the key
    pub fn record(&self, key: TaskKey) -> TaskRecord {
        let record = TaskRecord::admitted(key.clone(), Utc::now());
        self.records.insert(key, record.clone());
        record
    }

    /// Record a newly admitted task unless the same key is still in flight
    ///
    /// # Errors
    /// `GateError::Duplicate` if a non-terminal record exists for `key`.
    pub fn try_record(&self, key: TaskKey) -> Result<TaskRecord, GateError> {
        let record = TaskRecord::admitted(key.clone(), Utc::now());
        match self.records.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_terminal() => {
                Err(GateError::Duplicate(entry.key().to_string()))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(record.clone());
                Ok(record)
            }
            Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(record)
            }
        }
    }

    /// Move a task to `phase`
    ///
    /// Returns `false` if the task is unknown or already terminal.
    pub fn update(&self, key: &TaskKey, phase: Phase) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) if !record.is_terminal() => {
                record.phase = phase;
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Flag that the evaluator could not be notified
    pub fn mark_notification_failed(&self, key: &TaskKey) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.notification_failed = true;
        }
    }

    /// Finish a task with `outcome`
    ///
    /// Returns `false` if the task is unknown or already terminal.
    pub fn complete(&self, key: &TaskKey, outcome: Outcome) -> bool {
        let now = Utc::now();
        {
            let Some(mut record) = self.records.get_mut(key) else {
                return false;
            };
            if record.is_terminal() {
                return false;
            }
            record.phase = if outcome.is_success() {
                Phase::Completed
            } else {
                Phase::Failed
            };
            record.outcome = Some(outcome);
            record.updated_at = now;
        }

        let mut retention = self.retention.lock();
        retention.finished.push_back((key.clone(), now));
        retention.last_completed = Some(key.clone());
        self.evict(&mut retention, now);
        true
    }

    fn evict(&self, retention: &mut Retention, now: DateTime<Utc>) {
        let cutoff = now.checked_sub_signed(self.max_age);
        while let Some((key, finished_at)) = retention.finished.front().cloned() {
            let too_many = retention.finished.len() > self.max_records;
            let too_old = cutoff.is_some_and(|c| finished_at < c);
            if !too_many && !too_old {
                break;
            }
            retention.finished.pop_front();
            // Skip stale queue entries for keys that were re-admitted since.
            self.records
                .remove_if(&key, |_, r| r.is_terminal() && r.updated_at == finished_at);
            if retention.last_completed.as_ref() == Some(&key) && !self.records.contains_key(&key) {
                retention.last_completed = None;
            }
        }
    }

    /// Copy of one record
    #[must_use]
    pub fn get(&self, key: &TaskKey) -> Option<TaskRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Copy of every record, oldest admission first
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)));
        records
    }

    /// Most recently finished task still retained
    #[must_use]
    pub fn last_completed(&self) -> Option<TaskRecord> {
        let key = self.retention.lock().last_completed.clone()?;
        self.get(&key).filter(TaskRecord::is_terminal)
    }

    /// Number of non-terminal records
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.records.iter().filter(|r| !r.is_terminal()).count()
    }

    /// Number of retained records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(&RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(id: &str) -> TaskKey {
        TaskKey::new(id, 1)
    }

    #[test]
    fn lifecycle_updates_phase_and_outcome() {
        let registry = TaskRegistry::default();
        let k = key("calc");

        let record = registry.record(k.clone());
        assert_eq!(record.phase, Phase::Admitted);

        assert!(registry.update(&k, Phase::Generating));
        assert_eq!(registry.get(&k).unwrap().phase, Phase::Generating);

        assert!(registry.complete(&k, Outcome::SuccessWithFallback));
        let record = registry.get(&k).unwrap();
        assert_eq!(record.phase, Phase::Completed);
        assert_eq!(record.outcome, Some(Outcome::SuccessWithFallback));
        assert_eq!(registry.last_completed().unwrap().key, k);

        // Terminal records are frozen.
        assert!(!registry.update(&k, Phase::Publishing));
        assert!(!registry.complete(&k, Outcome::Success));
    }

    #[test]
    fn failed_outcome_sets_failed_phase() {
        let registry = TaskRegistry::default();
        let k = key("broken");
        registry.record(k.clone());
        registry.complete(
            &k,
            Outcome::Failed {
                reason: "content policy".into(),
            },
        );
        assert_eq!(registry.get(&k).unwrap().phase, Phase::Failed);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let registry = TaskRegistry::default();
        assert!(!registry.update(&key("ghost"), Phase::Verifying));
        assert!(!registry.complete(&key("ghost"), Outcome::Success));
        assert!(registry.last_completed().is_none());
    }

    #[test]
    fn duplicate_in_flight_is_rejected() {
        let registry = TaskRegistry::default();
        let k = key("dup");
        registry.try_record(k.clone()).unwrap();
        assert!(matches!(registry.try_record(k.clone()), Err(GateError::Duplicate(_))));

        registry.complete(&k, Outcome::Success);
        assert!(registry.try_record(k).is_ok());
    }

    #[test]
    fn eviction_keeps_bounded_terminal_records() {
        let registry = TaskRegistry::new(&RegistryConfig {
            max_records: 2,
            max_age_secs: 3600,
        });
        registry.record(key("running"));
        for id in ["a", "b", "c"] {
            registry.record(key(id));
            registry.complete(&key(id), Outcome::Success);
        }

        assert!(registry.get(&key("a")).is_none());
        assert!(registry.get(&key("b")).is_some());
        assert!(registry.get(&key("c")).is_some());
        // In-flight records are never evicted.
        assert!(registry.get(&key("running")).is_some());
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn zero_max_age_evicts_terminal_records_only() {
        let registry = TaskRegistry::new(&RegistryConfig {
            max_records: 10,
            max_age_secs: 0,
        });
        registry.record(key("running"));
        registry.record(key("done"));
        registry.complete(&key("done"), Outcome::Success);
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.record(key("next"));
        registry.complete(&key("next"), Outcome::Success);

        assert!(registry.get(&key("done")).is_none());
        assert!(registry.get(&key("running")).is_some());
    }

    #[test]
    fn readmitted_key_survives_stale_eviction_entry() {
        let registry = TaskRegistry::new(&RegistryConfig {
            max_records: 1,
            max_age_secs: 3600,
        });
        let k = key("repeat");
        registry.record(k.clone());
        registry.complete(&k, Outcome::Success);
        registry.try_record(k.clone()).unwrap();

        registry.record(key("other"));
        registry.complete(&key("other"), Outcome::Success);

        assert_eq!(registry.get(&k).unwrap().phase, Phase::Admitted);
    }

    #[test]
    fn snapshot_orders_by_admission() {
        let registry = TaskRegistry::default();
        registry.record(key("first"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.record(key("second"));
        let ids: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|r| r.key.id.to_string())
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let registry = Arc::new(TaskRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let k = TaskKey::new(format!("t{i}-{j}"), 1);
                        registry.record(k.clone());
                        registry.update(&k, Phase::Publishing);
                        let _ = registry.snapshot();
                        registry.complete(&k, Outcome::Success);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.in_flight(), 0);
        assert_eq!(registry.len(), 400);
    }
}
