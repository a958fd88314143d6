//! Exactly-once verification for pipeline stages.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::thread;

use parking_lot::Mutex;

/// Records which thread handled each message id at each stage.
///
/// Stages are plain indices (0 = filter, 1 = output by convention).
pub struct DeliveryLedger {
    stages: Vec<Mutex<BTreeMap<u64, Vec<String>>>>,
}

impl DeliveryLedger {
    pub fn new(stages: usize) -> Self {
        Self {
            stages: (0..stages).map(|_| Mutex::new(BTreeMap::new())).collect(),
        }
    }

    /// Record `id` at `stage`, attributed to the current thread's name.
    pub fn record(&self, stage: usize, id: u64) {
        let worker = thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", thread::current().id()));
        self.record_as(stage, id, worker);
    }

    pub fn record_as(&self, stage: usize, id: u64, worker: impl Into<String>) {
        self.stages[stage]
            .lock()
            .entry(id)
            .or_default()
            .push(worker.into());
    }

    /// Has `stage` seen `id` at least once?
    pub fn contains(&self, stage: usize, id: u64) -> bool {
        self.stages[stage].lock().contains_key(&id)
    }

    pub fn count(&self, stage: usize) -> usize {
        self.stages[stage].lock().values().map(Vec::len).sum()
    }

    /// Compare what `stage` saw against the ids it should have seen.
    pub fn report(&self, stage: usize, expected: Range<u64>) -> LedgerReport {
        let seen = self.stages[stage].lock();
        let mut report = LedgerReport::default();

        for (&id, workers) in seen.iter() {
            if !expected.contains(&id) {
                report.unexpected.push(id);
            }
            if workers.len() > 1 {
                report.duplicates.push(id);
            }
            for worker in workers {
                *report.per_worker.entry(worker.clone()).or_insert(0) += 1;
            }
            report.seen += workers.len() as u64;
        }
        report.missing = expected.filter(|id| !seen.contains_key(id)).collect();
        report
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerReport {
    /// Total records, duplicates included.
    pub seen: u64,
    pub duplicates: Vec<u64>,
    pub missing: Vec<u64>,
    pub unexpected: Vec<u64>,
    pub per_worker: HashMap<String, u64>,
}

impl LedgerReport {
    /// Every expected id exactly once, nothing else.
    pub fn is_exact(&self) -> bool {
        self.duplicates.is_empty() && self.missing.is_empty() && self.unexpected.is_empty()
    }
}
