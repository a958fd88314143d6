//! Fault injection for filters and sinks.
//!
//! Faults are keyed by message id. Fixed faults always fire for their id;
//! probabilistic ones are rolled per call from a seeded RNG so a failing run
//! can be replayed.
//!
//! ```
//! use sluice_test_support::chaos::{Fault, FaultInjector};
//! use std::time::Duration;
//!
//! let faults = FaultInjector::new()
//!     .with_fault(2, Fault::Fail)
//!     .with_fault(5, Fault::Delay(Duration::from_millis(1)));
//!
//! assert!(faults.check(1).is_ok());
//! assert!(faults.check(2).is_err());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `check` returns an error.
    Fail,
    /// `check` panics.
    Panic,
    /// `check` sleeps, then succeeds.
    Delay(Duration),
}

pub struct FaultInjector {
    fixed: HashMap<u64, Fault>,
    fail_probability: f64,
    panic_probability: f64,
    delay_probability: f64,
    delay_min_us: u64,
    delay_max_us: u64,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::seeded(rand::thread_rng().gen())
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            fixed: HashMap::new(),
            fail_probability: 0.0,
            panic_probability: 0.0,
            delay_probability: 0.0,
            delay_min_us: 100,
            delay_max_us: 10_000,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            injected: AtomicU64::new(0),
        }
    }

    pub fn with_fault(mut self, id: u64, fault: Fault) -> Self {
        self.fixed.insert(id, fault);
        self
    }

    pub fn with_fail_probability(mut self, prob: f64) -> Self {
        self.fail_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_panic_probability(mut self, prob: f64) -> Self {
        self.panic_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay_probability(mut self, prob: f64) -> Self {
        self.delay_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay_range(mut self, min_us: u64, max_us: u64) -> Self {
        self.delay_min_us = min_us;
        self.delay_max_us = max_us.max(min_us);
        self
    }

    /// The fault (if any) that fires for `id` on this call.
    pub fn decide(&self, id: u64) -> Option<Fault> {
        if let Some(fault) = self.fixed.get(&id) {
            return Some(*fault);
        }

        let mut rng = self.rng.lock();
        let roll = rng.gen::<f64>();
        let mut threshold = self.fail_probability;
        if roll < threshold {
            return Some(Fault::Fail);
        }
        threshold += self.panic_probability;
        if roll < threshold {
            return Some(Fault::Panic);
        }
        threshold += self.delay_probability;
        if roll < threshold {
            let delay_us = rng.gen_range(self.delay_min_us..=self.delay_max_us);
            return Some(Fault::Delay(Duration::from_micros(delay_us)));
        }
        None
    }

    /// Apply the fault for `id`: `Err` on `Fail`, panic on `Panic`, sleep on
    /// `Delay`.
    pub fn check(&self, id: u64) -> Result<(), String> {
        let Some(fault) = self.decide(id) else {
            return Ok(());
        };
        self.injected.fetch_add(1, Ordering::Relaxed);
        match fault {
            Fault::Fail => Err(format!("injected failure for message {}", id)),
            Fault::Panic => panic!("injected panic for message {}", id),
            Fault::Delay(delay) => {
                std::thread::sleep(delay);
                Ok(())
            }
        }
    }

    /// Number of faults fired so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }
}
