//! Wait strategies for idle workers and blocked producers.
//!
//! - `BusySpinning` - spin loop hint only (lowest latency, burns a core)
//! - `Yielding` - spin, then `thread::yield_now`
//! - `Sleeping` - spin, yield, then short sleeps
//! - `Blocking` - park on a condvar until the awaited cursor moves

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

const SPIN_TRIES: u32 = 100;
const YIELD_TRIES: u32 = 100;
const SLEEP_INTERVAL: Duration = Duration::from_micros(100);
/// Upper bound on a single condvar park. A missed wakeup only costs latency.
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    #[default]
    Blocking,
    Sleeping,
    Yielding,
    BusySpinning,
}

/// Wakeup channel attached to a cursor. Notified whenever the cursor advances.
///
/// `notify` only takes the lock when somebody is parked, so the hot path is a
/// single atomic load.
#[derive(Default)]
pub struct Signal {
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    fn park_until<F: Fn() -> bool>(&self, ready: F) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        {
            let mut guard = self.lock.lock();
            if !ready() {
                let _ = self.cond.wait_for(&mut guard, PARK_TIMEOUT);
            }
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-thread progressive backoff driven by a `WaitStrategy`.
pub struct Backoff {
    strategy: WaitStrategy,
    step: u32,
}

impl Backoff {
    pub fn new(strategy: WaitStrategy) -> Self {
        Self { strategy, step: 0 }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Wait one step. Returns early (or immediately) when `ready` holds.
    pub fn wait<F: Fn() -> bool>(&mut self, signal: &Signal, ready: F) {
        if ready() {
            return;
        }
        match self.strategy {
            WaitStrategy::BusySpinning => std::hint::spin_loop(),
            WaitStrategy::Yielding => {
                if self.step < SPIN_TRIES {
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            WaitStrategy::Sleeping => {
                if self.step < SPIN_TRIES {
                    std::hint::spin_loop();
                } else if self.step < SPIN_TRIES + YIELD_TRIES {
                    thread::yield_now();
                } else {
                    thread::sleep(SLEEP_INTERVAL);
                }
            }
            WaitStrategy::Blocking => {
                if self.step < SPIN_TRIES {
                    std::hint::spin_loop();
                } else {
                    signal.park_until(ready);
                }
            }
        }
        self.step = self.step.saturating_add(1);
    }
}
