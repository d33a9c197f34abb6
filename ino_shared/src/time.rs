use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source in seconds, shared by samplers and control ticks.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> f64;
}

/// Clock backed by `std::time::Instant`, counting from its creation.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn monotonic(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock moved by hand, for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self { bits: AtomicU64::new(start.to_bits()) }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) {
        self.set(self.monotonic() + dt);
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
