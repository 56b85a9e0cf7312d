//! Simulated environment.
//!
//! Seeded ChaCha20 randomness and a virtual clock that only moves when the
//! test advances it. Two runs with the same seed and the same event order
//! produce byte-identical envelopes.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    ops::Sub,
    sync::{Arc, Mutex},
    time::Duration,
};

use cairn_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Point on the virtual clock, measured from the start of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time elapsed since the simulation started.
    pub fn since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Deterministic environment for simulation.
///
/// Clones share the RNG stream and the clock.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    clock: Arc<Mutex<Duration>>,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            clock: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move the virtual clock forward.
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn advance(&self, duration: Duration) {
        let mut clock = self.clock.lock().expect("clock mutex poisoned");
        *clock += duration;
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    #[allow(clippy::expect_used)]
    fn now(&self) -> SimInstant {
        SimInstant(*self.clock.lock().expect("clock mutex poisoned"))
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("rng mutex poisoned").fill_bytes(buffer);
    }
}
