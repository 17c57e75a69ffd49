//! Deterministic environment.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use rand::RngCore;
use rand_chacha::{ChaCha20Rng, rand_core::SeedableRng};
use sekretess_core::Environment;

/// Seeded ChaCha20 randomness and a manually advanced clock.
///
/// Clones share the RNG and the clock.
#[derive(Clone)]
pub struct TestEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    clock: Arc<AtomicU64>,
}

impl TestEnv {
    /// Create an environment from `seed`, with the clock at zero.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.clock.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Environment for TestEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("Mutex poisoned").fill_bytes(buffer);
    }

    fn wall_clock_secs(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }
}
