//! Environment abstraction for deterministic testing.
//!
//! Decouples key generation and token expiry from system resources. Tests
//! inject a seeded environment; production uses [`SystemEnv`].

/// Source of randomness and wall-clock time.
///
/// # Safety
///
/// Implementations MUST guarantee that `random_bytes()` uses cryptographically
/// secure entropy in production. Identity keys, prekey agreement ephemerals,
/// sender keys and nonces are all drawn from it.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Current wall-clock time as seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> u64;

    /// Generates a random `u32`.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// Generates 32 random bytes, the size of every key seed in the engine.
    fn random_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        self.random_bytes(&mut seed);
        seed
    }
}

/// Production environment using the OS RNG and system clock.
///
/// # Panics
///
/// Panics if the OS RNG fails. A business without functioning cryptographic
/// randomness cannot generate keys or nonces safely.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }

    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }
}
