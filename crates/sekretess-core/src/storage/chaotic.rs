//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to test that persistence
//! drift is surfaced instead of corrupting in-memory state.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use super::{
    BroadcastSessionStore, IdentityStore, SessionStore, StorageError, StoredBroadcastSession,
    StoredIdentity, StoredSession,
};
use crate::address::DistributionId;

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but randomly fails
/// operations based on a configured failure rate. Clones share the RNG and
/// the operation counter.
#[derive(Clone)]
pub struct ChaoticStorage<S> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// Only fail mutating operations
    writes_only: bool,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, reproducible for a given seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            writes_only: false,
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Restrict failures to saves and deletes; loads always succeed.
    #[must_use]
    pub fn writes_only(mut self) -> Self {
        self.writes_only = true;
        self
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn inject(&self, is_write: bool) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        if self.writes_only && !is_write {
            return Ok(());
        }

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: IdentityStore> IdentityStore for ChaoticStorage<S> {
    fn load_identity(&self, name: &str) -> Result<Option<StoredIdentity>, StorageError> {
        self.inject(false)?;
        self.inner.load_identity(name)
    }

    fn save_identity(
        &self,
        name: &str,
        key_pair: &[u8],
        registration_id: u32,
    ) -> Result<(), StorageError> {
        self.inject(true)?;
        self.inner.save_identity(name, key_pair, registration_id)
    }
}

impl<S: SessionStore> SessionStore for ChaoticStorage<S> {
    fn save_session(
        &self,
        name: &str,
        device_id: u32,
        record: &[u8],
    ) -> Result<(), StorageError> {
        self.inject(true)?;
        self.inner.save_session(name, device_id, record)
    }

    fn load_sessions(&self) -> Result<Vec<StoredSession>, StorageError> {
        self.inject(false)?;
        self.inner.load_sessions()
    }

    fn delete_session(&self, name: &str) -> Result<(), StorageError> {
        self.inject(true)?;
        self.inner.delete_session(name)
    }
}

impl<S: BroadcastSessionStore> BroadcastSessionStore for ChaoticStorage<S> {
    fn save_broadcast_session(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        sender_key_record: &[u8],
    ) -> Result<(), StorageError> {
        self.inject(true)?;
        self.inner.save_broadcast_session(name, device_id, distribution_id, sender_key_record)
    }

    fn save_distribution_message(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        distribution_message: &[u8],
    ) -> Result<(), StorageError> {
        self.inject(true)?;
        self.inner.save_distribution_message(name, device_id, distribution_id, distribution_message)
    }

    fn load_broadcast_session(
        &self,
        name: &str,
    ) -> Result<Option<StoredBroadcastSession>, StorageError> {
        self.inject(false)?;
        self.inner.load_broadcast_session(name)
    }
}
