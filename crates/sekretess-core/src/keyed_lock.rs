//! Per-key mutual exclusion.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

/// A map of mutexes keyed by name.
///
/// Work for one key is serialized; different keys proceed in parallel.
/// Slots are removed once no caller holds or waits on them.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Run `f` while holding the lock for `key`.
    ///
    /// A panic inside `f` poisons nothing: the guarded value is `()`.
    pub(crate) fn with<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let slot = self.slot(key);
        let result = {
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        self.release(key, &slot);
        result
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    fn release(&self, key: &str, slot: &Arc<Mutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry plus our clone
        if Arc::strong_count(slot) == 2 {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
