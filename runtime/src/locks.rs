//! Keyed mutual exclusion.
//!
//! A single map lock guards slot lookup; each key then has its own async
//! mutex held for the critical section. Slots are dropped once nobody holds
//! or waits on them, so the map only contains in-flight keys.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = HashMap<String, Arc<AsyncMutex<()>>>;

/// Map of per-key async locks.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<Slots>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    ///
    /// Dropping the returned future before it completes gives up the wait
    /// and leaves no slot behind.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let waiting = Waiting {
            key,
            slots: &self.slots,
            slot: self.slot(key),
        };
        let guard = waiting.slot.clone().lock_owned().await;
        drop(waiting);
        KeyedGuard {
            key: key.to_string(),
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Take `key` if it is free right now.
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        match slot.try_lock_owned() {
            Ok(guard) => Some(KeyedGuard {
                key: key.to_string(),
                slots: self.slots.clone(),
                guard: Some(guard),
            }),
            Err(_) => None,
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.slots
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Whether `key` is currently held or awaited.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `lock` call that has not acquired its slot yet.
struct Waiting<'a> {
    key: &'a str,
    slots: &'a Mutex<Slots>,
    slot: Arc<AsyncMutex<()>>,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        // Only the map and this waiter still refer to the slot.
        if let Some(current) = slots.get(self.key) {
            if Arc::ptr_eq(current, &self.slot) && Arc::strong_count(&self.slot) == 2 {
                slots.remove(self.key);
            }
        }
    }
}

/// Held lock on one key; released on drop.
pub struct KeyedGuard {
    key: String,
    slots: Arc<Mutex<Slots>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        // Release first so the strong count only reflects the map and waiters.
        self.guard.take();
        if let Some(slot) = slots.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}
