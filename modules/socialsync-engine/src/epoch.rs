//! Per-key generation counters for cooperative cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use socialsync_common::{SyncError, SyncResult};

/// A captured generation. Stale once the key has been advanced past it.
#[derive(Debug, Clone)]
pub struct EpochToken {
    key: String,
    epoch: u64,
    counter: Arc<AtomicU64>,
}

impl EpochToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.epoch
    }

    /// `Err(Superseded)` once a newer generation exists.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(SyncError::Superseded)
        }
    }
}

#[derive(Default)]
pub struct EpochRegistry {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl EpochRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, key: &str) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            counters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Start a new generation, invalidating every earlier token for `key`.
    pub fn advance(&self, key: &str) -> EpochToken {
        let counter = self.get_or_create(key);
        let epoch = counter.fetch_add(1, Ordering::SeqCst) + 1;
        EpochToken {
            key: key.to_string(),
            epoch,
            counter,
        }
    }

    /// Capture the current generation without starting a new one.
    pub fn current(&self, key: &str) -> EpochToken {
        let counter = self.get_or_create(key);
        let epoch = counter.load(Ordering::SeqCst);
        EpochToken {
            key: key.to_string(),
            epoch,
            counter,
        }
    }

    /// Invalidate outstanding tokens for `key` without handing out a new one.
    pub fn cancel(&self, key: &str) {
        self.get_or_create(key).fetch_add(1, Ordering::SeqCst);
    }
}
