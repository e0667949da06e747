use crate::config::ModelConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Round-robin start offsets, one cursor per load-balance key.
pub trait RotationStore: Send + Sync {
    /// Returns the current cursor for `key` and advances it by one, modulo `len`.
    /// Concurrent callers on the same key always observe distinct consecutive values.
    fn advance(&self, key: &str, len: usize) -> usize;
}

/// Monotonic per-model counters used to pick the next upstream API key.
pub trait KeyCursorStore: Send + Sync {
    /// Returns the counter for `identity` and increments it.
    fn next(&self, identity: &str) -> u64;
}

#[derive(Debug, Default)]
pub struct MemoryRotationStore {
    cursors: DashMap<String, Arc<Mutex<usize>>>,
}

impl MemoryRotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<usize>> {
        if let Some(slot) = self.cursors.get(key) {
            return slot.clone();
        }
        self.cursors.entry(key.to_string()).or_default().clone()
    }
}

impl RotationStore for MemoryRotationStore {
    fn advance(&self, key: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let slot = self.slot(key);
        let mut cursor = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *cursor % len;
        *cursor = (start + 1) % len;
        start
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyCursorStore {
    counters: DashMap<String, AtomicU64>,
}

impl MemoryKeyCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyCursorStore for MemoryKeyCursorStore {
    fn next(&self, identity: &str) -> u64 {
        if let Some(counter) = self.counters.get(identity) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(identity.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// Picks upstream API keys round robin from a model's key pool.
#[derive(Clone)]
pub struct KeyRotator {
    store: Arc<dyn KeyCursorStore>,
}

impl KeyRotator {
    pub fn new(store: Arc<dyn KeyCursorStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyCursorStore::new()))
    }

    /// Returns `None` without touching the cursor when the pool is empty.
    pub fn next_key<'a>(&self, model: &'a ModelConfig) -> Option<&'a str> {
        let keys = &model.provider_api_key;
        if keys.is_empty() {
            return None;
        }
        let n = self.store.next(&model.identity());
        let index = (n % keys.len() as u64) as usize;
        keys.get(index).map(String::as_str)
    }
}
